use anyhow::Result;
use fusekit::arith;
use fusekit::ir::{DataType, ParallelType};
use fusekit::{lower, Fusion, LowerConfig, ValId};
use fusekit_ref_cpu::{run_kernel, HostTensor, KernelArg, LaunchConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TOLERANCE: f32 = 1e-4;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_tensor(rng: &mut StdRng, shape: &[usize]) -> HostTensor {
    let len = shape.iter().product();
    let data = (0..len).map(|_| rng.gen::<f32>()).collect();
    HostTensor::new(shape.to_vec(), data).expect("shape matches data")
}

fn assert_close(actual: &HostTensor, expected: &[f32], shape: &[usize]) {
    assert_eq!(actual.shape, shape);
    assert_eq!(actual.data.len(), expected.len());
    for (index, (a, e)) in actual.data.iter().zip(expected).enumerate() {
        let scale = e.abs().max(1.0);
        assert!(
            (a - e).abs() <= TOLERANCE * scale,
            "element {index}: got {a}, expected {e}"
        );
    }
}

fn row_sums(input: &HostTensor) -> Vec<f32> {
    let cols = input.shape[1];
    input
        .data
        .chunks(cols)
        .map(|row| row.iter().sum())
        .collect()
}

/// `t3 = t0 + (t1 + 2.0)`.
fn elementwise() -> (Fusion, [ValId; 4]) {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    let t1 = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(t0).expect("input");
    fusion.add_input(t1).expect("input");
    let two = fusion.new_float(2.0);
    let t2 = arith::add(&mut fusion, t1, two).expect("add");
    let t3 = arith::add(&mut fusion, t0, t2).expect("add");
    fusion.add_output(t3).expect("output");
    (fusion, [t0, t1, t2, t3])
}

fn elementwise_expected(a: &HostTensor, b: &HostTensor) -> Vec<f32> {
    a.data.iter().zip(&b.data).map(|(x, y)| x + (y + 2.0)).collect()
}

/// `t1 = sum(t0, [1])`.
fn row_sum() -> (Fusion, ValId, ValId) {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(t0).expect("input");
    let t1 = arith::sum(&mut fusion, t0, &[1]).expect("sum");
    fusion.add_output(t1).expect("output");
    (fusion, t0, t1)
}

#[test]
fn computed_at_elementwise_matches_host_math() -> Result<()> {
    init_logging();
    let (mut fusion, [t0, t1, _, t3]) = elementwise();
    fusion.split(t3, 0, 4)?;
    fusion.compute_at(t0, t3, 1)?;
    fusion.compute_at(t1, t3, 1)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;

    let mut rng = StdRng::seed_from_u64(7);
    let shape = [129, 127];
    let a = random_tensor(&mut rng, &shape);
    let b = random_tensor(&mut rng, &shape);
    let expected = elementwise_expected(&a, &b);

    let outputs = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(a), KernelArg::Tensor(b)],
    )?;
    assert_eq!(outputs.len(), 1);
    assert_close(&outputs[0], &expected, &shape);
    Ok(())
}

#[test]
fn thread_bound_elementwise_matches_host_math() -> Result<()> {
    let (mut fusion, [_, _, t2, t3]) = elementwise();
    fusion.split(t3, 0, 4)?;
    fusion.parallelize(t3, 0, ParallelType::BIDx)?;
    fusion.parallelize(t3, 1, ParallelType::TIDx)?;
    fusion.compute_at(t2, t3, 1)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;

    let mut rng = StdRng::seed_from_u64(11);
    let shape = [30, 9];
    let a = random_tensor(&mut rng, &shape);
    let b = random_tensor(&mut rng, &shape);
    let expected = elementwise_expected(&a, &b);

    // 8 blocks of 4 threads cover 32 rows; the last two are masked off.
    let launch = LaunchConfig::new([8, 1, 1], [4, 1, 1]);
    let outputs = run_kernel(
        &fusion,
        &kernel,
        &launch,
        vec![KernelArg::Tensor(a), KernelArg::Tensor(b)],
    )?;
    assert_close(&outputs[0], &expected, &shape);
    Ok(())
}

#[test]
fn scalar_inputs_are_read_from_arguments() -> Result<()> {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    let scale = fusion.new_symbolic(DataType::Float);
    fusion.add_input(t0)?;
    fusion.add_input(scale)?;
    let t1 = arith::mul(&mut fusion, t0, scale)?;
    fusion.add_output(t1)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;

    let mut rng = StdRng::seed_from_u64(3);
    let a = random_tensor(&mut rng, &[5, 6]);
    let expected: Vec<f32> = a.data.iter().map(|x| x * 0.5).collect();
    let outputs = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(a), KernelArg::Float(0.5)],
    )?;
    assert_close(&outputs[0], &expected, &[5, 6]);
    Ok(())
}

#[test]
fn broadcast_operands_repeat_along_new_axes() -> Result<()> {
    let mut fusion = Fusion::new();
    let row = fusion.new_tensor(1, DataType::Float);
    let matrix = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(row)?;
    fusion.add_input(matrix)?;
    let wide = arith::broadcast(&mut fusion, row, &[true, false])?;
    let out = arith::add(&mut fusion, wide, matrix)?;
    fusion.add_output(out)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;

    let mut rng = StdRng::seed_from_u64(5);
    let r = random_tensor(&mut rng, &[7]);
    let m = random_tensor(&mut rng, &[4, 7]);
    let expected: Vec<f32> = m
        .data
        .iter()
        .enumerate()
        .map(|(i, x)| x + r.data[i % 7])
        .collect();
    let outputs = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(r), KernelArg::Tensor(m)],
    )?;
    assert_close(&outputs[0], &expected, &[4, 7]);
    Ok(())
}

#[test]
fn serial_reduction_matches_host_sum() -> Result<()> {
    let (mut fusion, _, _) = row_sum();
    let kernel = lower(&mut fusion, &LowerConfig::default())?;

    let mut rng = StdRng::seed_from_u64(13);
    let a = random_tensor(&mut rng, &[7, 13]);
    let expected = row_sums(&a);
    let outputs = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(a)],
    )?;
    assert_close(&outputs[0], &expected, &[7]);
    Ok(())
}

#[test]
fn block_reduction_masks_idle_threads() -> Result<()> {
    init_logging();
    let (mut fusion, _, t1) = row_sum();
    fusion.parallelize(t1, 0, ParallelType::BIDx)?;
    fusion.parallelize(t1, 1, ParallelType::TIDx)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;
    assert!(kernel.has_block_reduction);

    let mut rng = StdRng::seed_from_u64(17);
    let a = random_tensor(&mut rng, &[6, 5]);
    let expected = row_sums(&a);
    let launch = LaunchConfig::new([6, 1, 1], [8, 1, 1]);
    let outputs = run_kernel(&fusion, &kernel, &launch, vec![KernelArg::Tensor(a)])?;
    assert_close(&outputs[0], &expected, &[6]);
    Ok(())
}

#[test]
fn rfactored_reduction_matches_host_sum() -> Result<()> {
    let (mut fusion, _, t1) = row_sum();
    fusion.split(t1, 1, 4)?;
    fusion.rfactor(t1, &[1])?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;

    let mut rng = StdRng::seed_from_u64(19);
    let a = random_tensor(&mut rng, &[5, 37]);
    let expected = row_sums(&a);
    let outputs = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(a)],
    )?;
    assert_close(&outputs[0], &expected, &[5]);
    Ok(())
}

#[test]
fn rfactored_reduction_computed_at_its_consumer() -> Result<()> {
    let (mut fusion, _, t1) = row_sum();
    fusion.split(t1, 1, 4)?;
    let partial = fusion.rfactor(t1, &[1])?;
    fusion.compute_at(partial, t1, 1)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;
    let source = kernel.to_source(&fusion)?;
    assert!(source.contains("float T2[4];"), "{source}");

    let mut rng = StdRng::seed_from_u64(23);
    let a = random_tensor(&mut rng, &[5, 37]);
    let expected = row_sums(&a);
    let outputs = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(a)],
    )?;
    assert_close(&outputs[0], &expected, &[5]);
    Ok(())
}

#[test]
fn grid_reduction_combines_blocks() -> Result<()> {
    let (mut fusion, _, t1) = row_sum();
    fusion.split(t1, 1, 4)?;
    fusion.parallelize(t1, 1, ParallelType::BIDx)?;
    fusion.parallelize(t1, 2, ParallelType::TIDx)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;
    assert!(kernel.has_grid_reduction);

    let mut rng = StdRng::seed_from_u64(29);
    let a = random_tensor(&mut rng, &[3, 10]);
    let expected = row_sums(&a);
    let launch = LaunchConfig::new([3, 1, 1], [4, 1, 1]);
    let outputs = run_kernel(&fusion, &kernel, &launch, vec![KernelArg::Tensor(a)])?;
    assert_close(&outputs[0], &expected, &[3]);
    Ok(())
}

#[test]
fn argument_mismatches_are_rejected() -> Result<()> {
    let (mut fusion, _) = elementwise();
    let kernel = lower(&mut fusion, &LowerConfig::default())?;
    let mut rng = StdRng::seed_from_u64(31);
    let a = random_tensor(&mut rng, &[3, 4]);

    let err = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(a.clone())],
    )
    .expect_err("missing argument");
    assert!(err.to_string().contains("argument"), "{err}");

    let err = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(a), KernelArg::Float(1.0)],
    )
    .expect_err("scalar for a tensor");
    assert!(!err.to_string().is_empty());

    let err = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::new([0, 1, 1], [1, 1, 1]),
        Vec::new(),
    )
    .expect_err("empty grid");
    assert!(!err.to_string().is_empty());
    Ok(())
}

#[test]
fn random_kernels_are_not_executed() -> Result<()> {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(1, DataType::Float);
    fusion.add_input(t0)?;
    let t1 = arith::rand_like(&mut fusion, t0)?;
    fusion.add_output(t1)?;
    let kernel = lower(&mut fusion, &LowerConfig::default())?;
    let tensor = HostTensor::zeros(vec![4]);
    let result = run_kernel(
        &fusion,
        &kernel,
        &LaunchConfig::default(),
        vec![KernelArg::Tensor(tensor)],
    );
    assert!(result.is_err());
    Ok(())
}
