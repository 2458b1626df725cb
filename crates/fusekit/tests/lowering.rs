use fusekit::arith;
use fusekit::ir::{BinaryOpType, DataType, ParallelType};
use fusekit::lower::{KernelNode, LoweredOp};
use fusekit::{lower, Fusion, FusionError, LowerConfig, ValId};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> LowerConfig {
    LowerConfig::default().with_kernel_name("kernel1")
}

/// `t3 = t0 + (t1 + 2.0)` over 2-D inputs.
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

/// `t1 = sum(t0, [1])` over a 2-D input.
fn row_sum() -> (Fusion, ValId, ValId) {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(t0).expect("input");
    let t1 = arith::sum(&mut fusion, t0, &[1]).expect("sum");
    fusion.add_output(t1).expect("output");
    (fusion, t0, t1)
}

fn count_loops(nodes: &[KernelNode]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            KernelNode::ForLoop { body, .. } => 1 + count_loops(body),
            KernelNode::IfThenElse {
                then_body,
                else_body,
                ..
            } => count_loops(then_body) + count_loops(else_body),
            KernelNode::Allocate { .. } | KernelNode::Expr(_) => 0,
        })
        .sum()
}

#[test]
fn unscheduled_elementwise_kernel() {
    init_logging();
    let (mut fusion, [t0, t1, _, t3]) = elementwise();
    let kernel = lower(&mut fusion, &config()).expect("lower");
    assert_eq!(kernel.params, vec![t0, t1, t3]);
    assert_eq!(count_loops(&kernel.body), 4);
    assert!(!kernel.has_rng && !kernel.has_block_reduction && !kernel.has_grid_reduction);

    let source = kernel.to_source(&fusion).expect("source");
    assert!(
        source.starts_with(
            "__global__ void kernel1(Tensor<float, 2> T0, Tensor<float, 2> T1, Tensor<float, 2> T3){\n"
        ),
        "{source}"
    );
    assert!(source.contains("  float T2[( T1.size[0] * T1.size[1] )];\n"), "{source}");
    assert!(source.contains("< T1.size[0]; ++i"), "{source}");
    assert!(source.contains("< T0.size[1]; ++i"), "{source}");
    assert!(source.contains(" + float(2);\n"), "{source}");
    assert!(source.contains("T0.stride[1]"), "{source}");
    assert!(!source.contains("if ("), "{source}");
    assert!(!source.contains("shared_mem"), "{source}");
    assert!(source.ends_with("}\n"), "{source}");
}

#[test]
fn split_axes_are_predicated() {
    let (mut fusion, [t0, t1, _, t3]) = elementwise();
    fusion.split(t3, 0, 4).expect("split");
    fusion.compute_at(t0, t3, 1).expect("compute t0");
    fusion.compute_at(t1, t3, 1).expect("compute t1");

    let kernel = lower(&mut fusion, &config()).expect("lower");
    // One shared outer loop; T2 and T3 each iterate their two inner axes.
    assert_eq!(count_loops(&kernel.body), 5);
    let source = kernel.to_source(&fusion).expect("source");
    assert!(source.contains("ceilDiv(T0.size[0], 4)"), "{source}");
    assert!(source.contains("if ( ( "), "{source}");
    assert!(source.contains(" < T0.size[0] ) ) {"), "{source}");
    assert_eq!(source.matches("float T2[").count(), 1, "{source}");
}

#[test]
fn unrolled_axes_get_a_pragma() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(1, DataType::Float);
    fusion.add_input(t0).expect("input");
    let t1 = arith::neg(&mut fusion, t0).expect("neg");
    fusion.add_output(t1).expect("output");
    fusion.split(t1, 0, 4).expect("split");
    fusion.parallelize(t1, -1, ParallelType::Unroll).expect("unroll");

    let source = fusion.print_kernel().expect("source");
    assert_eq!(source.matches("#pragma unroll").count(), 1, "{source}");
    assert!(source.contains(" = -T0[ "), "{source}");
}

#[test]
fn block_reduction_kernel() {
    let (mut fusion, _, t1) = row_sum();
    fusion.parallelize(t1, 0, ParallelType::BIDx).expect("bind");
    fusion.parallelize(t1, 1, ParallelType::TIDx).expect("bind");

    let kernel = lower(&mut fusion, &config()).expect("lower");
    assert!(kernel.has_block_reduction);
    assert!(!kernel.has_grid_reduction);
    assert_eq!(count_loops(&kernel.body), 0);
    assert!(kernel
        .reduction_ops
        .contains(&(BinaryOpType::Add, DataType::Float)));

    let source = kernel.to_source(&fusion).expect("source");
    assert!(
        source.starts_with("__device__ void reduction_add_float(float& a, const float b) {\n  a = a + b;\n}\n"),
        "{source}"
    );
    assert!(source.contains("  __shared__ float shared_mem[1024];\n"), "{source}");
    assert!(
        source.contains("T1[ ( blockIdx.x * T1.stride[0] ) ] = float(0);"),
        "{source}"
    );
    assert!(
        source.contains(
            "blockReduce< true, false, false > ( T1[ ( blockIdx.x * T1.stride[0] ) ], \
             T0[ ( blockIdx.x * T0.stride[0] ) + ( threadIdx.x * T0.stride[1] ) ], \
             reduction_add_float, threadIdx, blockDim, reinterpret_cast<float*>(shared_mem));"
        ),
        "{source}"
    );
    assert!(source.contains("threadIdx.x < T0.size[1]"), "{source}");
}

#[test]
fn grid_reduction_kernel() {
    let (mut fusion, _, t1) = row_sum();
    fusion.split(t1, 1, 4).expect("split");
    fusion.parallelize(t1, 1, ParallelType::BIDx).expect("bind");
    fusion.parallelize(t1, 2, ParallelType::TIDx).expect("bind");

    let kernel = lower(&mut fusion, &config()).expect("lower");
    assert!(kernel.has_block_reduction && kernel.has_grid_reduction);
    assert_eq!(kernel.grid_reductions.len(), 1);

    let source = kernel.to_source(&fusion).expect("source");
    assert!(
        source.contains(", void* work_buf, unsigned* sync_flags){\n"),
        "{source}"
    );
    assert!(source.contains("float block_result;"), "{source}");
    assert!(
        source.contains("blockReduce< true, false, false > ( block_result, "),
        "{source}"
    );
    assert!(
        source.contains(
            "reduction::gridReduce< true, false, false, false, true, true > ( T1[ "
        ),
        "{source}"
    );
    assert!(
        source.contains(
            ", block_result, reduction_add_float, static_cast<float*>(work_buf), sync_flags, \
             reinterpret_cast<float*>(shared_mem));"
        ),
        "{source}"
    );
}

#[test]
fn grid_reductions_get_their_own_workspace() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(t0).expect("input");
    let t1 = arith::sum(&mut fusion, t0, &[1]).expect("sum");
    let lowest = fusion.new_float(-3.0e38);
    let t2 = arith::reduction_op(&mut fusion, BinaryOpType::Max, &[1], lowest, t0).expect("max");
    fusion.add_output(t1).expect("output");
    fusion.add_output(t2).expect("output");
    fusion.parallelize(t1, 1, ParallelType::BIDx).expect("bind");
    fusion.parallelize(t2, 1, ParallelType::BIDx).expect("bind");

    let kernel = lower(&mut fusion, &config()).expect("lower");
    assert_eq!(kernel.grid_reductions.len(), 2);
    let source = kernel.to_source(&fusion).expect("source");
    assert!(source.contains("  a = fmax(a, b);\n"), "{source}");
    assert_eq!(
        source
            .matches("reduction::gridReduce< true, false, false, true, true, true > (")
            .count(),
        2,
        "{source}"
    );
    assert!(source.contains("sync_flags, reinterpret_cast"), "{source}");
    assert!(
        source.contains("&sync_flags[1 * gridDim.x * gridDim.y * gridDim.z]"),
        "{source}"
    );
    assert!(!source.contains("block_result"), "{source}");

    let summary = kernel.summary(&fusion).expect("summary");
    assert_eq!(summary.grid_reductions, 2);
    assert!(summary.has_grid_reduction);
}

#[test]
fn random_numbers_extend_the_signature() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(t0).expect("input");
    let t1 = arith::rand_like(&mut fusion, t0).expect("rand");
    let t2 = arith::add(&mut fusion, t0, t1).expect("add");
    fusion.add_output(t2).expect("output");

    let kernel = lower(&mut fusion, &config()).expect("lower");
    assert!(kernel.has_rng);
    let source = kernel.to_source(&fusion).expect("source");
    assert!(
        source.contains(
            "__global__ void kernel1(Tensor<float, 2> T0, Tensor<float, 2> T2, \
             unsigned long long seed, unsigned long long offset){\n"
        ),
        "{source}"
    );
    assert!(
        source.contains("  int idx = blockIdx.x*blockDim.x + threadIdx.x;\n  Philox rnd(seed, idx, offset);\n"),
        "{source}"
    );
    assert!(source.contains(" = randLike(rnd);"), "{source}");
}

#[test]
fn summary_describes_parameters() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    let scale = fusion.new_symbolic(DataType::Float);
    fusion.add_input(t0).expect("input");
    fusion.add_input(scale).expect("input");
    let t1 = arith::mul(&mut fusion, t0, scale).expect("mul");
    fusion.add_output(t1).expect("output");

    let kernel = lower(&mut fusion, &config()).expect("lower");
    let source = kernel.to_source(&fusion).expect("source");
    assert!(
        source.starts_with("__global__ void kernel1(Tensor<float, 2> T0, float f5, Tensor<float, 2> T1){\n"),
        "{source}"
    );
    assert!(source.contains(" * f5;"), "{source}");

    let summary = kernel.summary(&fusion).expect("summary");
    assert_eq!(summary.name, "kernel1");
    assert_eq!(summary.params.len(), 3);
    assert_eq!(summary.params[1].name, "f5");
    assert_eq!(summary.params[1].rank, 0);
    assert_eq!(summary.params[2].rank, 2);

    let json = summary.to_json().expect("json");
    assert!(json.contains("\"name\": \"kernel1\""), "{json}");
    assert!(json.contains("\"kind\": \"scalar\""), "{json}");
    assert!(json.contains("\"kind\": \"tensor\""), "{json}");
    assert!(json.contains("\"dtype\": \"Float\""), "{json}");
    assert!(json.contains("\"grid_reductions\": 0"), "{json}");
}

#[test]
fn lowering_requires_registered_inputs() {
    let mut fusion = Fusion::new();
    let a = fusion.new_tensor(1, DataType::Float);
    let b = fusion.new_tensor(1, DataType::Float);
    fusion.add_input(a).expect("input");
    let c = arith::add(&mut fusion, a, b).expect("add");
    fusion.add_output(c).expect("output");
    let err = lower(&mut fusion, &config()).expect_err("b is not an input");
    assert!(matches!(err, FusionError::InvalidInput { val, .. } if val == b), "{err}");
}

#[test]
fn reductions_lower_to_reduce_statements() {
    let (mut fusion, _, _) = row_sum();
    let kernel = lower(&mut fusion, &config()).expect("lower");

    fn plans(nodes: &[KernelNode], out: &mut Vec<bool>) {
        for node in nodes {
            match node {
                KernelNode::ForLoop { body, .. } => plans(body, out),
                KernelNode::IfThenElse { then_body, .. } => plans(then_body, out),
                KernelNode::Expr(expr) => {
                    if let LoweredOp::Reduce(plan) = &expr.op {
                        out.push(plan.is_serial());
                    }
                }
                KernelNode::Allocate { .. } => {}
            }
        }
    }
    let mut serial = Vec::new();
    plans(&kernel.body, &mut serial);
    assert_eq!(serial, vec![true]);
    let source = kernel.to_source(&fusion).expect("source");
    assert!(source.contains("] = T1[ "), "{source}");
    assert!(!source.contains("blockReduce"), "{source}");
}
