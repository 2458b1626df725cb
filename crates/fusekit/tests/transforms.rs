use fusekit::arith;
use fusekit::eval::evaluate_with;
use fusekit::ir::{DataType, DomainTransform, IterType, ParallelType};
use fusekit::{Fusion, FusionError, ValId};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn extent(fusion: &Fusion, tv: ValId, axis: i64) -> ValId {
    let id = fusion.axis(tv, axis).expect("axis");
    fusion.iter_domain(id).expect("iter domain").extent
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

#[test]
fn split_and_merge_extents_are_symbolic() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_tensor(2, DataType::Float);
    let n = extent(&fusion, tv, 0);
    let m = extent(&fusion, tv, 1);

    fusion.split(tv, 0, 4).expect("split");
    assert_eq!(fusion.ndims(tv).expect("ndims"), 3);
    let outer = extent(&fusion, tv, 0);
    let inner = extent(&fusion, tv, 1);
    assert_eq!(fusion.const_int(inner), Some(4));
    assert_eq!(evaluate_with(&fusion, &[(n, 129)], outer).expect("eval"), Some(33));
    assert_eq!(evaluate_with(&fusion, &[(n, 128)], outer).expect("eval"), Some(32));
    assert_eq!(evaluate_with(&fusion, &[], outer).expect("eval"), None);

    fusion.merge(tv, 1, 2).expect("merge");
    assert_eq!(fusion.ndims(tv).expect("ndims"), 2);
    let merged = extent(&fusion, tv, 1);
    assert_eq!(evaluate_with(&fusion, &[(m, 127)], merged).expect("eval"), Some(508));

    let history = &fusion.tensor(tv).expect("tensor").domain.history;
    assert_eq!(history.len(), 2);
    assert!(matches!(history[0], DomainTransform::Split { .. }));
    assert!(matches!(history[1], DomainTransform::Merge { .. }));
    assert_eq!(fusion.tensor(tv).expect("tensor").domain.root.len(), 2);
}

#[test]
fn split_rejects_bad_factors() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_tensor(1, DataType::Float);
    let err = fusion.split(tv, 0, 0).expect_err("zero factor");
    assert!(matches!(err, FusionError::InvalidSplit(_)), "{err}");
    let err = fusion.split(tv, 3, 2).expect_err("axis out of range");
    assert!(matches!(err, FusionError::AxisOutOfRange { .. }), "{err}");

    let held = fusion.new_symbolic(DataType::Int);
    fusion.split_by(tv, -1, held).expect("symbolic factor");
    assert_eq!(extent(&fusion, tv, 1), held);
}

#[test]
fn merge_requires_adjacent_compatible_axes() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(3, DataType::Float);
    let t1 = arith::sum(&mut fusion, t0, &[2]).expect("sum");

    let err = fusion.merge(t1, 0, 2).expect_err("not adjacent");
    assert_eq!(err, FusionError::NonAdjacentMerge { outer: 0, inner: 2 });
    let err = fusion.merge(t1, 1, 2).expect_err("reduction with iteration");
    assert!(matches!(err, FusionError::IncompatibleMerge { .. }), "{err}");

    fusion.merge(t1, 0, 1).expect("iteration axes merge");
    let merged = fusion.axis(t1, 0).expect("axis");
    assert_eq!(
        fusion.iter_domain(merged).expect("id").iter_type,
        IterType::Iteration
    );
}

#[test]
fn reorder_moves_named_axes_and_keeps_the_rest_in_order() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_tensor(3, DataType::Float);
    let [a, b, c]: [ValId; 3] = fusion
        .axes(tv)
        .expect("axes")
        .try_into()
        .expect("three axes");

    fusion.reorder(tv, &[(0, 2)]).expect("reorder");
    assert_eq!(fusion.axes(tv).expect("axes"), &[b, c, a]);

    fusion.reorder(tv, &[(-1, 0)]).expect("reorder");
    assert_eq!(fusion.axes(tv).expect("axes"), &[a, b, c]);

    fusion.reorder(tv, &[(0, 1), (1, 0)]).expect("swap");
    assert_eq!(fusion.axes(tv).expect("axes"), &[b, a, c]);

    let err = fusion.reorder(tv, &[(0, 1), (2, 1)]).expect_err("collision");
    assert!(matches!(err, FusionError::InvalidReorder(_)), "{err}");
    let err = fusion.reorder(tv, &[(0, 1), (0, 2)]).expect_err("moved twice");
    assert!(matches!(err, FusionError::InvalidReorder(_)), "{err}");
    let err = fusion.reorder(tv, &[(5, 0)]).expect_err("out of range");
    assert!(matches!(err, FusionError::InvalidReorder(_)), "{err}");
}

#[test]
fn parallelize_binds_axes() {
    let mut fusion = Fusion::new();
    let tv = fusion.new_tensor(2, DataType::Float);
    fusion.parallelize(tv, 0, ParallelType::BIDx).expect("bind");
    fusion.parallelize(tv, -1, ParallelType::TIDx).expect("bind");
    let ids: Vec<_> = fusion
        .axes(tv)
        .expect("axes")
        .iter()
        .map(|axis| fusion.iter_domain(*axis).expect("id").parallel)
        .collect();
    assert_eq!(ids, vec![ParallelType::BIDx, ParallelType::TIDx]);
}

#[test]
fn compute_at_replays_the_consumer_schedule() {
    init_logging();
    let (mut fusion, [t0, _, t2, t3]) = elementwise();
    fusion.split(t3, 0, 4).expect("split");
    fusion.parallelize(t3, 1, ParallelType::TIDx).expect("bind");
    fusion.compute_at(t2, t3, 1).expect("compute at");

    assert_eq!(fusion.ndims(t2).expect("ndims"), 3);
    let history = &fusion.tensor(t2).expect("tensor").domain.history;
    assert_eq!(history.len(), 1);
    let ca = fusion
        .compute_at_of(t2)
        .expect("lookup")
        .expect("t2 is computed at t3");
    assert_eq!(ca.view, t3);
    assert_eq!(ca.position, 1);
    assert_eq!(ca.consumer_position, 1);
    assert_eq!(ca.axis_map, vec![0]);

    let inner = fusion.axis(t2, 1).expect("axis");
    assert_eq!(fusion.const_int(fusion.iter_domain(inner).expect("id").extent), Some(4));
    assert_eq!(fusion.iter_domain(inner).expect("id").parallel, ParallelType::TIDx);

    assert!(fusion.compute_at_of(t0).expect("lookup").is_none());
    assert!(fusion.compute_at_of(t3).expect("lookup").is_none());
}

#[test]
fn compute_at_rejects_unrelated_tensors() {
    let (mut fusion, [t0, t1, t2, t3]) = elementwise();
    let err = fusion.compute_at(t3, t3, 1).expect_err("self");
    assert!(matches!(err, FusionError::InvalidComputeAt { .. }), "{err}");
    let err = fusion.compute_at(t3, t2, 1).expect_err("wrong direction");
    assert!(matches!(err, FusionError::InvalidComputeAt { .. }), "{err}");
    let err = fusion.compute_at(t0, t1, 1).expect_err("siblings");
    assert!(matches!(err, FusionError::InvalidComputeAt { .. }), "{err}");
    let err = fusion.compute_at(t2, t3, 4).expect_err("position past the end");
    assert!(matches!(err, FusionError::AxisOutOfRange { .. }), "{err}");
}

#[test]
fn compute_at_walks_the_whole_chain() {
    init_logging();
    let mut fusion = Fusion::new();
    let x = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(x).expect("input");
    let a = arith::neg(&mut fusion, x).expect("neg");
    let b = arith::exp(&mut fusion, a).expect("exp");
    let one = fusion.new_float(1.0);
    let c = arith::add(&mut fusion, b, one).expect("add");
    fusion.add_output(c).expect("output");

    fusion.compute_at(a, c, 2).expect("compute at");
    let at_b = fusion.compute_at_of(a).expect("lookup").expect("a placed");
    assert_eq!(at_b.view, b);
    assert_eq!(at_b.position, 2);
    let at_c = fusion.compute_at_of(b).expect("lookup").expect("b placed");
    assert_eq!(at_c.view, c);

    // A second, shallower placement wins.
    fusion.compute_at(a, c, -2).expect("compute at");
    let at_b = fusion.compute_at_of(a).expect("lookup").expect("a placed");
    assert_eq!(at_b.position, 1);
    assert_eq!(
        fusion.compute_at_of(b).expect("lookup").expect("b placed").position,
        1
    );
}

#[test]
fn schedules_inside_the_compute_at_range_are_frozen() {
    let (mut fusion, [_, _, t2, t3]) = elementwise();
    fusion.split(t3, 0, 4).expect("split");
    fusion.compute_at(t2, t3, 1).expect("compute at");

    let err = fusion.split(t2, 0, 2).expect_err("inside range");
    assert!(matches!(err, FusionError::ComputeAtConflict(_)), "{err}");
    let err = fusion.merge(t2, 0, 1).expect_err("inside range");
    assert!(matches!(err, FusionError::ComputeAtConflict(_)), "{err}");
    let err = fusion.reorder(t2, &[(0, 1)]).expect_err("crosses position");
    assert!(matches!(err, FusionError::ComputeAtConflict(_)), "{err}");

    fusion.split(t2, 2, 2).expect("outside range");
    fusion.reorder(t2, &[(1, 3)]).expect("outside range");
    assert_eq!(fusion.ndims(t2).expect("ndims"), 4);
}

#[test]
fn rfactor_splits_a_reduction_in_two() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(t0).expect("input");
    let t1 = arith::sum(&mut fusion, t0, &[1]).expect("sum");
    fusion.add_output(t1).expect("output");
    fusion.split(t1, 1, 4).expect("split");

    let partial = fusion.rfactor(t1, &[1]).expect("rfactor");
    let domain = &fusion.tensor(partial).expect("tensor").domain;
    assert!(domain.has_rfactor());
    assert_eq!(domain.root.len(), 2);
    let kinds: Vec<(IterType, bool)> = domain
        .axes
        .iter()
        .map(|axis| {
            let id = fusion.iter_domain(*axis).expect("id");
            (id.iter_type, id.rfactor_product)
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            (IterType::Iteration, false),
            (IterType::Reduction, true),
            (IterType::Iteration, true),
        ]
    );

    let final_axes: Vec<IterType> = fusion
        .axes(t1)
        .expect("axes")
        .iter()
        .map(|axis| fusion.iter_domain(*axis).expect("id").iter_type)
        .collect();
    assert_eq!(final_axes, vec![IterType::Iteration, IterType::Reduction]);
    let last = fusion.axis(t1, 1).expect("axis");
    assert_eq!(fusion.const_int(fusion.iter_domain(last).expect("id").extent), Some(4));

    let final_expr = fusion.expr(fusion.origin(t1).expect("origin")).expect("expr");
    assert_eq!(final_expr.inputs.as_slice(), &[partial]);
    let partial_expr = fusion.expr(fusion.origin(partial).expect("origin")).expect("expr");
    assert_eq!(partial_expr.inputs.as_slice(), &[t0]);

    let math = fusion.print_math().expect("math");
    assert_eq!(math.matches("reduction(").count(), 2, "{math}");
}

#[test]
fn rfactor_rejects_invalid_selections() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    let t1 = arith::sum(&mut fusion, t0, &[1]).expect("sum");
    let t2 = arith::neg(&mut fusion, t0).expect("neg");
    fusion.split(t1, 1, 4).expect("split");

    let err = fusion.rfactor(t2, &[0]).expect_err("not a reduction");
    assert!(matches!(err, FusionError::InvalidRFactor { .. }), "{err}");
    let err = fusion.rfactor(t1, &[0]).expect_err("iteration axis");
    assert!(matches!(err, FusionError::InvalidRFactor { .. }), "{err}");
    let err = fusion.rfactor(t1, &[1, 2]).expect_err("every reduction axis");
    assert!(matches!(err, FusionError::InvalidRFactor { .. }), "{err}");
    let err = fusion.rfactor(t1, &[]).expect_err("nothing selected");
    assert!(matches!(err, FusionError::InvalidRFactor { .. }), "{err}");
}

#[test]
fn replay_in_both_directions() {
    let mut fusion = Fusion::new();
    let x = fusion.new_tensor(2, DataType::Float);
    let t1 = arith::neg(&mut fusion, x).expect("neg");
    fusion.split(t1, 0, 4).expect("split");
    let position = fusion
        .replay_producer_as_consumer(x, t1, 1)
        .expect("replay onto producer");
    assert_eq!(position, 1);
    assert_eq!(fusion.ndims(x).expect("ndims"), 3);
    let inner = fusion.axis(x, 1).expect("axis");
    assert_eq!(fusion.const_int(fusion.iter_domain(inner).expect("id").extent), Some(4));

    let y = fusion.new_tensor(2, DataType::Float);
    let t2 = arith::neg(&mut fusion, y).expect("neg");
    fusion.split(y, 1, 2).expect("split");
    let position = fusion
        .replay_consumer_as_producer(t2, y, -1)
        .expect("replay onto consumer");
    assert_eq!(position, 3);
    assert_eq!(fusion.ndims(t2).expect("ndims"), 3);

    let err = fusion
        .replay_producer_as_consumer(y, t1, 1)
        .expect_err("unrelated");
    assert!(matches!(err, FusionError::ReplayMismatch(_)), "{err}");
}
