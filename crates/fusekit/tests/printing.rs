use fusekit::arith;
use fusekit::ir::{DataType, ParallelType};
use fusekit::{Fusion, IrPrinter, ValId};

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
fn math_lists_expressions_in_dependency_order() {
    let (fusion, _) = elementwise();
    let math = fusion.print_math().expect("math");
    assert_eq!(
        math,
        "T2[ iS{i6}, iS{i8} ] = T1[ iS{i6}, iS{i8} ] + float(2);\n\
         T3[ iS{i1}, iS{i3} ] = T0[ iS{i1}, iS{i3} ] + T2[ iS{i6}, iS{i8} ];\n"
    );
    assert_eq!(
        fusion.print().expect("print"),
        format!("%kernel {{\n{math}}}\n")
    );
}

#[test]
fn math_shows_schedule_state() {
    let (mut fusion, [_, _, t2, t3]) = elementwise();
    fusion.split(t3, 0, 4).expect("split");
    fusion.parallelize(t3, 1, ParallelType::TIDx).expect("bind");
    fusion.compute_at(t2, t3, 1).expect("compute at");

    let math = fusion.print_math().expect("math");
    assert!(math.contains("compute_at( T3, 1 )"), "{math}");
    assert!(math.contains("iS{( ceilDiv(i1, 4) )}"), "{math}");
    assert!(math.contains("ithreadIdx.x{4}"), "{math}");
}

#[test]
fn transforms_list_every_record() {
    let (mut fusion, [_, _, _, t3]) = elementwise();
    fusion.split(t3, 0, 4).expect("split");
    let text = fusion.print_transforms().expect("transforms");
    let expected = "T3 root[ iS{i1}, iS{i3} ]\n  \
                    Split: iS{i1} by factor 4 -> iS{( ceilDiv(i1, 4) )}, iS{4}\n  \
                    axes[ iS{( ceilDiv(i1, 4) )}, iS{4}, iS{i3} ]\n";
    assert!(text.contains(expected), "{text}");
    assert!(text.contains("T0 root[ iS{i1}, iS{i3} ]\n  axes[ iS{i1}, iS{i3} ]\n"), "{text}");

    fusion.merge(t3, 1, 2).expect("merge");
    let text = fusion.print_transforms().expect("transforms");
    assert!(text.contains("  Merge: iS{4} and iS{i3} -> iS{( 4 * i3 )}\n"), "{text}");
}

#[test]
fn rfactor_domains_are_printed() {
    let mut fusion = Fusion::new();
    let t0 = fusion.new_tensor(2, DataType::Float);
    fusion.add_input(t0).expect("input");
    let t1 = arith::sum(&mut fusion, t0, &[1]).expect("sum");
    fusion.add_output(t1).expect("output");
    fusion.split(t1, 1, 4).expect("split");
    let partial = fusion.rfactor(t1, &[1]).expect("rfactor");

    let text = fusion.print_transforms().expect("transforms");
    assert!(text.contains("  rfactor[ "), "{text}");
    let rendered = fusion.val_to_string(partial).expect("partial");
    assert!(rendered.contains("}rf"), "{rendered}");
    assert!(rendered.contains("rS{( ceilDiv(i3, 4) )}rf"), "{rendered}");
    let math = fusion.print_math().expect("math");
    assert!(math.contains("op = Add, initial value = float(0) );"), "{math}");
}

#[test]
fn scalar_spelling() {
    let mut fusion = Fusion::new();
    let seven = fusion.new_int(7);
    let yes = fusion.new_bool(true);
    let half = fusion.new_float(0.5);
    let n = fusion.new_symbolic(DataType::Int);
    let sum = arith::add(&mut fusion, n, seven).expect("add");
    let f = fusion.new_symbolic(DataType::Float);

    assert_eq!(fusion.val_to_string(seven).expect("int"), "7");
    assert_eq!(fusion.val_to_string(yes).expect("bool"), "true");
    assert_eq!(fusion.val_to_string(half).expect("float"), "float(0.5)");
    assert_eq!(fusion.val_to_string(n).expect("symbol"), "i3");
    assert_eq!(fusion.val_to_string(f).expect("symbol"), "f5");

    let printer = IrPrinter::new(&fusion);
    assert_eq!(printer.inline(sum).expect("inline"), "( i3 + 7 )");
    let origin = fusion.origin(sum).expect("origin");
    assert_eq!(fusion.expr_to_string(origin).expect("expr"), "i4 = i3 + 7;");
}

#[test]
fn copies_print_identically() {
    let (mut fusion, [_, _, t2, t3]) = elementwise();
    fusion.split(t3, 0, 4).expect("split");
    fusion.compute_at(t2, t3, 1).expect("compute at");
    let copy = fusion.clone();
    assert_eq!(copy.print().expect("print"), fusion.print().expect("print"));
    assert_eq!(
        copy.print_transforms().expect("transforms"),
        fusion.print_transforms().expect("transforms")
    );
}
