use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{BinaryOpType, DataType, ExprKind, ParallelType, UnaryOpType, ValKind};
use crate::printer::{binary_text, op_text, IrPrinter};

use super::{Kernel, KernelNode, LoweredExpr, LoweredOp, ReductionPlan};

fn push_line(out: &mut String, indent: usize, line: &str) {
    for _ in 0..indent {
        out.push_str("  ");
    }
    out.push_str(line);
    out.push('\n');
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn helper_name(op: BinaryOpType, dtype: DataType) -> String {
    format!(
        "reduction_{}_{}",
        op.to_string().to_ascii_lowercase(),
        dtype.device_name()
    )
}

pub(super) fn kernel_source(fusion: &Fusion, kernel: &Kernel) -> FusionResult<String> {
    let printer = IrPrinter::lowered(fusion);
    let mut out = String::new();

    for &(op, dtype) in &kernel.reduction_ops {
        let ty = dtype.device_name();
        push_line(
            &mut out,
            0,
            &format!(
                "__device__ void {}({ty}& a, const {ty} b) {{",
                helper_name(op, dtype)
            ),
        );
        push_line(&mut out, 1, &op.reduction_body(dtype)?);
        push_line(&mut out, 0, "}");
    }

    out.push_str(&header(fusion, kernel)?);
    if kernel.has_rng {
        push_line(&mut out, 1, "int idx = blockIdx.x*blockDim.x + threadIdx.x;");
        push_line(&mut out, 1, "Philox rnd(seed, idx, offset);");
    }
    if kernel.has_block_reduction || kernel.has_grid_reduction {
        push_line(
            &mut out,
            1,
            &format!("__shared__ float shared_mem[{}];", kernel.shared_mem_elems),
        );
    }
    emit_nodes(&mut out, &printer, fusion, &kernel.body, 1)?;
    out.push_str("}\n");
    Ok(out)
}

/// `__global__ void name(params...){` with inputs, outputs, RNG state and
/// grid-reduction buffers in that order.
fn header(fusion: &Fusion, kernel: &Kernel) -> FusionResult<String> {
    let printer = IrPrinter::lowered(fusion);
    let mut params = Vec::with_capacity(kernel.params.len());
    for &param in &kernel.params {
        let node = fusion.val(param)?;
        let text = match &node.kind {
            ValKind::TensorView(tv) => format!(
                "Tensor<{}, {}> T{}",
                tv.dtype.device_name(),
                fusion.no_reductions(&tv.domain.root)?.len(),
                node.name
            ),
            ValKind::Scalar(_) | ValKind::NamedScalar { .. } => format!(
                "{} {}",
                fusion.dtype(param)?.device_name(),
                printer.val(param)?
            ),
            _ => {
                return Err(FusionError::lowering(format!(
                    "kernel parameter {param} is a {}",
                    node.kind_name()
                )))
            }
        };
        params.push(text);
    }
    let mut line = format!("__global__ void {}({}", kernel.name, params.join(", "));
    if kernel.has_rng {
        line.push_str(", unsigned long long seed, unsigned long long offset");
    }
    if kernel.has_grid_reduction {
        line.push_str(", void* work_buf, unsigned* sync_flags");
    }
    line.push_str("){\n");
    Ok(line)
}

fn emit_nodes(
    out: &mut String,
    printer: &IrPrinter<'_>,
    fusion: &Fusion,
    nodes: &[KernelNode],
    indent: usize,
) -> FusionResult<()> {
    for node in nodes {
        match node {
            KernelNode::ForLoop {
                index,
                iter_domain,
                extent,
                body,
            } => {
                let id = fusion.iter_domain(*iter_domain)?;
                if id.parallel == ParallelType::Unroll {
                    push_line(out, indent, "#pragma unroll");
                }
                let index = printer.val(*index)?;
                push_line(
                    out,
                    indent,
                    &format!(
                        "for(size_t {index} = {}; {index} < {}; ++{index} ) {{",
                        printer.inline(id.start)?,
                        printer.inline(*extent)?
                    ),
                );
                emit_nodes(out, printer, fusion, body, indent + 1)?;
                push_line(out, indent, "}");
            }
            KernelNode::IfThenElse {
                cond,
                then_body,
                else_body,
            } => {
                push_line(out, indent, &format!("if ( {} ) {{", printer.inline(*cond)?));
                emit_nodes(out, printer, fusion, then_body, indent + 1)?;
                if !else_body.is_empty() {
                    push_line(out, indent, "} else {");
                    emit_nodes(out, printer, fusion, else_body, indent + 1)?;
                }
                push_line(out, indent, "}");
            }
            KernelNode::Allocate {
                buffer,
                dtype,
                size,
            } => {
                push_line(
                    out,
                    indent,
                    &format!(
                        "{} {}[{}];",
                        dtype.device_name(),
                        printer.val(*buffer)?,
                        printer.inline(*size)?
                    ),
                );
            }
            KernelNode::Expr(expr) => emit_expr(out, printer, fusion, expr, indent)?,
        }
    }
    Ok(())
}

fn emit_expr(
    out: &mut String,
    printer: &IrPrinter<'_>,
    fusion: &Fusion,
    expr: &LoweredExpr,
    indent: usize,
) -> FusionResult<()> {
    let lhs = printer.val(expr.output)?;
    match &expr.op {
        LoweredOp::Set => {
            let input = expr
                .inputs
                .first()
                .ok_or_else(|| FusionError::lowering("copy without a source"))?;
            push_line(out, indent, &format!("{lhs} = {};", printer.val(*input)?));
        }
        LoweredOp::Elementwise(kind) => {
            let operands = if *kind == ExprKind::Unary(UnaryOpType::RandLike) {
                vec!["rnd".to_string()]
            } else {
                expr.inputs
                    .iter()
                    .map(|input| printer.val(*input))
                    .collect::<FusionResult<Vec<_>>>()?
            };
            let from = fusion.dtype(expr.inputs[0])?;
            let to = fusion.dtype(expr.output)?;
            push_line(
                out,
                indent,
                &format!("{lhs} = {};", op_text(kind, from, to, &operands)?),
            );
        }
        LoweredOp::Reduce(plan) => {
            let input = printer.val(expr.inputs[0])?;
            emit_reduction(out, indent, plan, &lhs, &input)?;
        }
    }
    Ok(())
}

fn emit_reduction(
    out: &mut String,
    indent: usize,
    plan: &ReductionPlan,
    lhs: &str,
    input: &str,
) -> FusionResult<()> {
    if plan.is_serial() {
        push_line(
            out,
            indent,
            &format!("{lhs} = {};", binary_text(plan.op, lhs, input)?),
        );
        return Ok(());
    }

    let ty = plan.dtype.device_name();
    let helper = helper_name(plan.op, plan.dtype);
    let block_result = "block_result";
    let [tidx, tidy, tidz] = plan.threads;
    if plan.is_block() {
        if plan.is_grid() {
            push_line(out, indent, &format!("{ty} {block_result};"));
        }
        let target = if plan.is_grid() { block_result } else { lhs };
        push_line(
            out,
            indent,
            &format!(
                "blockReduce< {}, {}, {} > ( {target}, {input}, {helper}, threadIdx, blockDim, reinterpret_cast<{ty}*>(shared_mem));",
                flag(tidx),
                flag(tidy),
                flag(tidz)
            ),
        );
    }
    if plan.is_grid() {
        let [bidx, bidy, bidz] = plan.blocks;
        let source = if plan.is_block() { block_result } else { input };
        let (work, flags) = grid_regions(plan.grid_slot.unwrap_or(0), ty);
        push_line(
            out,
            indent,
            &format!(
                "reduction::gridReduce< {}, {}, {}, {}, {}, {} > ( {lhs}, {source}, {helper}, {work}, {flags}, reinterpret_cast<{ty}*>(shared_mem));",
                flag(bidx),
                flag(bidy),
                flag(bidz),
                flag(!tidx),
                flag(!tidy),
                flag(!tidz)
            ),
        );
    }
    Ok(())
}

/// Workspace and sync-flag arguments of the `slot`-th grid reduction. Each
/// reduction owns one full-grid region of both buffers.
fn grid_regions(slot: usize, ty: &str) -> (String, String) {
    if slot == 0 {
        return (
            format!("static_cast<{ty}*>(work_buf)"),
            "sync_flags".to_string(),
        );
    }
    let grid = "gridDim.x * gridDim.y * gridDim.z";
    (
        format!("&static_cast<{ty}*>(work_buf)[{slot} * {grid} * blockDim.x * blockDim.y * blockDim.z]"),
        format!("&sync_flags[{slot} * {grid}]"),
    )
}
