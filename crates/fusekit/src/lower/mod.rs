//! Lowering of a scheduled fusion into a kernel.
//!
//! The pass walks tensor expressions in compute-at order and builds a tree
//! of [`KernelNode`]s: loops for serial axes, allocations for intermediate
//! tensors, predicates for axes that may run past their extent, and one
//! [`LoweredExpr`] per statement whose operands are [`TensorIndex`] values.
//! [`Kernel::to_source`] prints the tree as device source.
//!
//! [`TensorIndex`]: crate::ir::TensorIndex

mod codegen;
mod index;
mod loops;
mod predicate;

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::env;
use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{BinaryOpType, DataType, ExprId, ExprKind, ParallelType, ValId};

use loops::LoopNestBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerConfig {
    pub kernel_name: String,
    /// Elements of the shared staging buffer used by block and grid
    /// reductions.
    pub shared_mem_elems: usize,
    /// Log the generated source at debug level.
    pub dump_kernel: bool,
}

impl Default for LowerConfig {
    fn default() -> Self {
        LowerConfig {
            kernel_name: env::kernel_name().to_string(),
            shared_mem_elems: 1024,
            dump_kernel: env::dump_kernel(),
        }
    }
}

impl LowerConfig {
    pub fn with_kernel_name(mut self, name: impl Into<String>) -> Self {
        self.kernel_name = name.into();
        self
    }
}

/// How a reduction statement combines values across the launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionPlan {
    pub op: BinaryOpType,
    pub dtype: DataType,
    /// Thread dimensions (x, y, z) reduced over.
    pub threads: [bool; 3],
    /// Block dimensions (x, y, z) reduced over.
    pub blocks: [bool; 3],
    /// Workspace and sync-flag region of a grid reduction.
    pub grid_slot: Option<usize>,
}

impl ReductionPlan {
    pub fn is_block(&self) -> bool {
        self.threads.iter().any(|t| *t)
    }

    pub fn is_grid(&self) -> bool {
        self.blocks.iter().any(|b| *b)
    }

    pub fn is_serial(&self) -> bool {
        !self.is_block() && !self.is_grid()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoweredOp {
    /// Unary, binary or ternary operator applied elementwise.
    Elementwise(ExprKind),
    /// Plain copy: broadcasts and reduction initialisation.
    Set,
    Reduce(ReductionPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredExpr {
    /// Expression of the fusion this statement implements.
    pub origin: ExprId,
    pub op: LoweredOp,
    pub output: ValId,
    pub inputs: Vec<ValId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelNode {
    ForLoop {
        index: ValId,
        iter_domain: ValId,
        extent: ValId,
        body: Vec<KernelNode>,
    },
    IfThenElse {
        cond: ValId,
        then_body: Vec<KernelNode>,
        else_body: Vec<KernelNode>,
    },
    Allocate {
        buffer: ValId,
        dtype: DataType,
        size: ValId,
    },
    Expr(LoweredExpr),
}

#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    /// Fusion inputs followed by fusion outputs.
    pub params: Vec<ValId>,
    pub body: Vec<KernelNode>,
    pub has_rng: bool,
    pub has_block_reduction: bool,
    pub has_grid_reduction: bool,
    /// `(operator, element type)` pairs that need a reduction helper.
    pub reduction_ops: BTreeSet<(BinaryOpType, DataType)>,
    /// Grid reductions in slot order.
    pub grid_reductions: Vec<ExprId>,
    /// Stride symbol of every non-reduction root axis of each tensor
    /// parameter.
    pub strides: HashMap<ValId, Vec<ValId>>,
    /// Launch-geometry index symbols (`threadIdx.x`, ...) used in indexing.
    pub hardware_indices: Vec<(ParallelType, ValId)>,
    pub shared_mem_elems: usize,
}

impl Kernel {
    pub fn to_source(&self, fusion: &Fusion) -> FusionResult<String> {
        codegen::kernel_source(fusion, self)
    }

    pub fn summary(&self, fusion: &Fusion) -> FusionResult<KernelSummary> {
        let mut params = Vec::with_capacity(self.params.len());
        for &param in &self.params {
            let dtype = fusion.dtype(param)?;
            let (kind, rank) = if fusion.is_tensor(param) {
                let root = &fusion.tensor(param)?.domain.root;
                (ParamKind::Tensor, fusion.no_reductions(root)?.len())
            } else {
                (ParamKind::Scalar, 0)
            };
            params.push(ParamSummary {
                name: crate::printer::IrPrinter::lowered(fusion).val(param)?,
                kind,
                dtype,
                rank,
            });
        }
        Ok(KernelSummary {
            name: self.name.clone(),
            params,
            has_rng: self.has_rng,
            has_block_reduction: self.has_block_reduction,
            has_grid_reduction: self.has_grid_reduction,
            grid_reductions: self.grid_reductions.len(),
            shared_mem_elems: self.shared_mem_elems,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Tensor,
    Scalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSummary {
    pub name: String,
    pub kind: ParamKind,
    pub dtype: DataType,
    pub rank: usize,
}

/// What a launcher needs to know about a kernel besides its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSummary {
    pub name: String,
    pub params: Vec<ParamSummary>,
    pub has_rng: bool,
    pub has_block_reduction: bool,
    pub has_grid_reduction: bool,
    pub grid_reductions: usize,
    pub shared_mem_elems: usize,
}

impl KernelSummary {
    pub fn to_json(&self) -> FusionResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| FusionError::lowering(err.to_string()))
    }
}

/// Thread and block dimensions bound to reduction axes of `tv`.
pub fn reduction_parallelism(fusion: &Fusion, tv: ValId) -> FusionResult<([bool; 3], [bool; 3])> {
    let mut threads = [false; 3];
    let mut blocks = [false; 3];
    for &axis in fusion.axes(tv)? {
        let id = fusion.iter_domain(axis)?;
        if !id.is_reduction() {
            continue;
        }
        if let Some(slot) = id.parallel.dim_slot() {
            if id.parallel.is_thread_dim() {
                threads[slot] = true;
            } else {
                blocks[slot] = true;
            }
        }
    }
    Ok((threads, blocks))
}

/// Lowers `fusion` into a kernel. Symbols created for sizes, strides and
/// indices are registered in `fusion`.
pub fn lower(fusion: &mut Fusion, config: &LowerConfig) -> FusionResult<Kernel> {
    fusion.validate_inputs()?;

    let params: Vec<ValId> = fusion
        .inputs()
        .iter()
        .chain(fusion.outputs())
        .copied()
        .collect();
    let mut strides = HashMap::new();
    for &param in &params {
        if !fusion.is_tensor(param) || strides.contains_key(&param) {
            continue;
        }
        strides.insert(param, bind_param_metadata(fusion, param)?);
    }

    let mut order = Vec::new();
    for expr in fusion.exprs(true, false, true)? {
        let out = fusion
            .expr(expr)?
            .single_output()
            .ok_or(FusionError::MultiOutput(expr))?;
        if fusion.is_tensor(out) {
            order.push(expr);
        }
    }
    log::debug!("lowering {} tensor expressions", order.len());

    let has_rng = fusion.has_rng()?;
    let has_block_reduction = fusion.has_block_reduction()?;
    let has_grid_reduction = fusion.has_grid_reduction()?;

    let mut builder = LoopNestBuilder::new(fusion, &strides);
    for expr in order {
        builder.lower_expr(expr)?;
    }
    let lowered = builder.finish();

    let kernel = Kernel {
        name: config.kernel_name.clone(),
        params,
        body: lowered.body,
        has_rng,
        has_block_reduction,
        has_grid_reduction,
        reduction_ops: lowered.reduction_ops,
        grid_reductions: lowered.grid_reductions,
        strides,
        hardware_indices: lowered.hardware_indices,
        shared_mem_elems: config.shared_mem_elems,
    };
    if config.dump_kernel {
        log::debug!("generated kernel:\n{}", kernel.to_source(fusion)?);
    }
    Ok(kernel)
}

/// Names the symbolic extents of a tensor parameter `T{n}.size[k]` and
/// creates its stride symbols.
fn bind_param_metadata(fusion: &mut Fusion, tv: ValId) -> FusionResult<Vec<ValId>> {
    let name = fusion.name(tv)?;
    let root = fusion.tensor(tv)?.domain.root.clone();
    let mut strides = Vec::new();
    for id in fusion.no_reductions(&root)? {
        let k = strides.len();
        let extent = fusion.iter_domain(id)?.extent;
        let symbolic = fusion.origin(extent).is_none() && fusion.const_value(extent)?.is_none();
        if symbolic && fusion.lowered_val(extent) == extent {
            let size = fusion.new_named_scalar(format!("T{name}.size[{k}]"), DataType::Int);
            fusion.set_lowered_val(extent, size)?;
        }
        strides.push(fusion.new_named_scalar(format!("T{name}.stride[{k}]"), DataType::Int));
    }
    Ok(strides)
}

/// Lowers with the default configuration and prints the kernel.
pub fn print_kernel(fusion: &mut Fusion) -> FusionResult<String> {
    let kernel = lower(fusion, &LowerConfig::default())?;
    kernel.to_source(fusion)
}

impl Fusion {
    pub fn print_kernel(&mut self) -> FusionResult<String> {
        print_kernel(self)
    }
}
