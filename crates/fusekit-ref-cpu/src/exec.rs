use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, ensure, Context, Result};
use fusekit::ir::{
    BinaryOpType, DataType, ExprKind, ParallelType, TernaryOpType, UnaryOpType, ValId, ValKind,
};
use fusekit::lower::{KernelNode, LoweredExpr, LoweredOp, ReductionPlan};
use fusekit::{EvaluationContext, Fusion, Kernel};

/// Grid and block dimensions, x first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: [usize; 3],
    pub block: [usize; 3],
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            grid: [1; 3],
            block: [1; 3],
        }
    }
}

impl LaunchConfig {
    pub fn new(grid: [usize; 3], block: [usize; 3]) -> Self {
        LaunchConfig { grid, block }
    }

    fn lanes(&self) -> usize {
        self.grid.iter().chain(&self.block).product()
    }

    /// `[bx, by, bz, tx, ty, tz]` of lane `lane`, x varying fastest.
    fn coords(&self, mut lane: usize) -> [usize; 6] {
        let dims = [
            self.grid[0],
            self.grid[1],
            self.grid[2],
            self.block[0],
            self.block[1],
            self.block[2],
        ];
        let mut coords = [0; 6];
        for slot in [3, 4, 5, 0, 1, 2] {
            coords[slot] = lane % dims[slot];
            lane /= dims[slot];
        }
        coords
    }
}

/// Dense row-major f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        ensure!(
            data.len() == expected,
            "shape {shape:?} holds {expected} elements, got {}",
            data.len()
        );
        Ok(HostTensor { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        HostTensor {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn strides(&self) -> Vec<usize> {
        compute_strides(&self.shape)
    }

    /// Element at a multi-dimensional position.
    pub fn at(&self, position: &[usize]) -> Option<f32> {
        if position.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for ((&p, &dim), stride) in position.iter().zip(&self.shape).zip(self.strides()) {
            if p >= dim {
                return None;
            }
            offset += p * stride;
        }
        self.data.get(offset).copied()
    }
}

/// One argument per fusion input, in input order.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Tensor(HostTensor),
    Float(f32),
    Int(i64),
}

/// Element reference resolved for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    Global(ValId, usize),
    Local(ValId, usize),
}

struct Lane<'f> {
    ctx: EvaluationContext<'f>,
    coords: [usize; 6],
    locals: HashMap<ValId, Vec<f32>>,
}

struct Executor<'f> {
    fusion: &'f Fusion,
    globals: HashMap<ValId, Vec<f32>>,
    floats: HashMap<ValId, f32>,
    lanes: Vec<Lane<'f>>,
}

/// Runs `kernel` on the host and returns the fusion outputs.
///
/// Every lane of the launch executes the kernel body in lockstep. Block and
/// grid reductions combine the active lanes that agree on every launch
/// coordinate the reduction does not span.
pub fn run_kernel(
    fusion: &Fusion,
    kernel: &Kernel,
    launch: &LaunchConfig,
    args: Vec<KernelArg>,
) -> Result<Vec<HostTensor>> {
    if kernel.has_rng {
        bail!("kernel {} draws random numbers, which the host executor does not model", kernel.name);
    }
    ensure!(
        launch.grid.iter().chain(&launch.block).all(|dim| *dim > 0),
        "launch dimensions must be positive: {launch:?}"
    );
    let inputs = fusion.inputs();
    ensure!(
        args.len() == inputs.len(),
        "kernel {} takes {} arguments, got {}",
        kernel.name,
        inputs.len(),
        args.len()
    );

    let mut bindings: Vec<(ValId, i64)> = Vec::new();
    let mut globals = HashMap::new();
    let mut floats = HashMap::new();
    for (&input, arg) in inputs.iter().zip(args) {
        match arg {
            KernelArg::Tensor(tensor) => {
                bind_tensor_metadata(fusion, kernel, input, &tensor.shape, &mut bindings)?;
                globals.insert(input, tensor.data);
            }
            KernelArg::Float(value) => {
                ensure!(
                    fusion.dtype(input)?.is_floating_point() && !fusion.is_tensor(input),
                    "argument for {input} is a float but the input is not a floating-point scalar"
                );
                floats.insert(input, value);
            }
            KernelArg::Int(value) => {
                ensure!(
                    !fusion.is_tensor(input) && !fusion.dtype(input)?.is_floating_point(),
                    "argument for {input} is an integer but the input is not an integer scalar"
                );
                bindings.push((input, value));
            }
        }
    }

    let mut outputs = Vec::new();
    for &output in fusion.outputs() {
        if globals.contains_key(&output) {
            continue;
        }
        let shape = output_shape(fusion, &bindings, output)?;
        bind_tensor_metadata(fusion, kernel, output, &shape, &mut bindings)?;
        let tensor = HostTensor::zeros(shape);
        globals.insert(output, tensor.data);
        outputs.push((output, tensor.shape));
    }

    let lane_count = launch.lanes();
    log::debug!(
        "running {} on {lane_count} lanes (grid {:?}, block {:?})",
        kernel.name,
        launch.grid,
        launch.block
    );
    let mut lanes = Vec::with_capacity(lane_count);
    for lane in 0..lane_count {
        let coords = launch.coords(lane);
        let mut ctx = EvaluationContext::new(fusion);
        for &(symbol, value) in &bindings {
            ctx.bind(symbol, value)?;
        }
        for &(parallel, symbol) in &kernel.hardware_indices {
            ctx.bind(symbol, coords[coord_slot(parallel)?] as i64)?;
        }
        lanes.push(Lane {
            ctx,
            coords,
            locals: HashMap::new(),
        });
    }

    let mut executor = Executor {
        fusion,
        globals,
        floats,
        lanes,
    };
    let active = vec![true; lane_count];
    executor.run(&kernel.body, &active)?;

    outputs
        .into_iter()
        .map(|(output, shape)| {
            let data = executor
                .globals
                .remove(&output)
                .ok_or_else(|| anyhow!("output {output} has no buffer"))?;
            HostTensor::new(shape, data)
        })
        .collect()
}

fn coord_slot(parallel: ParallelType) -> Result<usize> {
    let slot = parallel
        .dim_slot()
        .ok_or_else(|| anyhow!("{parallel} is not a launch dimension"))?;
    Ok(if parallel.is_thread_dim() { 3 + slot } else { slot })
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

/// Binds the extent and stride symbols of a tensor parameter.
fn bind_tensor_metadata(
    fusion: &Fusion,
    kernel: &Kernel,
    tv: ValId,
    shape: &[usize],
    bindings: &mut Vec<(ValId, i64)>,
) -> Result<()> {
    let view = fusion.tensor(tv)?;
    ensure!(
        view.dtype == DataType::Float,
        "tensor parameter {tv} is {}, only float tensors are supported",
        view.dtype
    );
    let root = fusion.no_reductions(&view.domain.root)?;
    ensure!(
        root.len() == shape.len(),
        "tensor parameter {tv} has rank {}, argument has shape {shape:?}",
        root.len()
    );
    for (&id, &dim) in root.iter().zip(shape) {
        let extent = fusion.iter_domain(id)?.extent;
        let symbol = fusion.lowered_val(extent);
        if let Some(constant) = fusion.const_int(symbol) {
            ensure!(
                constant == dim as i64,
                "tensor parameter {tv} has a fixed extent {constant}, argument has {dim}"
            );
            continue;
        }
        if fusion.origin(symbol).is_some() {
            continue;
        }
        match bindings.iter().find(|(bound, _)| *bound == symbol) {
            Some(&(_, previous)) => ensure!(
                previous == dim as i64,
                "extent {symbol} is bound to {previous} but tensor parameter {tv} has {dim}"
            ),
            None => bindings.push((symbol, dim as i64)),
        }
    }
    if let Some(strides) = kernel.strides.get(&tv) {
        for (&symbol, stride) in strides.iter().zip(compute_strides(shape)) {
            bindings.push((symbol, stride as i64));
        }
    }
    Ok(())
}

fn output_shape(fusion: &Fusion, bindings: &[(ValId, i64)], tv: ValId) -> Result<Vec<usize>> {
    let mut ctx = EvaluationContext::new(fusion);
    for &(symbol, value) in bindings {
        ctx.bind(symbol, value)?;
    }
    let root = fusion.no_reductions(&fusion.tensor(tv)?.domain.root)?;
    let mut shape = Vec::with_capacity(root.len());
    for id in root {
        let extent = fusion.iter_domain(id)?.extent;
        let value = ctx
            .evaluate(extent)?
            .ok_or_else(|| anyhow!("extent of output {tv} depends on an unbound size"))?;
        ensure!(value >= 0, "output {tv} has negative extent {value}");
        shape.push(value as usize);
    }
    Ok(shape)
}

impl<'f> Executor<'f> {
    fn run(&mut self, nodes: &[KernelNode], active: &[bool]) -> Result<()> {
        if !active.iter().any(|a| *a) {
            return Ok(());
        }
        for node in nodes {
            match node {
                KernelNode::ForLoop {
                    index,
                    iter_domain,
                    extent,
                    body,
                } => {
                    let start = self.fusion.iter_domain(*iter_domain)?.start;
                    let start = self.int(0, start)?;
                    let stop = self.int(0, *extent)?;
                    for i in start..stop {
                        for lane in &mut self.lanes {
                            lane.ctx.bind(*index, i)?;
                        }
                        self.run(body, active)?;
                    }
                }
                KernelNode::IfThenElse {
                    cond,
                    then_body,
                    else_body,
                } => {
                    let mut taken = vec![false; active.len()];
                    let mut skipped = vec![false; active.len()];
                    for lane in 0..active.len() {
                        if !active[lane] {
                            continue;
                        }
                        if self.int(lane, *cond)? != 0 {
                            taken[lane] = true;
                        } else {
                            skipped[lane] = true;
                        }
                    }
                    self.run(then_body, &taken)?;
                    self.run(else_body, &skipped)?;
                }
                KernelNode::Allocate { buffer, size, .. } => {
                    for lane in 0..active.len() {
                        if !active[lane] {
                            continue;
                        }
                        let size = self.int(lane, *size)?;
                        ensure!(size >= 0, "negative allocation size for {buffer}");
                        self.lanes[lane]
                            .locals
                            .insert(*buffer, vec![0.0; size as usize]);
                    }
                }
                KernelNode::Expr(expr) => self.statement(expr, active)?,
            }
        }
        Ok(())
    }

    fn statement(&mut self, expr: &LoweredExpr, active: &[bool]) -> Result<()> {
        if let LoweredOp::Reduce(plan) = &expr.op {
            if !plan.is_serial() {
                return self.parallel_reduction(expr, plan, active);
            }
        }
        let mut writes = Vec::new();
        for lane in 0..active.len() {
            if !active[lane] {
                continue;
            }
            let place = self.place(lane, expr.output)?;
            let value = match &expr.op {
                LoweredOp::Set => {
                    let input = first_input(expr)?;
                    self.operand(lane, input)?
                }
                LoweredOp::Elementwise(kind) => {
                    let mut operands = Vec::with_capacity(expr.inputs.len());
                    for &input in &expr.inputs {
                        operands.push(self.operand(lane, input)?);
                    }
                    let to = self.fusion.dtype(expr.output)?;
                    apply(kind, &operands, to)?
                }
                LoweredOp::Reduce(plan) => {
                    let input = first_input(expr)?;
                    let current = self.read(lane, place)?;
                    let value = self.operand(lane, input)?;
                    binary(plan.op, current, value)?
                }
            };
            writes.push((lane, place, value));
        }
        for (lane, place, value) in writes {
            self.write(lane, place, value)?;
        }
        Ok(())
    }

    fn parallel_reduction(
        &mut self,
        expr: &LoweredExpr,
        plan: &ReductionPlan,
        active: &[bool],
    ) -> Result<()> {
        let input = first_input(expr)?;
        let mut groups: BTreeMap<[usize; 6], Vec<usize>> = BTreeMap::new();
        for lane in 0..active.len() {
            if !active[lane] {
                continue;
            }
            let mut key = self.lanes[lane].coords;
            for d in 0..3 {
                if plan.blocks[d] {
                    key[d] = 0;
                }
                if plan.threads[d] {
                    key[3 + d] = 0;
                }
            }
            groups.entry(key).or_default().push(lane);
        }

        let mut writes = Vec::new();
        for members in groups.values() {
            let mut total: Option<f32> = None;
            for &lane in members {
                let value = self.operand(lane, input)?;
                total = Some(match total {
                    Some(acc) => binary(plan.op, acc, value)?,
                    None => value,
                });
            }
            let Some(total) = total else {
                continue;
            };
            let mut written = Vec::new();
            for &lane in members {
                let place = self.place(lane, expr.output)?;
                if matches!(place, Place::Global(..)) {
                    if written.contains(&place) {
                        continue;
                    }
                    written.push(place);
                }
                let current = self.read(lane, place)?;
                writes.push((lane, place, binary(plan.op, current, total)?));
            }
        }
        for (lane, place, value) in writes {
            self.write(lane, place, value)?;
        }
        Ok(())
    }

    fn int(&mut self, lane: usize, val: ValId) -> Result<i64> {
        self.lanes[lane]
            .ctx
            .evaluate(val)?
            .ok_or_else(|| anyhow!("{val} depends on an unbound symbol"))
    }

    fn place(&mut self, lane: usize, val: ValId) -> Result<Place> {
        let index = self
            .fusion
            .tensor_index(val)
            .with_context(|| format!("statement target {val} is not a tensor element"))?;
        let mut offset = 0i64;
        for &term in &index.indices {
            let term = self.int(lane, term)?;
            offset = offset
                .checked_add(term)
                .ok_or_else(|| anyhow!("offset into {} overflows", index.view))?;
        }
        ensure!(offset >= 0, "negative offset {offset} into {}", index.view);
        let offset = offset as usize;
        Ok(if self.globals.contains_key(&index.view) {
            Place::Global(index.view, offset)
        } else {
            Place::Local(index.view, offset)
        })
    }

    fn buffer(&self, lane: usize, place: Place) -> Result<(&[f32], usize)> {
        let (buffer, offset) = match place {
            Place::Global(view, offset) => (self.globals.get(&view), offset),
            Place::Local(view, offset) => (self.lanes[lane].locals.get(&view), offset),
        };
        let buffer = buffer.ok_or_else(|| anyhow!("{place:?} is not allocated"))?;
        Ok((buffer.as_slice(), offset))
    }

    fn read(&self, lane: usize, place: Place) -> Result<f32> {
        let (buffer, offset) = self.buffer(lane, place)?;
        buffer.get(offset).copied().ok_or_else(|| {
            anyhow!("read of {place:?} past the end of a {}-element buffer", buffer.len())
        })
    }

    fn write(&mut self, lane: usize, place: Place, value: f32) -> Result<()> {
        let (buffer, offset) = match place {
            Place::Global(view, offset) => (self.globals.get_mut(&view), offset),
            Place::Local(view, offset) => (self.lanes[lane].locals.get_mut(&view), offset),
        };
        let buffer = buffer.ok_or_else(|| anyhow!("{place:?} is not allocated"))?;
        let len = buffer.len();
        let slot = buffer
            .get_mut(offset)
            .ok_or_else(|| anyhow!("write of {place:?} past the end of a {len}-element buffer"))?;
        *slot = value;
        Ok(())
    }

    fn operand(&mut self, lane: usize, val: ValId) -> Result<f32> {
        if self.fusion.tensor_index(val).is_ok() {
            let place = self.place(lane, val)?;
            return self.read(lane, place);
        }
        self.scalar(lane, val)
    }

    /// Value of a scalar operand: constants, float arguments, integer
    /// symbols through the lane's evaluator, and computed float scalars.
    fn scalar(&mut self, lane: usize, val: ValId) -> Result<f32> {
        if let Some(constant) = self.fusion.const_value(val)? {
            return Ok(constant.as_f64() as f32);
        }
        if let Some(value) = self.floats.get(&val) {
            return Ok(*value);
        }
        let node = self.fusion.val(val)?;
        let dtype = match &node.kind {
            ValKind::Scalar(scalar) => scalar.dtype,
            ValKind::NamedScalar { dtype, .. } => *dtype,
            _ => bail!("{val} is a {}, not a scalar operand", node.kind_name()),
        };
        if !dtype.is_floating_point() {
            return Ok(self.int(lane, val)? as f32);
        }
        let origin = self
            .fusion
            .origin(val)
            .ok_or_else(|| anyhow!("float scalar {val} has no value"))?;
        let expr = self.fusion.expr(origin)?;
        let kind = expr.kind.clone();
        let inputs = expr.inputs.clone();
        let mut operands = Vec::with_capacity(inputs.len());
        for input in inputs {
            operands.push(self.scalar(lane, input)?);
        }
        apply(&kind, &operands, dtype)
    }
}

fn first_input(expr: &LoweredExpr) -> Result<ValId> {
    expr.inputs
        .first()
        .copied()
        .ok_or_else(|| anyhow!("statement for {} has no operand", expr.origin))
}

fn bool_value(value: bool) -> f32 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn apply(kind: &ExprKind, operands: &[f32], to: DataType) -> Result<f32> {
    match (kind, operands) {
        (ExprKind::Unary(op), &[a]) => unary(*op, a, to),
        (ExprKind::Binary(op), &[a, b]) => binary(*op, a, b),
        (ExprKind::Ternary(op), &[a, b, c]) => Ok(ternary(*op, a, b, c)),
        (kind, operands) => bail!(
            "{} cannot be applied to {} operands",
            kind.name(),
            operands.len()
        ),
    }
}

fn unary(op: UnaryOpType, x: f32, to: DataType) -> Result<f32> {
    Ok(match op {
        UnaryOpType::Abs => x.abs(),
        UnaryOpType::Cast => match to {
            DataType::Int => x.trunc(),
            DataType::Bool => bool_value(x != 0.0),
            DataType::Float | DataType::Half => x,
        },
        UnaryOpType::Ceil => x.ceil(),
        UnaryOpType::Cos => x.cos(),
        UnaryOpType::Exp => x.exp(),
        UnaryOpType::Floor => x.floor(),
        UnaryOpType::Log => x.ln(),
        UnaryOpType::Neg => -x,
        UnaryOpType::Reciprocal => 1.0 / x,
        UnaryOpType::Relu => x.max(0.0),
        UnaryOpType::Rsqrt => 1.0 / x.sqrt(),
        UnaryOpType::Set => x,
        UnaryOpType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOpType::Sin => x.sin(),
        UnaryOpType::Sqrt => x.sqrt(),
        UnaryOpType::Tanh => x.tanh(),
        UnaryOpType::RandLike => bail!("randLike has no host implementation"),
    })
}

fn binary(op: BinaryOpType, a: f32, b: f32) -> Result<f32> {
    Ok(match op {
        BinaryOpType::Add => a + b,
        BinaryOpType::And => bool_value(a != 0.0 && b != 0.0),
        BinaryOpType::CeilDiv => (a / b).ceil(),
        BinaryOpType::Div => a / b,
        BinaryOpType::Eq => bool_value(a == b),
        BinaryOpType::Ge => bool_value(a >= b),
        BinaryOpType::Gt => bool_value(a > b),
        BinaryOpType::Le => bool_value(a <= b),
        BinaryOpType::Lt => bool_value(a < b),
        BinaryOpType::Max => a.max(b),
        BinaryOpType::Min => a.min(b),
        BinaryOpType::Mod => a % b,
        BinaryOpType::Mul => a * b,
        BinaryOpType::Ne => bool_value(a != b),
        BinaryOpType::Pow => a.powf(b),
        BinaryOpType::Sub => a - b,
    })
}

fn ternary(op: TernaryOpType, a: f32, b: f32, c: f32) -> f32 {
    match op {
        TernaryOpType::Clamp => a.max(b).min(c),
        TernaryOpType::Lerp => a + c * (b - a),
        TernaryOpType::Threshold => {
            if a <= b {
                c
            } else {
                a
            }
        }
        TernaryOpType::Where => {
            if a != 0.0 {
                b
            } else {
                c
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_coordinates_vary_thread_x_fastest() {
        let launch = LaunchConfig::new([2, 1, 1], [3, 1, 1]);
        assert_eq!(launch.lanes(), 6);
        assert_eq!(launch.coords(0), [0, 0, 0, 0, 0, 0]);
        assert_eq!(launch.coords(2), [0, 0, 0, 2, 0, 0]);
        assert_eq!(launch.coords(3), [1, 0, 0, 0, 0, 0]);
        assert_eq!(launch.coords(5), [1, 0, 0, 2, 0, 0]);
    }

    #[test]
    fn host_tensor_lookup_is_row_major() {
        let tensor = HostTensor::new(vec![2, 3], (0..6).map(|v| v as f32).collect())
            .expect("tensor");
        assert_eq!(tensor.strides(), vec![3, 1]);
        assert_eq!(tensor.at(&[1, 2]), Some(5.0));
        assert_eq!(tensor.at(&[2, 0]), None);
        assert!(HostTensor::new(vec![2, 2], vec![0.0; 3]).is_err());
    }

    #[test]
    fn ternary_ops_follow_device_definitions() {
        assert_eq!(ternary(TernaryOpType::Where, 1.0, 2.0, 3.0), 2.0);
        assert_eq!(ternary(TernaryOpType::Where, 0.0, 2.0, 3.0), 3.0);
        assert_eq!(ternary(TernaryOpType::Clamp, 5.0, 0.0, 4.0), 4.0);
        assert_eq!(ternary(TernaryOpType::Threshold, 0.5, 1.0, -1.0), -1.0);
        assert_eq!(ternary(TernaryOpType::Lerp, 1.0, 3.0, 0.5), 2.0);
    }
}
