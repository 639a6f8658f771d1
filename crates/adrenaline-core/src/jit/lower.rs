//! Lowering of typed functions to Cranelift IR
//!
//! Every local becomes a frontend [`Variable`] (arrays become a pointer and a length).
//! Checks that would raise under host semantics branch to a per-function deopt block,
//! which flags the context and returns.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, Block, FuncRef, InstBuilder, MemFlags, StackSlotData, StackSlotKind, Type, Value,
};
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};

use crate::analysis::typed::{
    ArithOp, BuiltinOp, CastOp, CmpKind, Const, ForLoop, FuncIndex, Label, LocalId, LocalOrigin,
    LogicOp, LoopBound, NumType, ParallelLoop, Reduction, ReductionOp, ReturnKind, TArg, TExpr,
    TExprKind, TReturn, TStmt, TypedBody, TypedFunction, UnOp, ValueKind, VectorForm, VectorLoop,
};
use crate::numeric::EXACT_FLOAT_INT;

use super::runtime::{reduction_code, status, ExecCtx, RawArray};
use super::types::{clif_type, return_type, F64X2, WORD};
use super::{JitError, JitResult};

/// Declared runtime helpers
#[derive(Debug, Clone, Copy)]
pub(super) struct Helpers {
    pub parallel_for: FuncId,
    pub float_mod: FuncId,
    pub float_floordiv: FuncId,
    pub float_pow: FuncId,
    pub int_pow: FuncId,
}

/// Everything a body may refer to by id
pub(super) struct Symbols {
    pub functions: HashMap<FuncIndex, FuncId>,
    pub kernels: HashMap<*const ParallelLoop, FuncId>,
    pub helpers: Helpers,
}

/// Outlined loops of `body`, in program order
pub(super) fn parallel_loops<'a>(body: &'a [TStmt], out: &mut Vec<&'a ParallelLoop>) {
    for stmt in body {
        if let TStmt::Parallel(p) = stmt {
            out.push(p);
        }
        for block in stmt.blocks() {
            parallel_loops(block, out);
        }
    }
}

/// Integer sums whose split form must prove no sequential prefix overflows
fn needs_magnitude(r: &Reduction) -> bool {
    r.ty == NumType::Int && matches!(r.op, ReductionOp::Add | ReductionOp::Sub)
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Scalar(Variable),
    Array { ptr: Variable, len: Variable },
}

#[derive(Debug, Clone, Copy)]
struct LoopTargets {
    latch: Block,
    exit: Block,
}

struct FunctionLowering<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    symbols: &'a Symbols,
    body: &'a TypedBody,
    function: &'a TypedFunction,
    slots: Vec<Slot>,
    /// Lane accumulators standing in for a reduction local
    overrides: HashMap<LocalId, Variable>,
    /// Integer sum reductions being split: running `Σ|delta|` of their updates
    magnitudes: HashMap<LocalId, Variable>,
    next_var: u32,
    ctx: Value,
    deopt: Block,
    ret: Type,
    /// Depth on entry, restored by every return
    entry_depth: Option<Value>,
    loops: Vec<LoopTargets>,
    labels: Vec<(Label, Block)>,
    func_refs: HashMap<FuncId, FuncRef>,
}

/// Lower a specialization into `builder`, whose signature is already set
pub(super) fn lower_function(
    builder: &mut FunctionBuilder<'_>,
    module: &mut JITModule,
    symbols: &Symbols,
    body: &TypedBody,
    index: FuncIndex,
) -> JitResult<()> {
    let function = body.function(index);
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry).to_vec();
    let ctx = *params
        .last()
        .ok_or_else(|| JitError::Internal("missing context parameter".into()))?;

    let mut lowering = FunctionLowering::new(builder, module, symbols, body, function, ctx, return_type(function.ret));
    let mut next = 0;
    for (param, kind) in function.params.iter().zip(&function.arg_kinds) {
        match (lowering.slot(*param)?, kind) {
            (Slot::Scalar(var), ValueKind::Scalar(_)) => {
                lowering.builder.def_var(var, params[next]);
                next += 1;
            }
            (Slot::Array { ptr, len }, ValueKind::Array(_)) => {
                lowering.builder.def_var(ptr, params[next]);
                lowering.builder.def_var(len, params[next + 1]);
                next += 2;
            }
            _ => return Err(JitError::Internal(format!("parameter kind mismatch in '{}'", function.name))),
        }
    }

    let flags = MemFlags::trusted();
    let depth = lowering.builder.ins().load(types::I32, flags, ctx, ExecCtx::DEPTH);
    let max_depth = lowering.builder.ins().load(types::I32, flags, ctx, ExecCtx::MAX_DEPTH);
    let deeper = lowering.builder.ins().iadd_imm(depth, 1);
    let too_deep = lowering.builder.ins().icmp(IntCC::UnsignedGreaterThan, deeper, max_depth);
    lowering.deopt_if(too_deep);
    lowering.builder.ins().store(flags, deeper, ctx, ExecCtx::DEPTH);
    lowering.entry_depth = Some(depth);

    lowering.block(&function.body)?;
    lowering.emit_return(None);
    lowering.finish();
    Ok(())
}

/// Lower the chunk loop of `p` as a kernel `(env, arrays, lo, hi, ctx) -> partial`
pub(super) fn lower_kernel(
    builder: &mut FunctionBuilder<'_>,
    module: &mut JITModule,
    symbols: &Symbols,
    body: &TypedBody,
    index: FuncIndex,
    p: &ParallelLoop,
) -> JitResult<()> {
    let function = body.function(index);
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry).to_vec();
    let &[env, arrays, lo, hi, ctx] = params.as_slice() else {
        return Err(JitError::Internal("kernel signature".into()));
    };

    let mut lowering = FunctionLowering::new(builder, module, symbols, body, function, ctx, WORD);
    let flags = MemFlags::trusted();
    for (k, id) in p.captures.iter().enumerate() {
        let var = lowering.scalar_var(*id)?;
        let ty = lowering.scalar_type(*id)?;
        let bits = lowering.builder.ins().load(WORD, flags, env, (k * 8) as i32);
        let value = lowering.from_bits(bits, ty);
        lowering.builder.def_var(var, value);
    }
    for (k, id) in p.arrays.iter().enumerate() {
        let Slot::Array { ptr, len } = lowering.slot(*id)? else {
            return Err(JitError::Internal("captured array is a scalar".into()));
        };
        let base = k as i32 * RawArray::SIZE;
        let data = lowering.builder.ins().load(WORD, flags, arrays, base + RawArray::PTR);
        let count = lowering.builder.ins().load(WORD, flags, arrays, base + RawArray::LEN);
        lowering.builder.def_var(ptr, data);
        lowering.builder.def_var(len, count);
    }
    let chunk_lo = lowering.scalar_var(p.chunk_lo)?;
    let chunk_hi = lowering.scalar_var(p.chunk_hi)?;
    lowering.builder.def_var(chunk_lo, lo);
    lowering.builder.def_var(chunk_hi, hi);
    if let Some(r) = p.reduction {
        let var = lowering.scalar_var(r.acc)?;
        let identity = lowering.constant(r.op.identity(r.ty));
        lowering.builder.def_var(var, identity);
        if needs_magnitude(&r) {
            let magnitude = lowering.new_var(types::I64);
            lowering.magnitudes.insert(r.acc, magnitude);
        }
    }

    lowering.stmt(&p.chunk)?;
    // The driver checks each chunk's magnitude against the running total
    let tracked: Vec<Variable> = lowering.magnitudes.drain().map(|(_, var)| var).collect();
    for magnitude in tracked {
        let total = lowering.builder.use_var(magnitude);
        lowering.builder.ins().store(flags, total, ctx, ExecCtx::MAGNITUDE);
    }
    let partial = match p.reduction {
        Some(r) => {
            let var = lowering.scalar_var(r.acc)?;
            let value = lowering.builder.use_var(var);
            lowering.to_bits(value, r.ty)
        }
        None => lowering.builder.ins().iconst(WORD, 0),
    };
    lowering.builder.ins().return_(&[partial]);
    lowering.fresh_block();
    lowering.emit_return(None);
    lowering.finish();
    Ok(())
}

/// Lower the trampoline `(scalars, arrays, ctx) -> bits` calling `root_id`
pub(super) fn lower_entry(builder: &mut FunctionBuilder<'_>, module: &mut JITModule, root: &TypedFunction, root_id: FuncId) -> JitResult<()> {
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry).to_vec();
    let &[scalars, arrays, ctx] = params.as_slice() else {
        return Err(JitError::Internal("entry signature".into()));
    };

    let flags = MemFlags::trusted();
    let mut args = Vec::new();
    let (mut scalar, mut array) = (0i32, 0i32);
    for kind in &root.arg_kinds {
        match kind {
            ValueKind::Scalar(NumType::Bool) => {
                let bits = builder.ins().load(WORD, flags, scalars, scalar * 8);
                args.push(builder.ins().ireduce(types::I8, bits));
                scalar += 1;
            }
            ValueKind::Scalar(ty) => {
                args.push(builder.ins().load(clif_type(*ty), flags, scalars, scalar * 8));
                scalar += 1;
            }
            ValueKind::Array(_) => {
                let base = array * RawArray::SIZE;
                args.push(builder.ins().load(WORD, flags, arrays, base + RawArray::PTR));
                args.push(builder.ins().load(WORD, flags, arrays, base + RawArray::LEN));
                array += 1;
            }
        }
    }
    args.push(ctx);
    let callee = module.declare_func_in_func(root_id, builder.func);
    let call = builder.ins().call(callee, &args);
    let result = builder.inst_results(call)[0];
    let bits = match root.ret {
        ReturnKind::Scalar(NumType::Float) => builder.ins().bitcast(WORD, MemFlags::new(), result),
        ReturnKind::Scalar(NumType::Bool) => builder.ins().uextend(WORD, result),
        _ => result,
    };
    builder.ins().return_(&[bits]);
    builder.seal_all_blocks();
    Ok(())
}

impl<'a, 'b> FunctionLowering<'a, 'b> {
    fn new(
        builder: &'a mut FunctionBuilder<'b>,
        module: &'a mut JITModule,
        symbols: &'a Symbols,
        body: &'a TypedBody,
        function: &'a TypedFunction,
        ctx: Value,
        ret: Type,
    ) -> Self {
        let deopt = builder.create_block();
        let mut lowering = Self {
            builder,
            module,
            symbols,
            body,
            function,
            slots: Vec::with_capacity(function.locals.len()),
            overrides: HashMap::new(),
            magnitudes: HashMap::new(),
            next_var: 0,
            ctx,
            deopt,
            ret,
            entry_depth: None,
            loops: Vec::new(),
            labels: Vec::new(),
            func_refs: HashMap::new(),
        };
        for decl in &function.locals {
            let slot = match decl.kind {
                ValueKind::Scalar(ty) => Slot::Scalar(lowering.new_var(clif_type(ty))),
                ValueKind::Array(_) => Slot::Array {
                    ptr: lowering.new_var(WORD),
                    len: lowering.new_var(WORD),
                },
            };
            lowering.slots.push(slot);
        }
        lowering
    }

    fn new_var(&mut self, ty: Type) -> Variable {
        let var = Variable::from_u32(self.next_var);
        self.next_var += 1;
        self.builder.declare_var(var, ty);
        let zero = self.zero(ty);
        self.builder.def_var(var, zero);
        var
    }

    /// Emit the deopt block and seal everything
    fn finish(&mut self) {
        self.builder.switch_to_block(self.deopt);
        let flag = self.builder.ins().iconst(types::I32, i64::from(status::DEOPT));
        self.builder.ins().store(MemFlags::trusted(), flag, self.ctx, ExecCtx::STATUS);
        let zero = self.zero(self.ret);
        self.builder.ins().return_(&[zero]);
        self.builder.seal_all_blocks();
    }

    fn zero(&mut self, ty: Type) -> Value {
        if ty.is_vector() {
            let lane = self.zero(ty.lane_type());
            return self.builder.ins().splat(ty, lane);
        }
        if ty.is_float() {
            self.builder.ins().f64const(0.0)
        } else {
            self.builder.ins().iconst(ty, 0)
        }
    }

    fn slot(&self, id: LocalId) -> JitResult<Slot> {
        self.slots
            .get(id.index())
            .copied()
            .ok_or_else(|| JitError::Internal(format!("unknown local {}", id.0)))
    }

    fn scalar_var(&self, id: LocalId) -> JitResult<Variable> {
        if let Some(var) = self.overrides.get(&id) {
            return Ok(*var);
        }
        match self.slot(id)? {
            Slot::Scalar(var) => Ok(var),
            Slot::Array { .. } => Err(JitError::Internal(format!(
                "'{}' is an array",
                self.function.local(id).name
            ))),
        }
    }

    fn scalar_type(&self, id: LocalId) -> JitResult<NumType> {
        match self.function.local(id).kind {
            ValueKind::Scalar(ty) => Ok(ty),
            ValueKind::Array(_) => Err(JitError::Internal("expected a scalar local".into())),
        }
    }

    fn array(&mut self, id: LocalId) -> JitResult<(Value, Value)> {
        match self.slot(id)? {
            Slot::Array { ptr, len } => Ok((self.builder.use_var(ptr), self.builder.use_var(len))),
            Slot::Scalar(_) => Err(JitError::Internal(format!(
                "'{}' is not an array",
                self.function.local(id).name
            ))),
        }
    }

    fn func_ref(&mut self, id: FuncId) -> FuncRef {
        if let Some(r) = self.func_refs.get(&id) {
            return *r;
        }
        let r = self.module.declare_func_in_func(id, self.builder.func);
        self.func_refs.insert(id, r);
        r
    }

    // Control flow

    /// Continue emitting into an unreachable block after a terminator
    fn fresh_block(&mut self) {
        let block = self.builder.create_block();
        self.builder.switch_to_block(block);
    }

    fn deopt_if(&mut self, cond: Value) {
        let cont = self.builder.create_block();
        self.builder.ins().brif(cond, self.deopt, &[], cont, &[]);
        self.builder.switch_to_block(cont);
    }

    fn check_status(&mut self) {
        let st = self
            .builder
            .ins()
            .load(types::I32, MemFlags::trusted(), self.ctx, ExecCtx::STATUS);
        let failed = self.builder.ins().icmp_imm(IntCC::NotEqual, st, 0);
        self.deopt_if(failed);
    }

    fn emit_return(&mut self, value: Option<Value>) {
        if let Some(depth) = self.entry_depth {
            self.builder.ins().store(MemFlags::trusted(), depth, self.ctx, ExecCtx::DEPTH);
        }
        let value = match value {
            Some(v) => v,
            None => self.zero(self.ret),
        };
        self.builder.ins().return_(&[value]);
    }

    fn call_helper(&mut self, id: FuncId, args: &[Value]) -> Value {
        let callee = self.func_ref(id);
        let call = self.builder.ins().call(callee, args);
        self.builder.inst_results(call)[0]
    }

    // Statements

    fn block(&mut self, statements: &[TStmt]) -> JitResult<()> {
        for stmt in statements {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &TStmt) -> JitResult<()> {
        match stmt {
            TStmt::Assign(id, value) => {
                let var = self.scalar_var(*id)?;
                let tracked = self.magnitudes.get(id).copied();
                let before = tracked.map(|_| self.builder.use_var(var));
                let v = self.expr(value)?;
                self.builder.def_var(var, v);
                if let (Some(magnitude), Some(before)) = (tracked, before) {
                    self.add_magnitude(magnitude, before, v);
                }
            }
            TStmt::Store { array, index, value } => {
                let v = self.expr(value)?;
                let i = self.expr(index)?;
                let addr = self.element_addr(*array, i)?;
                self.builder.ins().store(MemFlags::trusted(), v, addr, 0);
            }
            TStmt::Expr(e) => {
                self.expr(e)?;
            }
            TStmt::If { cond, then, otherwise } => {
                let c = self.expr(cond)?;
                let then_block = self.builder.create_block();
                let else_block = self.builder.create_block();
                let merge = self.builder.create_block();
                self.builder.ins().brif(c, then_block, &[], else_block, &[]);
                self.builder.switch_to_block(then_block);
                self.block(then)?;
                self.builder.ins().jump(merge, &[]);
                self.builder.switch_to_block(else_block);
                self.block(otherwise)?;
                self.builder.ins().jump(merge, &[]);
                self.builder.switch_to_block(merge);
            }
            TStmt::While { cond, body, .. } => {
                let header = self.builder.create_block();
                let body_block = self.builder.create_block();
                let exit = self.builder.create_block();
                self.builder.ins().jump(header, &[]);
                self.builder.switch_to_block(header);
                let c = self.expr(cond)?;
                self.builder.ins().brif(c, body_block, &[], exit, &[]);
                self.builder.switch_to_block(body_block);
                self.loops.push(LoopTargets { latch: header, exit });
                self.block(body)?;
                self.loops.pop();
                self.builder.ins().jump(header, &[]);
                self.builder.switch_to_block(exit);
            }
            TStmt::For(l) => self.for_loop(l)?,
            TStmt::Break | TStmt::Continue => {
                let targets = *self
                    .loops
                    .last()
                    .ok_or_else(|| JitError::Internal("loop exit outside a loop".into()))?;
                let target = if matches!(stmt, TStmt::Break) {
                    targets.exit
                } else {
                    targets.latch
                };
                self.builder.ins().jump(target, &[]);
                self.fresh_block();
            }
            TStmt::Return(value) => {
                let v = match value {
                    None => None,
                    Some(TReturn::Scalar(e)) => Some(self.expr(e)?),
                    Some(TReturn::Array(id)) => match self.function.local(*id).origin {
                        LocalOrigin::Param(position) => Some(self.builder.ins().iconst(WORD, position as i64)),
                        _ => return Err(JitError::Unsupported("returning an array that is not a parameter".into())),
                    },
                };
                self.emit_return(v);
                self.fresh_block();
            }
            TStmt::Block { label, body } => {
                let exit = self.builder.create_block();
                self.labels.push((*label, exit));
                self.block(body)?;
                self.labels.pop();
                self.builder.ins().jump(exit, &[]);
                self.builder.switch_to_block(exit);
            }
            TStmt::ExitBlock(label) => {
                let exit = self
                    .labels
                    .iter()
                    .rev()
                    .find(|(l, _)| l == label)
                    .map(|(_, b)| *b)
                    .ok_or_else(|| JitError::Internal(format!("unknown block label {}", label.0)))?;
                self.builder.ins().jump(exit, &[]);
                self.fresh_block();
            }
            TStmt::Vector(v) => self.vector_loop(v)?,
            TStmt::Parallel(p) => self.parallel_loop(p)?,
        }
        Ok(())
    }

    fn for_loop(&mut self, l: &ForLoop) -> JitResult<()> {
        let start = self.expr(&l.start)?;
        let stop = self.expr(&l.stop)?;
        let step = self.expr(&l.step)?;
        let step_const = match l.step.as_const() {
            Some(Const::Int(c)) => Some(c),
            _ => None,
        };
        if l.bound == LoopBound::Range && step_const.map_or(true, |c| c == 0) {
            let zero_step = self.builder.ins().icmp_imm(IntCC::Equal, step, 0);
            self.deopt_if(zero_step);
        }

        let counter = if l.exit_value {
            self.scalar_var(l.var)?
        } else {
            self.new_var(types::I64)
        };
        self.builder.def_var(counter, start);

        let header = self.builder.create_block();
        let body_block = self.builder.create_block();
        let latch = self.builder.create_block();
        let exit = self.builder.create_block();
        self.builder.ins().jump(header, &[]);

        self.builder.switch_to_block(header);
        let i = self.builder.use_var(counter);
        let cond = match (l.bound, step_const) {
            (LoopBound::Range, Some(c)) if c > 0 => self.builder.ins().icmp(IntCC::SignedLessThan, i, stop),
            (LoopBound::Range, Some(_)) => self.builder.ins().icmp(IntCC::SignedGreaterThan, i, stop),
            (LoopBound::Range, None) => {
                let up = self.builder.ins().icmp(IntCC::SignedLessThan, i, stop);
                let down = self.builder.ins().icmp(IntCC::SignedGreaterThan, i, stop);
                let ascending = self.builder.ins().icmp_imm(IntCC::SignedGreaterThan, step, 0);
                self.builder.ins().select(ascending, up, down)
            }
            (LoopBound::Lt, _) => self.builder.ins().icmp(IntCC::SignedLessThan, i, stop),
            (LoopBound::Le, _) => self.builder.ins().icmp(IntCC::SignedLessThanOrEqual, i, stop),
            (LoopBound::Gt, _) => self.builder.ins().icmp(IntCC::SignedGreaterThan, i, stop),
            (LoopBound::Ge, _) => self.builder.ins().icmp(IntCC::SignedGreaterThanOrEqual, i, stop),
        };
        self.builder.ins().brif(cond, body_block, &[], exit, &[]);

        self.builder.switch_to_block(body_block);
        if !l.exit_value {
            let var = self.scalar_var(l.var)?;
            let i = self.builder.use_var(counter);
            self.builder.def_var(var, i);
        }
        self.loops.push(LoopTargets { latch, exit });
        self.block(&l.body)?;
        self.loops.pop();
        self.builder.ins().jump(latch, &[]);

        self.builder.switch_to_block(latch);
        let i = self.builder.use_var(counter);
        let next = self.builder.ins().iadd(i, step);
        let overflow = self.add_overflows(i, step, next);
        if l.exit_value {
            // `i += step` itself raises
            self.deopt_if(overflow);
        } else {
            // A range never produces a value past the end of the integers
            let cont = self.builder.create_block();
            self.builder.ins().brif(overflow, exit, &[], cont, &[]);
            self.builder.switch_to_block(cont);
        }
        self.builder.def_var(counter, next);
        self.builder.ins().jump(header, &[]);
        self.builder.switch_to_block(exit);
        Ok(())
    }

    fn vector_loop(&mut self, v: &VectorLoop) -> JitResult<()> {
        let start = self.expr(&v.start)?;
        let stop = self.expr(&v.stop)?;
        let width = v.form.width();
        let counter = self.new_var(types::I64);
        self.builder.def_var(counter, start);

        // Per-reduction partial accumulators, initialized to the identity
        let mut lanes: Vec<Vec<Variable>> = Vec::with_capacity(v.reductions.len());
        for r in &v.reductions {
            let identity = self.constant(r.op.identity(r.ty));
            let vars = match v.form {
                VectorForm::Packed => {
                    let var = self.new_var(F64X2);
                    let splat = self.builder.ins().splat(F64X2, identity);
                    self.builder.def_var(var, splat);
                    vec![var]
                }
                VectorForm::Lanes(n) => (1..n)
                    .map(|_| {
                        let var = self.new_var(clif_type(r.ty));
                        self.builder.def_var(var, identity);
                        var
                    })
                    .collect(),
            };
            lanes.push(vars);
        }

        // Split integer sums: (acc, value on entry, magnitude) checked once the lanes are folded
        let mut bounded = Vec::new();
        if matches!(v.form, VectorForm::Lanes(_)) {
            for r in v.reductions.iter().filter(|r| needs_magnitude(r)) {
                if self.magnitudes.contains_key(&r.acc) {
                    continue;
                }
                let acc_var = self.scalar_var(r.acc)?;
                let on_entry = self.builder.use_var(acc_var);
                let magnitude = self.new_var(types::I64);
                self.magnitudes.insert(r.acc, magnitude);
                bounded.push((r.acc, on_entry, magnitude));
            }
        }

        let vec_header = self.builder.create_block();
        let vec_body = self.builder.create_block();
        let vec_done = self.builder.create_block();
        let scalar_header = self.builder.create_block();
        let scalar_body = self.builder.create_block();
        let scalar_latch = self.builder.create_block();
        let exit = self.builder.create_block();

        let non_negative = self.builder.ins().icmp_imm(IntCC::SignedGreaterThanOrEqual, start, 0);
        self.builder.ins().brif(non_negative, vec_header, &[], scalar_header, &[]);

        self.builder.switch_to_block(vec_header);
        let i = self.builder.use_var(counter);
        let below = self.builder.ins().icmp(IntCC::SignedLessThan, i, stop);
        let remaining = self.builder.ins().isub(stop, i);
        let room = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThanOrEqual, remaining, width as i64);
        let full = self.builder.ins().band(below, room);
        self.builder.ins().brif(full, vec_body, &[], vec_done, &[]);

        self.builder.switch_to_block(vec_body);
        let i = self.builder.use_var(counter);
        match v.form {
            VectorForm::Packed => self.packed_body(v, i, &lanes)?,
            VectorForm::Lanes(n) => {
                let var = self.scalar_var(v.var)?;
                for k in 0..n {
                    let lane_i = self.builder.ins().iadd_imm(i, k as i64);
                    self.builder.def_var(var, lane_i);
                    if k > 0 {
                        for (r, vars) in v.reductions.iter().zip(&lanes) {
                            self.overrides.insert(r.acc, vars[k - 1]);
                        }
                    }
                    let next_lane = self.builder.create_block();
                    self.loops.push(LoopTargets {
                        latch: next_lane,
                        exit,
                    });
                    self.block(&v.body)?;
                    self.loops.pop();
                    self.overrides.clear();
                    self.builder.ins().jump(next_lane, &[]);
                    self.builder.switch_to_block(next_lane);
                }
            }
        }
        let next = self.builder.ins().iadd_imm(i, width as i64);
        self.builder.def_var(counter, next);
        self.builder.ins().jump(vec_header, &[]);

        self.builder.switch_to_block(vec_done);
        for (acc, on_entry, magnitude) in bounded {
            self.deopt_unless_bounded(on_entry, magnitude);
            self.magnitudes.remove(&acc);
        }
        for (r, vars) in v.reductions.iter().zip(&lanes) {
            let acc_var = self.scalar_var(r.acc)?;
            let mut acc = self.builder.use_var(acc_var);
            for var in vars {
                let partial = self.builder.use_var(*var);
                if v.form == VectorForm::Packed {
                    for lane in 0..2u8 {
                        let part = self.builder.ins().extractlane(partial, lane);
                        acc = self.fold_partial(r, acc, part);
                    }
                } else {
                    acc = self.fold_partial(r, acc, partial);
                }
            }
            self.builder.def_var(acc_var, acc);
        }
        self.builder.ins().jump(scalar_header, &[]);

        self.builder.switch_to_block(scalar_header);
        let i = self.builder.use_var(counter);
        let more = self.builder.ins().icmp(IntCC::SignedLessThan, i, stop);
        self.builder.ins().brif(more, scalar_body, &[], exit, &[]);

        self.builder.switch_to_block(scalar_body);
        let var = self.scalar_var(v.var)?;
        self.builder.def_var(var, i);
        self.loops.push(LoopTargets {
            latch: scalar_latch,
            exit,
        });
        self.block(&v.body)?;
        self.loops.pop();
        self.builder.ins().jump(scalar_latch, &[]);

        self.builder.switch_to_block(scalar_latch);
        let i = self.builder.use_var(counter);
        let next = self.builder.ins().iadd_imm(i, 1);
        self.builder.def_var(counter, next);
        self.builder.ins().jump(scalar_header, &[]);

        self.builder.switch_to_block(exit);
        Ok(())
    }

    /// One two-lane step of a packed loop at index `i`
    fn packed_body(&mut self, v: &VectorLoop, i: Value, accs: &[Vec<Variable>]) -> JitResult<()> {
        let flags = vector_flags();
        for stmt in &v.body {
            match stmt {
                TStmt::Store { array, value, .. } => {
                    let packed = self.packed_expr(value, i)?;
                    let addr = self.packed_addr(*array, i)?;
                    self.builder.ins().store(flags, packed, addr, 0);
                }
                TStmt::Assign(acc, value) => {
                    let slot = v
                        .reductions
                        .iter()
                        .position(|r| r.acc == *acc)
                        .ok_or_else(|| JitError::Internal("packed assignment is not a reduction".into()))?;
                    let TExprKind::Binary(op, a, b) = &value.kind else {
                        return Err(JitError::Internal("packed reduction is not binary".into()));
                    };
                    let operand = if a.as_local() == Some(*acc) { b } else { a };
                    let e = self.packed_expr(operand, i)?;
                    let var = accs[slot][0];
                    let current = self.builder.use_var(var);
                    let updated = match op {
                        ArithOp::Add => self.builder.ins().fadd(current, e),
                        ArithOp::Sub => self.builder.ins().fsub(current, e),
                        ArithOp::Mul => self.builder.ins().fmul(current, e),
                        other => return Err(JitError::Unsupported(format!("packed '{}'", other.symbol()))),
                    };
                    self.builder.def_var(var, updated);
                }
                _ => return Err(JitError::Internal("statement cannot be packed".into())),
            }
        }
        Ok(())
    }

    fn packed_expr(&mut self, e: &TExpr, i: Value) -> JitResult<Value> {
        Ok(match &e.kind {
            TExprKind::Const(c) => {
                let scalar = self.constant(*c);
                self.builder.ins().splat(F64X2, scalar)
            }
            TExprKind::Local(id) => {
                let var = self.scalar_var(*id)?;
                let scalar = self.builder.use_var(var);
                self.builder.ins().splat(F64X2, scalar)
            }
            TExprKind::Index(array, _) => {
                let addr = self.packed_addr(*array, i)?;
                self.builder.ins().load(F64X2, vector_flags(), addr, 0)
            }
            TExprKind::Binary(op, a, b) => {
                let x = self.packed_expr(a, i)?;
                let y = self.packed_expr(b, i)?;
                match op {
                    ArithOp::Add => self.builder.ins().fadd(x, y),
                    ArithOp::Sub => self.builder.ins().fsub(x, y),
                    ArithOp::Mul => self.builder.ins().fmul(x, y),
                    other => return Err(JitError::Unsupported(format!("packed '{}'", other.symbol()))),
                }
            }
            TExprKind::Unary(UnOp::Neg, a) => {
                let x = self.packed_expr(a, i)?;
                self.builder.ins().fneg(x)
            }
            _ => return Err(JitError::Internal("expression cannot be packed".into())),
        })
    }

    /// Address of elements `i` and `i + 1`; `i` is known to be non-negative
    fn packed_addr(&mut self, array: LocalId, i: Value) -> JitResult<Value> {
        let (ptr, len) = self.array(array)?;
        let last = self.builder.ins().iadd_imm(i, 1);
        let outside = self.builder.ins().icmp(IntCC::SignedGreaterThanOrEqual, last, len);
        self.deopt_if(outside);
        let offset = self.builder.ins().ishl_imm(i, 3);
        Ok(self.builder.ins().iadd(ptr, offset))
    }

    fn parallel_loop(&mut self, p: &ParallelLoop) -> JitResult<()> {
        let kernel = *self
            .symbols
            .kernels
            .get(&(p as *const ParallelLoop))
            .ok_or_else(|| JitError::Internal("parallel loop without a kernel".into()))?;
        let start = self.expr(&p.start)?;
        let stop = self.expr(&p.stop)?;

        let parallel = self.builder.create_block();
        let inline = self.builder.create_block();
        let done = self.builder.create_block();
        let non_negative = self.builder.ins().icmp_imm(IntCC::SignedGreaterThanOrEqual, start, 0);
        self.builder.ins().brif(non_negative, parallel, &[], inline, &[]);

        self.builder.switch_to_block(inline);
        let lo = self.scalar_var(p.chunk_lo)?;
        let hi = self.scalar_var(p.chunk_hi)?;
        self.builder.def_var(lo, start);
        self.builder.def_var(hi, stop);
        self.stmt(&p.chunk)?;
        self.builder.ins().jump(done, &[]);

        self.builder.switch_to_block(parallel);
        let env = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            (p.captures.len().max(1) * 8) as u32,
            3,
        ));
        for (k, id) in p.captures.iter().enumerate() {
            let var = self.scalar_var(*id)?;
            let ty = self.scalar_type(*id)?;
            let value = self.builder.use_var(var);
            let bits = self.to_bits(value, ty);
            self.builder.ins().stack_store(bits, env, (k * 8) as i32);
        }
        let table = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            p.arrays.len().max(1) as u32 * RawArray::SIZE as u32,
            3,
        ));
        for (k, id) in p.arrays.iter().enumerate() {
            let (ptr, len) = self.array(*id)?;
            let base = k as i32 * RawArray::SIZE;
            self.builder.ins().stack_store(ptr, table, base + RawArray::PTR);
            self.builder.ins().stack_store(len, table, base + RawArray::LEN);
        }
        let env_addr = self.builder.ins().stack_addr(WORD, env, 0);
        let table_addr = self.builder.ins().stack_addr(WORD, table, 0);
        let kernel_ref = self.func_ref(kernel);
        let kernel_addr = self.builder.ins().func_addr(WORD, kernel_ref);
        let code = self
            .builder
            .ins()
            .iconst(types::I32, i64::from(reduction_code(p.reduction.as_ref())));
        let acc_in = match p.reduction {
            Some(r) => {
                let var = self.scalar_var(r.acc)?;
                let value = self.builder.use_var(var);
                self.to_bits(value, r.ty)
            }
            None => self.builder.ins().iconst(WORD, 0),
        };
        let helper = self.symbols.helpers.parallel_for;
        let ctx = self.ctx;
        let result = self.call_helper(
            helper,
            &[ctx, kernel_addr, env_addr, table_addr, start, stop, code, acc_in],
        );
        self.check_status();
        if let Some(r) = p.reduction {
            let var = self.scalar_var(r.acc)?;
            let value = self.from_bits(result, r.ty);
            self.builder.def_var(var, value);
        }
        // The loop variable keeps its last value
        let var = self.scalar_var(p.var)?;
        let ran = self.builder.ins().icmp(IntCC::SignedLessThan, start, stop);
        let last = self.builder.ins().iadd_imm(stop, -1);
        let old = self.builder.use_var(var);
        let value = self.builder.ins().select(ran, last, old);
        self.builder.def_var(var, value);
        self.builder.ins().jump(done, &[]);

        self.builder.switch_to_block(done);
        Ok(())
    }

    /// `acc ⊕ part` for a split reduction
    fn fold_partial(&mut self, r: &Reduction, acc: Value, part: Value) -> Value {
        match (r.op, r.ty) {
            (ReductionOp::Add | ReductionOp::Sub, NumType::Float) => self.builder.ins().fadd(acc, part),
            (ReductionOp::Mul, NumType::Float) => self.builder.ins().fmul(acc, part),
            (ReductionOp::Add | ReductionOp::Sub, _) => self.checked_add(acc, part),
            (ReductionOp::Mul, _) => self.checked_mul(acc, part),
            (ReductionOp::Min, NumType::Float) => {
                let less = self.builder.ins().fcmp(FloatCC::LessThan, part, acc);
                self.builder.ins().select(less, part, acc)
            }
            (ReductionOp::Max, NumType::Float) => {
                let greater = self.builder.ins().fcmp(FloatCC::GreaterThan, part, acc);
                self.builder.ins().select(greater, part, acc)
            }
            (ReductionOp::Min, _) => {
                let less = self.builder.ins().icmp(IntCC::SignedLessThan, part, acc);
                self.builder.ins().select(less, part, acc)
            }
            (ReductionOp::Max, _) => {
                let greater = self.builder.ins().icmp(IntCC::SignedGreaterThan, part, acc);
                self.builder.ins().select(greater, part, acc)
            }
        }
    }

    // Expressions

    fn constant(&mut self, c: Const) -> Value {
        match c {
            Const::Int(i) => self.builder.ins().iconst(types::I64, i),
            Const::Float(f) => self.builder.ins().f64const(f),
            Const::Bool(b) => self.builder.ins().iconst(types::I8, i64::from(b)),
        }
    }

    fn expr(&mut self, e: &TExpr) -> JitResult<Value> {
        match &e.kind {
            TExprKind::Const(c) => Ok(self.constant(*c)),
            TExprKind::Local(id) => {
                let var = self.scalar_var(*id)?;
                Ok(self.builder.use_var(var))
            }
            TExprKind::Unary(op, a) => {
                let x = self.expr(a)?;
                self.unary(*op, a.ty, x)
            }
            TExprKind::Binary(op, a, b) => {
                let x = self.expr(a)?;
                let y = self.expr(b)?;
                match e.ty {
                    NumType::Int => self.int_binary(*op, x, y),
                    NumType::Float => self.float_binary(*op, x, y),
                    NumType::Bool => Err(JitError::Unsupported(format!("'{}' on bool", op.symbol()))),
                }
            }
            TExprKind::Compare(kind, a, b) => {
                let x = self.expr(a)?;
                let y = self.expr(b)?;
                Ok(self.compare(*kind, a.ty, x, y))
            }
            TExprKind::Logic(op, a, b) => {
                let left = self.expr(a)?;
                let truth = self.truthy(left, a.ty);
                let rhs = self.builder.create_block();
                let done = self.builder.create_block();
                let result = self.builder.append_block_param(done, clif_type(e.ty));
                match op {
                    LogicOp::And => self.builder.ins().brif(truth, rhs, &[], done, &[left]),
                    LogicOp::Or => self.builder.ins().brif(truth, done, &[left], rhs, &[]),
                };
                self.builder.switch_to_block(rhs);
                let right = self.expr(b)?;
                self.builder.ins().jump(done, &[right]);
                self.builder.switch_to_block(done);
                Ok(result)
            }
            TExprKind::Select { cond, then, otherwise } => {
                let c = self.expr(cond)?;
                let then_block = self.builder.create_block();
                let else_block = self.builder.create_block();
                let done = self.builder.create_block();
                let result = self.builder.append_block_param(done, clif_type(e.ty));
                self.builder.ins().brif(c, then_block, &[], else_block, &[]);
                self.builder.switch_to_block(then_block);
                let t = self.expr(then)?;
                self.builder.ins().jump(done, &[t]);
                self.builder.switch_to_block(else_block);
                let o = self.expr(otherwise)?;
                self.builder.ins().jump(done, &[o]);
                self.builder.switch_to_block(done);
                Ok(result)
            }
            TExprKind::Cast(op, a) => {
                let x = self.expr(a)?;
                Ok(self.cast(*op, a.ty, x))
            }
            TExprKind::Index(array, index) => {
                let i = self.expr(index)?;
                let addr = self.element_addr(*array, i)?;
                Ok(self.builder.ins().load(clif_type(e.ty), MemFlags::trusted(), addr, 0))
            }
            TExprKind::Len(array) => Ok(self.array(*array)?.1),
            TExprKind::Call(index, args) => self.call(*index, args),
            TExprKind::Builtin(op, args) => self.builtin(*op, e.ty, args),
        }
    }

    fn call(&mut self, index: FuncIndex, args: &[TArg]) -> JitResult<Value> {
        let id = *self.symbols.functions.get(&index).ok_or_else(|| {
            JitError::Internal(format!("'{}' was not declared", self.body.function(index).name))
        })?;
        let mut values = Vec::with_capacity(args.len() + 1);
        for arg in args {
            match arg {
                TArg::Scalar(e) => values.push(self.expr(e)?),
                TArg::Array(array) => {
                    let (ptr, len) = self.array(*array)?;
                    values.push(ptr);
                    values.push(len);
                }
            }
        }
        values.push(self.ctx);
        let result = self.call_helper(id, &values);
        self.check_status();
        Ok(result)
    }

    /// Address of element `index` of `array`, with negative indices counted from the end
    fn element_addr(&mut self, array: LocalId, index: Value) -> JitResult<Value> {
        let (ptr, len) = self.array(array)?;
        let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, index, 0);
        let wrapped = self.builder.ins().iadd(index, len);
        let position = self.builder.ins().select(negative, wrapped, index);
        let outside = self.builder.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, position, len);
        self.deopt_if(outside);
        let offset = self.builder.ins().ishl_imm(position, 3);
        Ok(self.builder.ins().iadd(ptr, offset))
    }

    fn unary(&mut self, op: UnOp, ty: NumType, x: Value) -> JitResult<Value> {
        Ok(match (op, ty) {
            (UnOp::Neg, NumType::Int) => {
                let min = self.builder.ins().icmp_imm(IntCC::Equal, x, i64::MIN);
                self.deopt_if(min);
                self.builder.ins().ineg(x)
            }
            (UnOp::Neg, NumType::Float) => self.builder.ins().fneg(x),
            (UnOp::Invert, NumType::Int) => self.builder.ins().bnot(x),
            (UnOp::Not, _) => {
                let truth = self.truthy(x, ty);
                self.builder.ins().bxor_imm(truth, 1)
            }
            _ => return Err(JitError::Unsupported(format!("unary {op:?} on {ty:?}"))),
        })
    }

    fn add_overflows(&mut self, x: Value, y: Value, sum: Value) -> Value {
        let a = self.builder.ins().bxor(x, sum);
        let b = self.builder.ins().bxor(y, sum);
        let both = self.builder.ins().band(a, b);
        self.builder.ins().icmp_imm(IntCC::SignedLessThan, both, 0)
    }

    fn checked_add(&mut self, x: Value, y: Value) -> Value {
        let sum = self.builder.ins().iadd(x, y);
        let overflow = self.add_overflows(x, y, sum);
        self.deopt_if(overflow);
        sum
    }

    /// Add `|after - before|` to `magnitude`; the update was checked, so the difference is exact
    fn add_magnitude(&mut self, magnitude: Variable, before: Value, after: Value) {
        let delta = self.builder.ins().isub(after, before);
        let step = self.unsigned_abs(delta);
        let total = self.builder.use_var(magnitude);
        let sum = self.builder.ins().iadd(total, step);
        let wrapped = self.builder.ins().icmp(IntCC::UnsignedLessThan, sum, total);
        self.deopt_if(wrapped);
        self.builder.def_var(magnitude, sum);
    }

    /// Deopt unless `|start| + magnitude <= i64::MAX`, which bounds every sequential prefix
    fn deopt_unless_bounded(&mut self, start: Value, magnitude: Variable) {
        let base = self.unsigned_abs(start);
        let total = self.builder.use_var(magnitude);
        let bound = self.builder.ins().iadd(base, total);
        let wrapped = self.builder.ins().icmp(IntCC::UnsignedLessThan, bound, base);
        let past_max = self.builder.ins().icmp_imm(IntCC::SignedLessThan, bound, 0);
        let failed = self.builder.ins().bor(wrapped, past_max);
        self.deopt_if(failed);
    }

    /// `|x|` as an unsigned 64-bit value (`i64::MIN` maps to 2^63)
    fn unsigned_abs(&mut self, x: Value) -> Value {
        let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, x, 0);
        let flipped = self.builder.ins().ineg(x);
        self.builder.ins().select(negative, flipped, x)
    }

    fn checked_mul(&mut self, x: Value, y: Value) -> Value {
        let low = self.builder.ins().imul(x, y);
        let high = self.builder.ins().smulhi(x, y);
        let sign = self.builder.ins().sshr_imm(low, 63);
        let overflow = self.builder.ins().icmp(IntCC::NotEqual, high, sign);
        self.deopt_if(overflow);
        low
    }

    fn int_binary(&mut self, op: ArithOp, x: Value, y: Value) -> JitResult<Value> {
        Ok(match op {
            ArithOp::Add => self.checked_add(x, y),
            ArithOp::Sub => {
                let diff = self.builder.ins().isub(x, y);
                let a = self.builder.ins().bxor(x, y);
                let b = self.builder.ins().bxor(x, diff);
                let both = self.builder.ins().band(a, b);
                let overflow = self.builder.ins().icmp_imm(IntCC::SignedLessThan, both, 0);
                self.deopt_if(overflow);
                diff
            }
            ArithOp::Mul => self.checked_mul(x, y),
            ArithOp::FloorDiv => self.int_divmod(x, y, true),
            ArithOp::Mod => self.int_divmod(x, y, false),
            ArithOp::Pow => {
                let ctx = self.ctx;
                let helper = self.symbols.helpers.int_pow;
                let result = self.call_helper(helper, &[ctx, x, y]);
                self.check_status();
                result
            }
            ArithOp::BitAnd => self.builder.ins().band(x, y),
            ArithOp::BitOr => self.builder.ins().bor(x, y),
            ArithOp::BitXor => self.builder.ins().bxor(x, y),
            ArithOp::Shl => {
                let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, y, 0);
                self.deopt_if(negative);
                let count = self.clamp_shift(y);
                let shifted = self.builder.ins().ishl(x, count);
                let back = self.builder.ins().sshr(shifted, count);
                let exact = self.builder.ins().icmp(IntCC::Equal, back, x);
                let in_range = self.builder.ins().icmp_imm(IntCC::SignedLessThanOrEqual, y, 63);
                let fits = self.builder.ins().band(exact, in_range);
                let zero = self.builder.ins().icmp_imm(IntCC::Equal, x, 0);
                let ok = self.builder.ins().bor(fits, zero);
                let overflow = self.builder.ins().icmp_imm(IntCC::Equal, ok, 0);
                self.deopt_if(overflow);
                shifted
            }
            ArithOp::Shr => {
                let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, y, 0);
                self.deopt_if(negative);
                let count = self.clamp_shift(y);
                self.builder.ins().sshr(x, count)
            }
            ArithOp::Div => return Err(JitError::Internal("true division of integers".into())),
        })
    }

    fn clamp_shift(&mut self, count: Value) -> Value {
        let big = self.builder.ins().icmp_imm(IntCC::SignedGreaterThan, count, 63);
        let max = self.builder.ins().iconst(types::I64, 63);
        self.builder.ins().select(big, max, count)
    }

    /// Floor division or modulo, rounding toward negative infinity
    fn int_divmod(&mut self, x: Value, y: Value, quotient: bool) -> Value {
        let zero = self.builder.ins().icmp_imm(IntCC::Equal, y, 0);
        self.deopt_if(zero);
        let minus_one = self.builder.ins().icmp_imm(IntCC::Equal, y, -1);
        let one = self.builder.ins().iconst(types::I64, 1);
        let divisor = self.builder.ins().select(minus_one, one, y);
        let rem = self.builder.ins().srem(x, divisor);
        let inexact = self.builder.ins().icmp_imm(IntCC::NotEqual, rem, 0);
        let signs = self.builder.ins().bxor(rem, y);
        let opposite = self.builder.ins().icmp_imm(IntCC::SignedLessThan, signs, 0);
        let adjust = self.builder.ins().band(inexact, opposite);
        if quotient {
            let min = self.builder.ins().icmp_imm(IntCC::Equal, x, i64::MIN);
            let overflow = self.builder.ins().band(minus_one, min);
            self.deopt_if(overflow);
            let q = self.builder.ins().sdiv(x, divisor);
            let lowered = self.builder.ins().iadd_imm(q, -1);
            let q = self.builder.ins().select(adjust, lowered, q);
            let negated = self.builder.ins().ineg(x);
            self.builder.ins().select(minus_one, negated, q)
        } else {
            let shifted = self.builder.ins().iadd(rem, y);
            self.builder.ins().select(adjust, shifted, rem)
        }
    }

    fn float_binary(&mut self, op: ArithOp, x: Value, y: Value) -> JitResult<Value> {
        let ctx = self.ctx;
        let helpers = self.symbols.helpers;
        Ok(match op {
            ArithOp::Add => self.builder.ins().fadd(x, y),
            ArithOp::Sub => self.builder.ins().fsub(x, y),
            ArithOp::Mul => self.builder.ins().fmul(x, y),
            ArithOp::Div => {
                self.deopt_if_float_zero(y);
                self.builder.ins().fdiv(x, y)
            }
            ArithOp::FloorDiv => {
                self.deopt_if_float_zero(y);
                self.call_helper(helpers.float_floordiv, &[x, y])
            }
            ArithOp::Mod => {
                self.deopt_if_float_zero(y);
                self.call_helper(helpers.float_mod, &[x, y])
            }
            ArithOp::Pow => {
                let result = self.call_helper(helpers.float_pow, &[ctx, x, y]);
                self.check_status();
                result
            }
            other => return Err(JitError::Unsupported(format!("'{}' on float", other.symbol()))),
        })
    }

    fn deopt_if_float_zero(&mut self, y: Value) {
        let zero = self.builder.ins().f64const(0.0);
        let is_zero = self.builder.ins().fcmp(FloatCC::Equal, y, zero);
        self.deopt_if(is_zero);
    }

    fn compare(&mut self, kind: CmpKind, ty: NumType, x: Value, y: Value) -> Value {
        if ty == NumType::Float {
            let cc = match kind {
                CmpKind::Eq => FloatCC::Equal,
                CmpKind::Ne => FloatCC::NotEqual,
                CmpKind::Lt => FloatCC::LessThan,
                CmpKind::Le => FloatCC::LessThanOrEqual,
                CmpKind::Gt => FloatCC::GreaterThan,
                CmpKind::Ge => FloatCC::GreaterThanOrEqual,
            };
            self.builder.ins().fcmp(cc, x, y)
        } else {
            let cc = match kind {
                CmpKind::Eq => IntCC::Equal,
                CmpKind::Ne => IntCC::NotEqual,
                CmpKind::Lt => IntCC::SignedLessThan,
                CmpKind::Le => IntCC::SignedLessThanOrEqual,
                CmpKind::Gt => IntCC::SignedGreaterThan,
                CmpKind::Ge => IntCC::SignedGreaterThanOrEqual,
            };
            self.builder.ins().icmp(cc, x, y)
        }
    }

    fn truthy(&mut self, x: Value, ty: NumType) -> Value {
        match ty {
            NumType::Bool => x,
            NumType::Int => self.builder.ins().icmp_imm(IntCC::NotEqual, x, 0),
            NumType::Float => {
                let zero = self.builder.ins().f64const(0.0);
                self.builder.ins().fcmp(FloatCC::NotEqual, x, zero)
            }
        }
    }

    fn cast(&mut self, op: CastOp, from: NumType, x: Value) -> Value {
        match op {
            CastOp::IntToFloat => self.builder.ins().fcvt_from_sint(types::F64, x),
            CastOp::IntToFloatExact => {
                let biased = self.builder.ins().iadd_imm(x, EXACT_FLOAT_INT);
                let inexact = self
                    .builder
                    .ins()
                    .icmp_imm(IntCC::UnsignedGreaterThan, biased, 2 * EXACT_FLOAT_INT);
                self.deopt_if(inexact);
                self.builder.ins().fcvt_from_sint(types::F64, x)
            }
            CastOp::FloatToInt => {
                let nan = self.builder.ins().fcmp(FloatCC::Unordered, x, x);
                self.deopt_if(nan);
                let t = self.builder.ins().trunc(x);
                let limit = self.builder.ins().f64const(9.223_372_036_854_775_808e18);
                let too_big = self.builder.ins().fcmp(FloatCC::GreaterThanOrEqual, t, limit);
                self.deopt_if(too_big);
                let floor = self.builder.ins().f64const(-9.223_372_036_854_775_808e18);
                let too_small = self.builder.ins().fcmp(FloatCC::LessThan, t, floor);
                self.deopt_if(too_small);
                self.builder.ins().fcvt_to_sint(types::I64, t)
            }
            CastOp::BoolToInt => self.builder.ins().uextend(types::I64, x),
            CastOp::BoolToFloat => {
                let wide = self.builder.ins().uextend(types::I64, x);
                self.builder.ins().fcvt_from_sint(types::F64, wide)
            }
            CastOp::ToBool => self.truthy(x, from),
        }
    }

    fn builtin(&mut self, op: BuiltinOp, ty: NumType, args: &[TExpr]) -> JitResult<Value> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.expr(arg)?);
        }
        let (&first, rest) = values
            .split_first()
            .ok_or_else(|| JitError::Internal("builtin without arguments".into()))?;
        Ok(match (op, ty) {
            (BuiltinOp::Abs, NumType::Float) => self.builder.ins().fabs(first),
            (BuiltinOp::Abs, NumType::Int) => {
                let min = self.builder.ins().icmp_imm(IntCC::Equal, first, i64::MIN);
                self.deopt_if(min);
                let negated = self.builder.ins().ineg(first);
                let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, first, 0);
                self.builder.ins().select(negative, negated, first)
            }
            (BuiltinOp::Min | BuiltinOp::Max, _) => {
                // First extreme value wins, as the host does
                let mut best = first;
                for &x in rest {
                    let better = match (op, ty) {
                        (BuiltinOp::Min, NumType::Float) => self.builder.ins().fcmp(FloatCC::LessThan, x, best),
                        (_, NumType::Float) => self.builder.ins().fcmp(FloatCC::GreaterThan, x, best),
                        (BuiltinOp::Min, _) => self.builder.ins().icmp(IntCC::SignedLessThan, x, best),
                        _ => self.builder.ins().icmp(IntCC::SignedGreaterThan, x, best),
                    };
                    best = self.builder.ins().select(better, x, best);
                }
                best
            }
            (BuiltinOp::Abs, NumType::Bool) => return Err(JitError::Unsupported("abs of bool".into())),
        })
    }

    // Bit patterns shared with the runtime

    fn to_bits(&mut self, x: Value, ty: NumType) -> Value {
        match ty {
            NumType::Int => x,
            NumType::Float => self.builder.ins().bitcast(WORD, MemFlags::new(), x),
            NumType::Bool => self.builder.ins().uextend(WORD, x),
        }
    }

    fn from_bits(&mut self, bits: Value, ty: NumType) -> Value {
        match ty {
            NumType::Int => bits,
            NumType::Float => self.builder.ins().bitcast(types::F64, MemFlags::new(), bits),
            NumType::Bool => self.builder.ins().ireduce(types::I8, bits),
        }
    }
}

/// Packed loads and stores are unaligned
fn vector_flags() -> MemFlags {
    let mut flags = MemFlags::new();
    flags.set_notrap();
    flags
}
