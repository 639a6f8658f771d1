//! Runtime support for compiled code
//!
//! Compiled functions receive a pointer to an [`ExecCtx`] as their last argument. Any
//! situation host semantics would turn into an exception (overflow, zero division, an
//! out-of-range index, a recursion limit) sets [`ExecCtx::status`] and unwinds to the
//! trampoline, which reports a deoptimization to the dispatcher.
//!
//! The helpers in this module are registered as JIT symbols. They are `extern "C"` and
//! never panic.

use std::mem::offset_of;

use cranelift_jit::JITModule;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::analysis::typed::{NumType, Reduction, ReductionOp, ReturnKind, ValueKind};
use crate::numeric;

use super::{JitError, JitResult};

/// Status codes stored in [`ExecCtx::status`]
pub mod status {
    pub const OK: u32 = 0;
    /// Host semantics would raise; re-run the call in the interpreter
    pub const DEOPT: u32 = 1;
}

/// A borrowed array argument: `len` elements of 8 bytes each
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawArray {
    pub ptr: *mut u8,
    pub len: i64,
}

impl RawArray {
    pub const PTR: i32 = offset_of!(RawArray, ptr) as i32;
    pub const LEN: i32 = offset_of!(RawArray, len) as i32;
    pub const SIZE: i32 = std::mem::size_of::<RawArray>() as i32;
}

/// Per-call execution context shared with generated code
#[repr(C)]
#[derive(Debug)]
pub struct ExecCtx {
    pub status: u32,
    /// Current call depth, host frames included
    pub depth: u32,
    pub max_depth: u32,
    /// Pool for parallel loops; null runs chunks on the calling thread
    pub pool: *const ThreadPool,
    pub min_chunk: i64,
    pub target_chunks: i64,
    /// Sum of `|delta|` over a kernel's integer reduction updates
    pub magnitude: u64,
}

impl ExecCtx {
    pub const STATUS: i32 = offset_of!(ExecCtx, status) as i32;
    pub const DEPTH: i32 = offset_of!(ExecCtx, depth) as i32;
    pub const MAX_DEPTH: i32 = offset_of!(ExecCtx, max_depth) as i32;
    pub const MAGNITUDE: i32 = offset_of!(ExecCtx, magnitude) as i32;

    #[must_use]
    pub fn new(depth: u32, max_depth: u32, pool: Option<&ThreadPool>, min_chunk: usize, target_chunks: usize) -> Self {
        Self {
            status: status::OK,
            depth,
            max_depth,
            pool: pool.map_or(std::ptr::null(), |p| p as *const ThreadPool),
            min_chunk: min_chunk.max(1) as i64,
            target_chunks: target_chunks.max(1) as i64,
            magnitude: 0,
        }
    }

    #[must_use]
    pub const fn deoptimized(&self) -> bool {
        self.status != status::OK
    }

    fn deopt(&mut self) {
        self.status = status::DEOPT;
    }
}

/// Arguments for one compiled call, as raw 64-bit patterns
///
/// Scalars are stored in parameter order skipping arrays; arrays hold their elements'
/// bit patterns (`i64` or `f64`) and are written back by the caller after a successful
/// call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub scalars: Vec<u64>,
    pub arrays: Vec<Vec<u64>>,
}

type EntryFn = unsafe extern "C" fn(*const u64, *const RawArray, *mut ExecCtx) -> u64;
type KernelFn = unsafe extern "C" fn(*const u64, *const RawArray, i64, i64, *mut ExecCtx) -> u64;

/// A finalized native body: the root specialization, its compiled callees and kernels
pub struct CompiledCode {
    module: Option<JITModule>,
    entry: *const u8,
    arg_kinds: Vec<ValueKind>,
    ret: ReturnKind,
}

// SAFETY: the code memory is immutable once finalized and is freed only when the last
// reference is dropped.
unsafe impl Send for CompiledCode {}
unsafe impl Sync for CompiledCode {}

impl CompiledCode {
    pub(super) fn new(module: JITModule, entry: *const u8, arg_kinds: Vec<ValueKind>, ret: ReturnKind) -> Self {
        Self {
            module: Some(module),
            entry,
            arg_kinds,
            ret,
        }
    }

    #[must_use]
    pub fn arg_kinds(&self) -> &[ValueKind] {
        &self.arg_kinds
    }

    #[must_use]
    pub const fn ret(&self) -> ReturnKind {
        self.ret
    }

    /// Run the compiled body
    ///
    /// Returns the result bits; the caller must check [`ExecCtx::deoptimized`] before
    /// using them or writing arrays back.
    pub fn invoke(&self, frame: &mut Frame, ctx: &mut ExecCtx) -> JitResult<u64> {
        let scalars = self.arg_kinds.iter().filter(|k| !k.is_array()).count();
        let arrays = self.arg_kinds.len() - scalars;
        if frame.scalars.len() != scalars || frame.arrays.len() != arrays {
            return Err(JitError::Internal(format!(
                "frame has {} scalars and {} arrays, expected {scalars} and {arrays}",
                frame.scalars.len(),
                frame.arrays.len()
            )));
        }
        let raw: Vec<RawArray> = frame
            .arrays
            .iter_mut()
            .map(|a| RawArray {
                ptr: a.as_mut_ptr().cast(),
                len: a.len() as i64,
            })
            .collect();
        // SAFETY: `entry` is the trampoline generated for `arg_kinds`; the frame shape was
        // checked above and the array buffers outlive the call.
        unsafe {
            let f: EntryFn = std::mem::transmute(self.entry);
            Ok(f(frame.scalars.as_ptr(), raw.as_ptr(), ctx))
        }
    }
}

impl Drop for CompiledCode {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: no function pointer into this module survives the artifact.
            unsafe { module.free_memory() };
        }
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("arg_kinds", &self.arg_kinds)
            .field("ret", &self.ret)
            .finish_non_exhaustive()
    }
}

/// Encode a reduction for [`adr_parallel_for`]: the operator in the low bits, `FLOAT_BIT`
/// for float accumulators, 0 for none
#[must_use]
pub fn reduction_code(reduction: Option<&Reduction>) -> u32 {
    const FLOAT_BIT: u32 = 16;
    let Some(r) = reduction else {
        return 0;
    };
    let op = match r.op {
        ReductionOp::Add => 1,
        ReductionOp::Sub => 2,
        ReductionOp::Mul => 3,
        ReductionOp::Min => 4,
        ReductionOp::Max => 5,
    };
    if r.ty == NumType::Float {
        op | FLOAT_BIT
    } else {
        op
    }
}

/// Fold a chunk partial into the running accumulator; `None` on integer overflow
#[must_use]
pub fn combine_partial(code: u32, acc: u64, partial: u64) -> Option<u64> {
    let float = code & 16 != 0;
    match (code & 15, float) {
        (0, _) => Some(0),
        (1 | 2, false) => (acc as i64).checked_add(partial as i64).map(|v| v as u64),
        (3, false) => (acc as i64).checked_mul(partial as i64).map(|v| v as u64),
        (4, false) => Some((acc as i64).min(partial as i64) as u64),
        (5, false) => Some((acc as i64).max(partial as i64) as u64),
        (1 | 2, true) => Some((f64::from_bits(acc) + f64::from_bits(partial)).to_bits()),
        (3, true) => Some((f64::from_bits(acc) * f64::from_bits(partial)).to_bits()),
        (4, true) => Some(numeric::float_min(f64::from_bits(acc), f64::from_bits(partial)).to_bits()),
        (5, true) => Some(numeric::float_max(f64::from_bits(acc), f64::from_bits(partial)).to_bits()),
        _ => None,
    }
}

/// True when an integer sum starting at `acc` cannot leave the `i64` range after updates
/// whose absolute values add up to `magnitude`, whatever order they are applied in
#[must_use]
pub fn prefix_bounded(acc: i64, magnitude: u64) -> bool {
    acc.unsigned_abs()
        .checked_add(magnitude)
        .is_some_and(|bound| bound <= i64::MAX.unsigned_abs())
}

/// Split `[start, stop)` into contiguous chunks of at least `min_chunk` iterations
///
/// The split depends only on the bounds and the chunking settings, never on the pool size.
#[must_use]
pub fn chunk_bounds(start: i64, stop: i64, min_chunk: i64, target_chunks: i64) -> Vec<(i64, i64)> {
    if stop <= start {
        return Vec::new();
    }
    let trip = stop.abs_diff(start);
    let target = target_chunks.max(1).unsigned_abs();
    let size = trip.div_ceil(target).max(min_chunk.max(1).unsigned_abs());
    let mut chunks = Vec::with_capacity(trip.div_ceil(size) as usize);
    let mut lo = start;
    while lo < stop {
        let hi = lo.saturating_add_unsigned(size).min(stop);
        chunks.push((lo, hi));
        lo = hi;
    }
    chunks
}

#[derive(Debug, Clone, Copy)]
struct ChunkResult {
    status: u32,
    partial: u64,
    magnitude: u64,
}

struct Task {
    kernel: KernelFn,
    env: *const u64,
    arrays: *const RawArray,
    depth: u32,
    max_depth: u32,
}

// SAFETY: `env` and `arrays` point into the caller's frame, which outlives the parallel
// region; chunks write disjoint array elements.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    fn run(&self, lo: i64, hi: i64) -> ChunkResult {
        let mut ctx = ExecCtx::new(self.depth, self.max_depth, None, 1, 1);
        // SAFETY: the kernel was generated for this env/array layout.
        let partial = unsafe { (self.kernel)(self.env, self.arrays, lo, hi, &mut ctx) };
        ChunkResult {
            status: ctx.status,
            partial,
            magnitude: ctx.magnitude,
        }
    }
}

/// Run an outlined loop over `[start, stop)` on the worker pool
///
/// Partials are folded into `acc` in chunk order, so the result does not depend on
/// scheduling. A failing chunk or an overflowing fold marks the whole call deoptimized, and
/// so does an integer sum whose running total could have overflowed inside a chunk.
pub extern "C" fn adr_parallel_for(
    ctx: *mut ExecCtx,
    kernel: *const u8,
    env: *const u64,
    arrays: *const RawArray,
    start: i64,
    stop: i64,
    reduction: u32,
    acc: u64,
) -> u64 {
    // SAFETY: generated code always passes its own live context.
    let Some(ctx) = (unsafe { ctx.as_mut() }) else {
        return 0;
    };
    if kernel.is_null() {
        ctx.deopt();
        return 0;
    }
    let task = Task {
        // SAFETY: `kernel` is the address of a function compiled with the kernel signature.
        kernel: unsafe { std::mem::transmute::<*const u8, KernelFn>(kernel) },
        env,
        arrays,
        depth: ctx.depth,
        max_depth: ctx.max_depth,
    };
    let chunks = chunk_bounds(start, stop, ctx.min_chunk, ctx.target_chunks);
    // SAFETY: the dispatcher keeps the pool alive for the duration of the call.
    let pool = unsafe { ctx.pool.as_ref() };
    let results: Vec<ChunkResult> = match pool {
        Some(pool) if chunks.len() > 1 => pool.install(|| {
            chunks
                .par_iter()
                .map(|&(lo, hi)| task.run(lo, hi))
                .collect()
        }),
        _ => chunks.iter().map(|&(lo, hi)| task.run(lo, hi)).collect(),
    };

    let integer_sum = matches!(reduction, 1 | 2);
    let mut acc = acc;
    for chunk in results {
        if chunk.status != status::OK || (integer_sum && !prefix_bounded(acc as i64, chunk.magnitude)) {
            ctx.deopt();
            return 0;
        }
        match combine_partial(reduction, acc, chunk.partial) {
            Some(folded) => acc = folded,
            None => {
                ctx.deopt();
                return 0;
            }
        }
    }
    acc
}

/// `a % b` for a nonzero `b`
pub extern "C" fn adr_float_mod(a: f64, b: f64) -> f64 {
    numeric::float_mod_nonzero(a, b)
}

/// `a // b` for a nonzero `b`
pub extern "C" fn adr_float_floordiv(a: f64, b: f64) -> f64 {
    numeric::float_floordiv_nonzero(a, b)
}

pub extern "C" fn adr_float_pow(ctx: *mut ExecCtx, base: f64, exp: f64) -> f64 {
    numeric::float_pow(base, exp).unwrap_or_else(|_| {
        // SAFETY: generated code always passes its own live context.
        if let Some(ctx) = unsafe { ctx.as_mut() } {
            ctx.deopt();
        }
        0.0
    })
}

pub extern "C" fn adr_int_pow(ctx: *mut ExecCtx, base: i64, exp: i64) -> i64 {
    numeric::int_pow(base, exp).unwrap_or_else(|_| {
        // SAFETY: generated code always passes its own live context.
        if let Some(ctx) = unsafe { ctx.as_mut() } {
            ctx.deopt();
        }
        0
    })
}

/// Names and addresses registered with the JIT linker
pub(super) fn symbols() -> [(&'static str, *const u8); 5] {
    [
        ("adr_parallel_for", adr_parallel_for as *const u8),
        ("adr_float_mod", adr_float_mod as *const u8),
        ("adr_float_floordiv", adr_float_floordiv as *const u8),
        ("adr_float_pow", adr_float_pow as *const u8),
        ("adr_int_pow", adr_int_pow as *const u8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn sum_kernel(_env: *const u64, arrays: *const RawArray, lo: i64, hi: i64, _ctx: *mut ExecCtx) -> u64 {
        let array = unsafe { *arrays };
        let data = unsafe { std::slice::from_raw_parts(array.ptr.cast::<i64>(), array.len as usize) };
        data[lo as usize..hi as usize].iter().sum::<i64>() as u64
    }

    /// Sums its chunk and reports the magnitude of the updates the way generated kernels do
    extern "C" fn tracked_sum_kernel(_env: *const u64, arrays: *const RawArray, lo: i64, hi: i64, ctx: *mut ExecCtx) -> u64 {
        let array = unsafe { *arrays };
        let data = unsafe { std::slice::from_raw_parts(array.ptr.cast::<i64>(), array.len as usize) };
        let chunk = &data[lo as usize..hi as usize];
        unsafe { (*ctx).magnitude = chunk.iter().map(|x| x.unsigned_abs()).sum() };
        chunk.iter().fold(0_i64, |acc, x| acc.wrapping_add(*x)) as u64
    }

    extern "C" fn failing_kernel(_env: *const u64, _arrays: *const RawArray, lo: i64, _hi: i64, ctx: *mut ExecCtx) -> u64 {
        if lo > 0 {
            unsafe { (*ctx).status = status::DEOPT };
        }
        0
    }

    fn run(pool: Option<&ThreadPool>, kernel: KernelFn, data: &mut [i64], acc: i64) -> (u32, i64) {
        let mut ctx = ExecCtx::new(0, 100, pool, 4, 8);
        let raw = [RawArray {
            ptr: data.as_mut_ptr().cast(),
            len: data.len() as i64,
        }];
        let code = reduction_code(Some(&Reduction {
            acc: crate::analysis::typed::LocalId(0),
            op: ReductionOp::Add,
            ty: NumType::Int,
        }));
        let result = adr_parallel_for(
            &mut ctx,
            kernel as *const u8,
            std::ptr::null(),
            raw.as_ptr(),
            0,
            data.len() as i64,
            code,
            acc as u64,
        );
        (ctx.status, result as i64)
    }

    #[test]
    fn chunks_cover_the_range_in_order() {
        let chunks = chunk_bounds(3, 1000, 64, 8);
        assert_eq!(chunks.first().map(|c| c.0), Some(3));
        assert_eq!(chunks.last().map(|c| c.1), Some(1000));
        assert!(chunks.windows(2).all(|w| w[0].1 == w[1].0));
        assert!(chunks.iter().all(|(lo, hi)| hi - lo >= 64 || *hi == 1000));
        assert_eq!(chunks.len(), 8);
    }

    #[test]
    fn small_ranges_make_one_chunk() {
        assert_eq!(chunk_bounds(0, 10, 64, 64), vec![(0, 10)]);
        assert!(chunk_bounds(5, 5, 64, 64).is_empty());
        assert!(chunk_bounds(5, -1, 64, 64).is_empty());
    }

    #[test]
    fn partials_fold_with_overflow_checks() {
        let add = 1;
        assert_eq!(combine_partial(add, 2, 3), Some(5));
        assert_eq!(combine_partial(add, i64::MAX as u64, 1), None);
        let fmax = 5 | 16;
        let folded = combine_partial(fmax, 1.5f64.to_bits(), 2.5f64.to_bits()).unwrap();
        assert_eq!(f64::from_bits(folded), 2.5);
    }

    #[test]
    fn driver_result_is_independent_of_pool() {
        let mut data: Vec<i64> = (0..1000).collect();
        let sequential = run(None, sum_kernel, &mut data, 7);
        assert_eq!(sequential, (status::OK, 499_507));
        for threads in [1, 2, 8] {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
            assert_eq!(run(Some(&pool), sum_kernel, &mut data, 7), sequential);
        }
    }

    #[test]
    fn failing_chunk_deoptimizes() {
        let mut data: Vec<i64> = (0..100).collect();
        let (st, _) = run(None, failing_kernel, &mut data, 0);
        assert_eq!(st, status::DEOPT);
    }

    #[test]
    fn prefix_bound_covers_every_order() {
        assert!(prefix_bounded(0, i64::MAX as u64));
        assert!(!prefix_bounded(1, i64::MAX as u64));
        assert!(!prefix_bounded(i64::MIN, 0));
        assert!(prefix_bounded(-5, 10));
        assert!(!prefix_bounded(0, u64::MAX));
    }

    #[test]
    fn running_total_overflow_inside_a_chunk_deoptimizes() {
        // Sequentially 1 + MAX overflows even though every chunk partial is in range
        let mut data = vec![0_i64; 64];
        data[0] = 1;
        data[1] = i64::MAX;
        data[2] = -1;
        let (st, _) = run(None, tracked_sum_kernel, &mut data, 0);
        assert_eq!(st, status::DEOPT);

        let mut small: Vec<i64> = (0..64).map(|i| i - 32).collect();
        assert_eq!(run(None, tracked_sum_kernel, &mut small, 5), (status::OK, 5 - 32));
    }

    #[test]
    fn pow_helpers_flag_errors() {
        let mut ctx = ExecCtx::new(0, 10, None, 1, 1);
        assert_eq!(adr_int_pow(&mut ctx, 3, 4), 81);
        assert!(!ctx.deoptimized());
        adr_int_pow(&mut ctx, 10, 40);
        assert!(ctx.deoptimized());
    }
}
