//! JIT Compiler implementation
//!
//! [`JitCompiler`] owns the host ISA; every call to [`JitCompiler::compile`] builds a fresh
//! JIT module so that each artifact can be freed independently.

use std::collections::HashMap;
use std::sync::Arc;

use cranelift_codegen::ir::{types, UserFuncName};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use tracing::debug;

use crate::analysis::typed::{FuncIndex, ParallelLoop, TypedBody};

use super::lower::{self, Helpers, Symbols};
use super::runtime::{self, CompiledCode};
use super::types::{self as jit_types, WORD};
use super::{JitError, JitResult};

/// Cranelift-based code generator
pub struct JitCompiler {
    isa: Arc<dyn TargetIsa>,
}

impl std::fmt::Debug for JitCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCompiler")
            .field("isa", &self.isa.name())
            .finish()
    }
}

fn cranelift_err(e: impl std::fmt::Display) -> JitError {
    JitError::Cranelift(e.to_string())
}

impl JitCompiler {
    /// Configure Cranelift for the host machine
    pub fn new() -> JitResult<Self> {
        let mut flag_builder = settings::builder();
        flag_builder.set("opt_level", "speed").map_err(cranelift_err)?;
        flag_builder.set("is_pic", "false").map_err(cranelift_err)?;

        let isa_builder = cranelift_native::builder()
            .map_err(|msg| JitError::Cranelift(format!("host machine is not supported: {msg}")))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(cranelift_err)?;
        Ok(Self { isa })
    }

    fn new_module(&self) -> JITModule {
        let mut jit_builder = JITBuilder::with_isa(self.isa.clone(), cranelift_module::default_libcall_names());
        for (name, ptr) in runtime::symbols() {
            jit_builder.symbol(name, ptr);
        }
        JITModule::new(jit_builder)
    }

    fn declare_helpers(module: &mut JITModule) -> JitResult<Helpers> {
        let f64_pair = jit_types::helper_signature(module, &[types::F64, types::F64], types::F64);
        let float_pow = jit_types::helper_signature(module, &[WORD, types::F64, types::F64], types::F64);
        let int_pow = jit_types::helper_signature(module, &[WORD, types::I64, types::I64], types::I64);
        let parallel_for = jit_types::helper_signature(
            module,
            &[WORD, WORD, WORD, WORD, types::I64, types::I64, types::I32, WORD],
            WORD,
        );
        let mut import = |name: &str, sig| {
            module
                .declare_function(name, Linkage::Import, sig)
                .map_err(cranelift_err)
        };
        Ok(Helpers {
            parallel_for: import("adr_parallel_for", &parallel_for)?,
            float_mod: import("adr_float_mod", &f64_pair)?,
            float_floordiv: import("adr_float_floordiv", &f64_pair)?,
            float_pow: import("adr_float_pow", &float_pow)?,
            int_pow: import("adr_int_pow", &int_pow)?,
        })
    }

    /// Compile an optimized body into a callable artifact
    pub fn compile(&self, body: &TypedBody) -> JitResult<CompiledCode> {
        let mut module = self.new_module();
        let mut ctx = module.make_context();
        let mut builder_ctx = FunctionBuilderContext::new();

        let helpers = Self::declare_helpers(&mut module)?;
        let reachable = body.reachable();

        let mut functions = HashMap::new();
        let mut signatures = HashMap::new();
        let mut kernels: HashMap<*const ParallelLoop, FuncId> = HashMap::new();
        let mut outlined: Vec<(FuncIndex, &ParallelLoop, FuncId)> = Vec::new();
        for &index in &reachable {
            let function = body.function(index);
            let sig = jit_types::function_signature(&module, function);
            let id = module
                .declare_function(&format!("adr_{}_{}", function.name, index.0), Linkage::Local, &sig)
                .map_err(cranelift_err)?;
            functions.insert(index, id);
            signatures.insert(index, sig);

            let mut loops = Vec::new();
            lower::parallel_loops(&function.body, &mut loops);
            for (k, p) in loops.into_iter().enumerate() {
                let kernel_sig = jit_types::kernel_signature(&module);
                let kid = module
                    .declare_function(
                        &format!("adr_{}_{}_chunk{k}", function.name, index.0),
                        Linkage::Local,
                        &kernel_sig,
                    )
                    .map_err(cranelift_err)?;
                kernels.insert(p as *const ParallelLoop, kid);
                outlined.push((index, p, kid));
            }
        }
        let symbols = Symbols {
            functions,
            kernels,
            helpers,
        };

        for &index in &reachable {
            let id = symbols.functions[&index];
            ctx.func.signature = signatures[&index].clone();
            ctx.func.name = UserFuncName::user(0, id.as_u32());
            {
                let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
                lower::lower_function(&mut builder, &mut module, &symbols, body, index)?;
                builder.finalize();
            }
            Self::define(&mut module, &mut ctx, id)?;
        }

        for (index, p, id) in outlined {
            ctx.func.signature = jit_types::kernel_signature(&module);
            ctx.func.name = UserFuncName::user(0, id.as_u32());
            {
                let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
                lower::lower_kernel(&mut builder, &mut module, &symbols, body, index, p)?;
                builder.finalize();
            }
            Self::define(&mut module, &mut ctx, id)?;
        }

        let root = body.root();
        let root_id = symbols.functions[&FuncIndex::ROOT];
        let entry_id = module
            .declare_function(&format!("adr_{}_entry", root.name), Linkage::Local, &jit_types::entry_signature(&module))
            .map_err(cranelift_err)?;
        ctx.func.signature = jit_types::entry_signature(&module);
        ctx.func.name = UserFuncName::user(0, entry_id.as_u32());
        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
            lower::lower_entry(&mut builder, &mut module, root, root_id)?;
            builder.finalize();
        }
        Self::define(&mut module, &mut ctx, entry_id)?;

        module.finalize_definitions().map_err(cranelift_err)?;
        let entry = module.get_finalized_function(entry_id);
        debug!(
            event = "native_code_ready",
            function = %root.name,
            functions = reachable.len(),
            kernels = symbols.kernels.len()
        );
        Ok(CompiledCode::new(module, entry, root.arg_kinds.clone(), root.ret))
    }

    fn define(module: &mut JITModule, ctx: &mut Context, id: FuncId) -> JitResult<()> {
        module.define_function(id, ctx).map_err(|e| match e {
            cranelift_module::ModuleError::Compilation(err) => JitError::Cranelift(format!("{err:?}")),
            other => cranelift_err(other),
        })?;
        module.clear_context(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::typed::{NumType, ValueKind};
    use crate::jit::{ExecCtx, Frame};
    use crate::opt::tests::optimized;
    use crate::testutil::{float, float_array, int, int_array};

    fn compile(source: &str, name: &str, kinds: &[ValueKind]) -> CompiledCode {
        let (body, _) = optimized(source, name, kinds);
        JitCompiler::new().unwrap().compile(&body).unwrap()
    }

    fn run(code: &CompiledCode, frame: &mut Frame) -> Option<u64> {
        let mut ctx = ExecCtx::new(0, 1000, None, 4, 8);
        let bits = code.invoke(frame, &mut ctx).unwrap();
        (!ctx.deoptimized()).then_some(bits)
    }

    fn ints(values: &[i64]) -> Vec<u64> {
        values.iter().map(|v| *v as u64).collect()
    }

    const SUM_RANGE: &str = "def sum_range(n):\n    # #adrenaline:simd\n    total = 0\n    for i in range(n):\n        total += i\n    return total\n";

    #[test]
    fn compiler_configures_for_host() {
        assert!(JitCompiler::new().is_ok());
    }

    #[test]
    fn lane_split_sum_matches_closed_form() {
        let code = compile(SUM_RANGE, "sum_range", &[int()]);
        for n in [0i64, 1, 3, 4, 5, 7, 1000] {
            let mut frame = Frame {
                scalars: ints(&[n]),
                arrays: Vec::new(),
            };
            assert_eq!(run(&code, &mut frame), Some((n * (n - 1) / 2) as u64), "n = {n}");
        }
    }

    #[test]
    fn integer_overflow_deoptimizes() {
        let source = "def f(a, b):\n    return a * b\n";
        let code = compile(source, "f", &[int(), int()]);
        let mut frame = Frame {
            scalars: ints(&[1 << 40, 1 << 30]),
            arrays: Vec::new(),
        };
        assert_eq!(run(&code, &mut frame), None);
        let mut frame = Frame {
            scalars: ints(&[-7, 3]),
            arrays: Vec::new(),
        };
        assert_eq!(run(&code, &mut frame), Some((-21i64) as u64));
    }

    #[test]
    fn floor_division_and_modulo_round_down() {
        let source = "def f(a, b):\n    return a // b * 100 + a % b\n";
        let code = compile(source, "f", &[int(), int()]);
        for (a, b) in [(7i64, 2i64), (-7, 2), (7, -2), (-7, -2), (5, -1)] {
            let mut frame = Frame {
                scalars: ints(&[a, b]),
                arrays: Vec::new(),
            };
            let q = (a as f64 / b as f64).floor() as i64;
            let expected = q * 100 + (a - q * b);
            assert_eq!(run(&code, &mut frame), Some(expected as u64), "{a} {b}");
        }
        let mut frame = Frame {
            scalars: ints(&[1, 0]),
            arrays: Vec::new(),
        };
        assert_eq!(run(&code, &mut frame), None);
    }

    #[test]
    fn out_of_range_index_deoptimizes() {
        let source = "def at(a: list[int], i):\n    return a[i]\n";
        let code = compile(source, "at", &[int_array(), int()]);
        let data = ints(&[10, 20, 30]);
        let mut frame = Frame {
            scalars: ints(&[-1]),
            arrays: vec![data.clone()],
        };
        assert_eq!(run(&code, &mut frame), Some(30));
        let mut frame = Frame {
            scalars: ints(&[3]),
            arrays: vec![data],
        };
        assert_eq!(run(&code, &mut frame), None);
    }

    #[test]
    fn packed_kernel_writes_every_element() {
        let source = "def axpy(x: list[float], y: list[float], out: list[float], k: float):\n    # #adrenaline:simd\n    for i in range(len(x)):\n        out[i] = k * x[i] + y[i]\n";
        let code = compile(source, "axpy", &[float_array(), float_array(), float_array(), float()]);
        for n in [0usize, 1, 2, 3, 5] {
            let x: Vec<u64> = (0..n).map(|i| (i as f64).to_bits()).collect();
            let y: Vec<u64> = (0..n).map(|_| 0.5f64.to_bits()).collect();
            let mut frame = Frame {
                scalars: vec![2.0f64.to_bits()],
                arrays: vec![x, y, vec![0; n]],
            };
            assert!(run(&code, &mut frame).is_some());
            let out: Vec<f64> = frame.arrays[2].iter().map(|b| f64::from_bits(*b)).collect();
            let expected: Vec<f64> = (0..n).map(|i| 2.0 * i as f64 + 0.5).collect();
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn parallel_reduction_runs_chunks() {
        let source = "def process_list(items: list[int]):\n    # #adrenaline:parallel\n    result = 0\n    for item in items:\n        result += item * 2\n    return result\n";
        let code = compile(source, "process_list", &[int_array()]);
        let data: Vec<u64> = (0..1000).collect();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut ctx = ExecCtx::new(0, 1000, Some(&pool), 16, 8);
        let mut frame = Frame {
            scalars: Vec::new(),
            arrays: vec![data],
        };
        let bits = code.invoke(&mut frame, &mut ctx).unwrap();
        assert!(!ctx.deoptimized());
        assert_eq!(bits, 999_000);
    }

    #[test]
    fn recursion_limit_deoptimizes() {
        let source = "def depth(n):\n    if n == 0:\n        return 0\n    return depth(n - 1) + 1\n";
        let code = compile(source, "depth", &[int()]);
        let mut frame = Frame {
            scalars: ints(&[50]),
            arrays: Vec::new(),
        };
        assert_eq!(run(&code, &mut frame), Some(50));
        let mut ctx = ExecCtx::new(0, 20, None, 1, 1);
        code.invoke(&mut frame, &mut ctx).unwrap();
        assert!(ctx.deoptimized());
    }

    #[test]
    fn frame_shape_is_checked() {
        let code = compile(SUM_RANGE, "sum_range", &[int()]);
        let mut frame = Frame::default();
        let mut ctx = ExecCtx::new(0, 10, None, 1, 1);
        assert!(code.invoke(&mut frame, &mut ctx).is_err());
        assert_eq!(code.ret(), crate::analysis::typed::ReturnKind::Scalar(NumType::Int));
    }
}
