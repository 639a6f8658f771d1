//! Machine representation of typed values
//!
//! | Kind          | Cranelift                           |
//! |---------------|-------------------------------------|
//! | `int`         | `i64`                               |
//! | `float`       | `f64`                               |
//! | `bool`        | `i8` holding 0 or 1                 |
//! | `list[...]`   | two `i64` parameters: data pointer and length |
//!
//! Every compiled function takes a trailing context pointer. Array returns hand back the
//! position of the returned parameter; `None` returns hand back 0.

use cranelift_codegen::ir::{types, AbiParam, Signature, Type};
use cranelift_jit::JITModule;
use cranelift_module::Module;

use crate::analysis::typed::{NumType, ReturnKind, TypedFunction, ValueKind};

/// Pointer-sized integer used for addresses and lengths
pub const WORD: Type = types::I64;

/// Lanes of the packed float form
pub const F64X2: Type = types::F64X2;

#[must_use]
pub const fn clif_type(ty: NumType) -> Type {
    match ty {
        NumType::Int => types::I64,
        NumType::Float => types::F64,
        NumType::Bool => types::I8,
    }
}

#[must_use]
pub const fn return_type(ret: ReturnKind) -> Type {
    match ret {
        ReturnKind::Scalar(ty) => clif_type(ty),
        ReturnKind::Array(_) | ReturnKind::None => WORD,
    }
}

/// Signature of a compiled specialization
pub fn function_signature(module: &JITModule, function: &TypedFunction) -> Signature {
    let mut sig = module.make_signature();
    for kind in &function.arg_kinds {
        match kind {
            ValueKind::Scalar(ty) => sig.params.push(AbiParam::new(clif_type(*ty))),
            ValueKind::Array(_) => {
                sig.params.push(AbiParam::new(WORD));
                sig.params.push(AbiParam::new(WORD));
            }
        }
    }
    sig.params.push(AbiParam::new(WORD));
    sig.returns.push(AbiParam::new(return_type(function.ret)));
    sig
}

/// `(env, arrays, lo, hi, ctx) -> partial bits`
pub fn kernel_signature(module: &JITModule) -> Signature {
    let mut sig = module.make_signature();
    sig.params.extend([AbiParam::new(WORD); 5]);
    sig.returns.push(AbiParam::new(WORD));
    sig
}

/// `(scalars, arrays, ctx) -> result bits`
pub fn entry_signature(module: &JITModule) -> Signature {
    let mut sig = module.make_signature();
    sig.params.extend([AbiParam::new(WORD); 3]);
    sig.returns.push(AbiParam::new(WORD));
    sig
}

pub(super) fn helper_signature(module: &JITModule, params: &[Type], ret: Type) -> Signature {
    let mut sig = module.make_signature();
    sig.params.extend(params.iter().map(|t| AbiParam::new(*t)));
    sig.returns.push(AbiParam::new(ret));
    sig
}
