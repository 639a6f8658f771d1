//! Host arithmetic semantics shared by the interpreter and generated code
//!
//! Every operation here follows the host language's rules exactly (floor division and
//! modulo take the sign of the divisor, true division of integers is correctly rounded,
//! `**` raises instead of producing complex numbers). Generated code calls the float
//! helpers through the runtime so both execution paths agree bit for bit.

use std::cmp::Ordering;

/// Largest magnitude an integer may have to convert to `f64` without rounding
pub const EXACT_FLOAT_INT: i64 = 1 << 53;

/// Failure of a numeric operation, mapped to the matching host exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericError {
    /// Result does not fit the host's 64-bit integers
    Overflow,
    ZeroDivision,
    /// Operation is mathematically undefined in the real domain (complex result, NaN to int)
    Domain,
    /// Negative shift count
    NegativeShift,
}

impl NumericError {
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Overflow => "integer overflow",
            Self::ZeroDivision => "division by zero",
            Self::Domain => "math domain error",
            Self::NegativeShift => "negative shift count",
        }
    }
}

pub type NumericResult<T> = Result<T, NumericError>;

// ============================================================================
// Integers
// ============================================================================

/// `a // b` rounding toward negative infinity
pub fn int_floordiv(a: i64, b: i64) -> NumericResult<i64> {
    if b == 0 {
        return Err(NumericError::ZeroDivision);
    }
    let q = a.checked_div(b).ok_or(NumericError::Overflow)?;
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

/// `a % b` with the sign of the divisor
pub fn int_mod(a: i64, b: i64) -> NumericResult<i64> {
    if b == 0 {
        return Err(NumericError::ZeroDivision);
    }
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

/// `a ** b` for a non-negative exponent
pub fn int_pow(base: i64, exp: i64) -> NumericResult<i64> {
    let exp = u32::try_from(exp).map_err(|_| {
        if exp < 0 {
            NumericError::Domain
        } else {
            NumericError::Overflow
        }
    });
    match exp {
        Ok(exp) => base.checked_pow(exp).ok_or(NumericError::Overflow),
        // Huge exponents only stay representable for these bases
        Err(NumericError::Overflow) => match base {
            0 | 1 => Ok(base),
            -1 => Ok(1),
            _ => Err(NumericError::Overflow),
        },
        Err(e) => Err(e),
    }
}

pub fn int_shl(a: i64, count: i64) -> NumericResult<i64> {
    if count < 0 {
        return Err(NumericError::NegativeShift);
    }
    if a == 0 {
        return Ok(0);
    }
    if count >= 64 {
        return Err(NumericError::Overflow);
    }
    let shifted = a << count;
    if shifted >> count == a {
        Ok(shifted)
    } else {
        Err(NumericError::Overflow)
    }
}

pub fn int_shr(a: i64, count: i64) -> NumericResult<i64> {
    if count < 0 {
        return Err(NumericError::NegativeShift);
    }
    Ok(a >> count.min(63))
}

/// Correctly rounded `a / b` for integers
pub fn int_truediv(a: i64, b: i64) -> NumericResult<f64> {
    if b == 0 {
        return Err(NumericError::ZeroDivision);
    }
    if a.unsigned_abs() <= EXACT_FLOAT_INT as u64 && b.unsigned_abs() <= EXACT_FLOAT_INT as u64 {
        return Ok(a as f64 / b as f64);
    }
    let negative = (a < 0) != (b < 0);
    let n = u128::from(a.unsigned_abs());
    let d = u128::from(b.unsigned_abs());
    if n == 0 {
        return Ok(if negative { -0.0 } else { 0.0 });
    }
    // Scale the numerator so the quotient carries well over 53 significant bits, then fold
    // the remainder into a sticky bit so the final conversion rounds exactly once.
    let shift = 127 - (128 - n.leading_zeros());
    let scaled = n << shift;
    let mut q = scaled / d;
    if scaled % d != 0 {
        q |= 1;
    }
    let magnitude = q as f64 * 2f64.powi(-(shift as i32));
    Ok(if negative { -magnitude } else { magnitude })
}

// ============================================================================
// Floats
// ============================================================================

/// `a % b` for floats with the sign of the divisor
pub fn float_mod(a: f64, b: f64) -> NumericResult<f64> {
    if b == 0.0 {
        return Err(NumericError::ZeroDivision);
    }
    Ok(float_mod_nonzero(a, b))
}

/// `a % b` for a divisor known to be non-zero
#[must_use]
pub fn float_mod_nonzero(a: f64, b: f64) -> f64 {
    let m = a % b;
    if m != 0.0 {
        if (b < 0.0) != (m < 0.0) {
            m + b
        } else {
            m
        }
    } else {
        0f64.copysign(b)
    }
}

/// `a // b` for floats
pub fn float_floordiv(a: f64, b: f64) -> NumericResult<f64> {
    if b == 0.0 {
        return Err(NumericError::ZeroDivision);
    }
    Ok(float_floordiv_nonzero(a, b))
}

/// `a // b` for a divisor known to be non-zero
#[must_use]
pub fn float_floordiv_nonzero(a: f64, b: f64) -> f64 {
    let m = a % b;
    let mut div = (a - m) / b;
    if m != 0.0 && ((b < 0.0) != (m < 0.0)) {
        div -= 1.0;
    }
    if div != 0.0 {
        let mut floordiv = div.floor();
        if div - floordiv > 0.5 {
            floordiv += 1.0;
        }
        floordiv
    } else {
        0f64.copysign(a / b)
    }
}

/// `a / b` for floats
pub fn float_truediv(a: f64, b: f64) -> NumericResult<f64> {
    if b == 0.0 {
        Err(NumericError::ZeroDivision)
    } else {
        Ok(a / b)
    }
}

/// `a ** b` for floats
pub fn float_pow(base: f64, exp: f64) -> NumericResult<f64> {
    if exp == 0.0 {
        return Ok(1.0);
    }
    if base.is_nan() {
        return Ok(base);
    }
    if exp.is_nan() {
        return Ok(if base == 1.0 { 1.0 } else { exp });
    }
    if exp.is_infinite() {
        let magnitude = base.abs();
        return Ok(if magnitude == 1.0 {
            1.0
        } else if (exp > 0.0) == (magnitude > 1.0) {
            f64::INFINITY
        } else {
            0.0
        });
    }
    let exp_is_odd_integer = exp.fract() == 0.0 && (exp % 2.0).abs() == 1.0;
    if base.is_infinite() {
        return Ok(if base > 0.0 {
            if exp > 0.0 {
                base
            } else {
                0.0
            }
        } else if exp > 0.0 {
            if exp_is_odd_integer {
                base
            } else {
                -base
            }
        } else if exp_is_odd_integer {
            -0.0
        } else {
            0.0
        });
    }
    if base == 0.0 {
        if exp < 0.0 {
            return Err(NumericError::ZeroDivision);
        }
        return Ok(if exp_is_odd_integer { base } else { 0.0 });
    }
    let mut magnitude = base;
    let mut negate = false;
    if base < 0.0 {
        if exp.fract() != 0.0 {
            return Err(NumericError::Domain);
        }
        magnitude = -base;
        negate = exp_is_odd_integer;
    }
    if magnitude == 1.0 {
        return Ok(if negate { -1.0 } else { 1.0 });
    }
    let result = magnitude.powf(exp);
    if result.is_infinite() {
        return Err(NumericError::Overflow);
    }
    Ok(if negate { -result } else { result })
}

/// `int(x)` for a float: truncation toward zero
pub fn float_to_int(x: f64) -> NumericResult<i64> {
    if x.is_nan() {
        return Err(NumericError::Domain);
    }
    let truncated = x.trunc();
    // 2^63 is exactly representable; anything at or beyond it does not fit
    if truncated >= 9_223_372_036_854_775_808.0 || truncated < -9_223_372_036_854_775_808.0 {
        return Err(NumericError::Overflow);
    }
    Ok(truncated as i64)
}

/// Exact ordering between an integer and a float (`None` when the float is NaN)
#[must_use]
pub fn compare_int_float(i: i64, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if i.unsigned_abs() <= EXACT_FLOAT_INT as u64 || f.is_infinite() {
        return (i as f64).partial_cmp(&f);
    }
    if f >= 9_223_372_036_854_775_808.0 {
        return Some(Ordering::Less);
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Some(Ordering::Greater);
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(f - whole)),
        other => Some(other),
    }
}

/// Host `max(a, b)`: the first argument wins ties and incomparable pairs
#[must_use]
pub fn float_max(a: f64, b: f64) -> f64 {
    if b > a {
        b
    } else {
        a
    }
}

/// Host `min(a, b)`: the first argument wins ties and incomparable pairs
#[must_use]
pub fn float_min(a: f64, b: f64) -> f64 {
    if b < a {
        b
    } else {
        a
    }
}
