//! Two's-complement arithmetic helpers over symbolic expressions.
//!
//! These build the flag-producing formulas instruction semantics need
//! (carry, overflow, rotate-through-carry) out of plain expression
//! operators, so they fold to constants whenever their inputs do.

use crate::error::*;
use crate::il::{self, Binop, Expression};

/// Absolute value under signed interpretation. Unsigned expressions pass
/// through unchanged.
pub fn abs(x: Expression) -> Expression {
    if !x.sf() {
        return x;
    }
    let n = x.size();
    let y = il::oper(Binop::Shr, x.clone(), il::cst((n - 1) as u64, n));
    (x + y.clone()) ^ y
}

/// The sign bit of an expression.
pub fn sign(x: &Expression) -> Result<Expression> {
    x.slice(x.size() - 1, x.size())
}

/// Addition with carry in, producing `(result, carry, overflow)`.
pub fn add_with_carry(
    x: Expression,
    y: Expression,
    c: Option<Expression>,
) -> Result<(Expression, Expression, Expression)> {
    let c = c.unwrap_or_else(il::bit0).zeroextend(y.size());
    let x = x.signed();
    let y = y.signed();
    let result = x.clone() + y.clone() + c;
    let sx = sign(&x)?;
    let sy = sign(&y)?;
    let sz = sign(&result)?;
    let carry = (sx.clone() & sy.clone()) | (!sz.clone() & (sx.clone() | sy.clone()));
    let overflow = (sz.clone() ^ sx) & (sz ^ sy);
    Ok((result.signed(), carry, overflow))
}

/// Subtraction with borrow in, producing `(result, carry, overflow)`.
pub fn sub_with_borrow(
    x: Expression,
    y: Expression,
    c: Option<Expression>,
) -> Result<(Expression, Expression, Expression)> {
    let c = c.unwrap_or_else(il::bit0).zeroextend(y.size());
    let x = x.signed();
    let y = y.signed();
    let result = x.clone() - y.clone() - c;
    let sx = sign(&x)?;
    let sy = sign(&y)?;
    let sz = sign(&result)?;
    let carry = (!sx.clone() & sy.clone()) | (sz.clone() & (!sx.clone() | sy.clone()));
    let overflow = (sx.clone() ^ sy.clone()) & (sz ^ sx);
    Ok((result.signed(), carry, overflow))
}

/// Rotate right.
pub fn ror(x: Expression, n: Expression) -> Expression {
    il::oper(Binop::Ror, x, n)
}

/// Rotate left.
pub fn rol(x: Expression, n: Expression) -> Expression {
    il::oper(Binop::Rol, x, n)
}

/// Rotate right through a carry bit, producing `(result, carry)`.
pub fn ror_with_carry(
    x: Expression,
    n: Expression,
    c: Expression,
) -> Result<(Expression, Expression)> {
    let xs = x.size();
    let y = il::comp(vec![x, c]);
    let ys = y.size();
    let ry = ror(y, n);
    Ok((ry.slice(0, xs)?, ry.slice(xs, ys)?))
}

/// Rotate left through a carry bit, producing `(result, carry)`.
pub fn rol_with_carry(
    x: Expression,
    n: Expression,
    c: Expression,
) -> Result<(Expression, Expression)> {
    let xs = x.size();
    let y = il::comp(vec![x, c]);
    let ys = y.size();
    let ry = rol(y, n);
    Ok((ry.slice(0, xs)?, ry.slice(xs, ys)?))
}

/// The positions of the least and most significant set bits.
pub fn lsb_msb(v: u64) -> Option<(u32, u32)> {
    if v == 0 {
        None
    } else {
        Some((v.trailing_zeros(), 63 - v.leading_zeros()))
    }
}

/// True if the value is a contiguous run of set bits.
pub fn is_mask(v: u64) -> bool {
    match lsb_msb(v) {
        Some((lsb, msb)) => {
            let full = if msb == 63 {
                !0u64
            } else {
                (1u64 << (msb + 1)) - 1
            };
            full ^ ((1u64 << lsb) - 1) == v
        }
        None => false,
    }
}
