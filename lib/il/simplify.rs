//! Local rewriting over expression trees.
//!
//! Rules here are purely structural: constant folding, flattening of
//! concatenations and slices, deduplication of disjunctions, and
//! identity/absorbing-element elimination. Nothing in this module consults
//! a machine state.

use super::*;
use std::cmp;

/// Disjunctions wider than this collapse to `vecw`.
pub(crate) const VEC_LIMIT: usize = 32;

pub(crate) fn mask(size: usize) -> u64 {
    if size >= 64 {
        !0
    } else {
        (1u64 << size) - 1
    }
}

/// Interpret a masked value as a signed integer of the given width.
pub(crate) fn sxt(value: u64, size: usize) -> i64 {
    if size >= 64 || value & (1u64 << (size - 1)) == 0 {
        value as i64
    } else {
        (value | !mask(size)) as i64
    }
}

fn is_unknown(e: &Expression) -> bool {
    matches!(e, Expression::Top { .. } | Expression::VecW { .. })
}

/// True if the expression denotes a single value as a function of machine
/// state: no `top` and no disjunctions anywhere in the tree.
fn is_deterministic(e: &Expression) -> bool {
    match e {
        Expression::Top { .. } | Expression::VecW { .. } | Expression::Vec { .. } => false,
        Expression::Comp { parts } => parts.iter().all(is_deterministic),
        Expression::Slc { base, .. } => is_deterministic(base),
        Expression::Ptr { base, .. } => is_deterministic(base),
        Expression::Mem { addr, mods, .. } => {
            is_deterministic(addr)
                && mods
                    .iter()
                    .all(|(a, v)| is_deterministic(a) && is_deterministic(v))
        }
        Expression::Tst { cond, then, else_ } => {
            is_deterministic(cond) && is_deterministic(then) && is_deterministic(else_)
        }
        Expression::Op { lhs, rhs, .. } => is_deterministic(lhs) && is_deterministic(rhs),
        Expression::Uop { rhs, .. } => is_deterministic(rhs),
        _ => true,
    }
}

fn spread(e: Expression) -> Vec<Expression> {
    match e {
        Expression::Vec { cands } => cands,
        e => vec![e],
    }
}

pub(crate) fn binop_sf(op: Binop, lhs: Expression, rhs: Expression, force_sf: bool) -> Expression {
    // a disjunction operand distributes pairwise over its candidates
    if lhs.candidates().is_some() || rhs.candidates().is_some() {
        let ls = spread(lhs);
        let rs = spread(rhs);
        let mut out = Vec::with_capacity(ls.len() * rs.len());
        for l in &ls {
            for r in &rs {
                out.push(binop_sf(op, l.clone(), r.clone(), force_sf));
            }
        }
        return disjunction(out);
    }

    let size = {
        let n = cmp::max(lhs.size(), rhs.size());
        if op.is_comparison() {
            1
        } else if op == Binop::Pow {
            2 * n
        } else {
            n
        }
    };
    if is_unknown(&lhs) || is_unknown(&rhs) {
        return top(size);
    }

    let (lhs, rhs) = if op == Binop::Pow {
        (lhs, rhs)
    } else {
        let n = cmp::max(lhs.size(), rhs.size());
        (lhs.extend_to(n), rhs.extend_to(n))
    };
    let sf = force_sf || lhs.sf() || rhs.sf();

    if let (Some(lv), Some(rv)) = (lhs.as_cst(), rhs.as_cst()) {
        if let Some(e) = fold(op, lv, lhs.size(), rv, rhs.size(), sf) {
            return e;
        }
    }
    if let Some(e) = identities(op, &lhs, &rhs) {
        return e;
    }

    let (lhs, rhs) = if op.is_commutative() && lhs > rhs {
        (rhs, lhs)
    } else {
        (lhs, rhs)
    };
    Expression::Op {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        sf,
    }
}

fn fold(op: Binop, lv: u64, ln: usize, rv: u64, rn: usize, sf: bool) -> Option<Expression> {
    let n = cmp::max(ln, rn);
    let e = match op {
        Binop::Add => cst(lv.wrapping_add(rv), n),
        Binop::Sub => cst(lv.wrapping_sub(rv), n),
        Binop::Mul => cst(lv.wrapping_mul(rv), n),
        Binop::Pow => {
            let wide = 2 * n;
            if wide > 64 {
                return None;
            }
            let (a, b) = if sf {
                (sxt(lv, ln) as u64, sxt(rv, rn) as u64)
            } else {
                (lv, rv)
            };
            cst(a.wrapping_mul(b), wide)
        }
        Binop::Div => {
            if rv == 0 {
                return None;
            }
            if sf {
                cst(sxt(lv, n).wrapping_div(sxt(rv, n)) as u64, n)
            } else {
                cst(lv / rv, n)
            }
        }
        Binop::Mod => {
            if rv == 0 {
                return None;
            }
            if sf {
                cst(sxt(lv, n).wrapping_rem(sxt(rv, n)) as u64, n)
            } else {
                cst(lv % rv, n)
            }
        }
        Binop::And => cst(lv & rv, n),
        Binop::Or => cst(lv | rv, n),
        Binop::Xor => cst(lv ^ rv, n),
        Binop::Shl => {
            if rv >= n as u64 {
                cst(0, n)
            } else {
                cst(lv << rv as u32, n)
            }
        }
        Binop::Shr => {
            if sf {
                let s = cmp::min(rv, n as u64 - 1) as u32;
                cst((sxt(lv, n) >> s) as u64, n)
            } else if rv >= n as u64 {
                cst(0, n)
            } else {
                cst(lv >> rv as u32, n)
            }
        }
        Binop::Ror => {
            let s = (rv % n as u64) as u32;
            if s == 0 {
                cst(lv, n)
            } else {
                cst((lv >> s) | (lv << (n as u32 - s)), n)
            }
        }
        Binop::Rol => {
            let s = (rv % n as u64) as u32;
            if s == 0 {
                cst(lv, n)
            } else {
                cst((lv << s) | (lv >> (n as u32 - s)), n)
            }
        }
        Binop::Eq => cst((lv == rv) as u64, 1),
        Binop::Ne => cst((lv != rv) as u64, 1),
        Binop::Lt => {
            let r = if sf { sxt(lv, n) < sxt(rv, n) } else { lv < rv };
            cst(r as u64, 1)
        }
        Binop::Le => {
            let r = if sf {
                sxt(lv, n) <= sxt(rv, n)
            } else {
                lv <= rv
            };
            cst(r as u64, 1)
        }
        Binop::Gt => {
            let r = if sf { sxt(lv, n) > sxt(rv, n) } else { lv > rv };
            cst(r as u64, 1)
        }
        Binop::Ge => {
            let r = if sf {
                sxt(lv, n) >= sxt(rv, n)
            } else {
                lv >= rv
            };
            cst(r as u64, 1)
        }
    };
    Some(e)
}

fn identities(op: Binop, lhs: &Expression, rhs: &Expression) -> Option<Expression> {
    let n = cmp::max(lhs.size(), rhs.size());
    let lv = lhs.as_cst();
    let rv = rhs.as_cst();
    let ones = mask(n);
    match op {
        Binop::Add => {
            if lv == Some(0) {
                return Some(rhs.clone());
            }
            if rv == Some(0) {
                return Some(lhs.clone());
            }
        }
        Binop::Sub => {
            if rv == Some(0) {
                return Some(lhs.clone());
            }
            if lhs == rhs && is_deterministic(lhs) {
                return Some(cst(0, n));
            }
        }
        Binop::Mul => {
            if lv == Some(0) || rv == Some(0) {
                return Some(cst(0, n));
            }
            if lv == Some(1) {
                return Some(rhs.clone());
            }
            if rv == Some(1) {
                return Some(lhs.clone());
            }
        }
        Binop::Div => {
            if rv == Some(1) {
                return Some(lhs.clone());
            }
        }
        Binop::And => {
            if lv == Some(0) || rv == Some(0) {
                return Some(cst(0, n));
            }
            if lv == Some(ones) {
                return Some(rhs.clone());
            }
            if rv == Some(ones) {
                return Some(lhs.clone());
            }
            if lhs == rhs && is_deterministic(lhs) {
                return Some(lhs.clone());
            }
        }
        Binop::Or => {
            if lv == Some(0) {
                return Some(rhs.clone());
            }
            if rv == Some(0) {
                return Some(lhs.clone());
            }
            if lv == Some(ones) || rv == Some(ones) {
                return Some(cst(ones, n));
            }
            if lhs == rhs && is_deterministic(lhs) {
                return Some(lhs.clone());
            }
        }
        Binop::Xor => {
            if lv == Some(0) {
                return Some(rhs.clone());
            }
            if rv == Some(0) {
                return Some(lhs.clone());
            }
            if lhs == rhs && is_deterministic(lhs) {
                return Some(cst(0, n));
            }
        }
        Binop::Shl | Binop::Shr | Binop::Ror | Binop::Rol => {
            if rv == Some(0) {
                return Some(lhs.clone());
            }
        }
        Binop::Eq => {
            if lhs == rhs && is_deterministic(lhs) {
                return Some(bit1());
            }
        }
        Binop::Ne => {
            if lhs == rhs && is_deterministic(lhs) {
                return Some(bit0());
            }
        }
        _ => {}
    }
    None
}

pub(crate) fn unop(op: Unop, rhs: Expression) -> Expression {
    if rhs.candidates().is_some() {
        let out = spread(rhs)
            .into_iter()
            .map(|r| unop(op, r))
            .collect::<Vec<Expression>>();
        return disjunction(out);
    }
    if is_unknown(&rhs) {
        return top(rhs.size());
    }
    if let Some(v) = rhs.as_cst() {
        let n = rhs.size();
        return match op {
            Unop::Neg => cst(v.wrapping_neg(), n),
            Unop::Not => cst(!v, n),
        };
    }
    if let Expression::Uop { op: inner, rhs: r } = &rhs {
        if *inner == op {
            return (**r).clone();
        }
    }
    Expression::Uop {
        op,
        rhs: Box::new(rhs),
    }
}

/// Fold a concatenation: flatten nested parts and merge neighbours that
/// assemble into a single constant, a contiguous slice of one base, or a
/// contiguous little-endian memory read.
pub(crate) fn assemble(parts: Vec<Expression>) -> Expression {
    let mut flat = Vec::with_capacity(parts.len());
    for p in parts {
        match p {
            Expression::Comp { parts } => flat.extend(parts),
            p => flat.push(p),
        }
    }
    let mut out: Vec<Expression> = Vec::with_capacity(flat.len());
    for p in flat {
        if let Some(last) = out.last() {
            if let Some(merged) = merge_parts(last, &p) {
                let end = out.len() - 1;
                out[end] = merged;
                continue;
            }
        }
        out.push(p);
    }
    if out.len() == 1 {
        return out.remove(0);
    }
    Expression::Comp { parts: out }
}

fn merge_parts(lo: &Expression, hi: &Expression) -> Option<Expression> {
    match (lo, hi) {
        (
            Expression::Cst { value: a, size: n },
            Expression::Cst { value: b, size: m },
        ) if *n + *m <= 64 => Some(cst(*a | (*b << *n as u32), *n + *m)),
        (
            Expression::Slc {
                base: b1,
                pos: p1,
                size: s1,
                ..
            },
            Expression::Slc {
                base: b2,
                pos: p2,
                size: s2,
                ..
            },
        ) if b1 == b2 && *p2 == *p1 + *s1 => {
            if *p1 == 0 && *s1 + *s2 == b1.size() {
                Some((**b1).clone())
            } else {
                Some(Expression::Slc {
                    base: b1.clone(),
                    pos: *p1,
                    size: *s1 + *s2,
                    alias: None,
                    sf: false,
                })
            }
        }
        (
            Expression::Mem {
                addr: a1,
                size: s1,
                endian: Endian::Little,
                mods: m1,
            },
            Expression::Mem {
                addr: a2,
                size: s2,
                endian: Endian::Little,
                mods: m2,
            },
        ) if m1.is_empty() && m2.is_empty() => {
            if let (
                Expression::Ptr { base: b1, disp: d1 },
                Expression::Ptr { base: b2, disp: d2 },
            ) = (&**a1, &**a2)
            {
                if b1 == b2 && *d2 == *d1 + (*s1 / 8) as i64 {
                    return Some(Expression::Mem {
                        addr: a1.clone(),
                        size: *s1 + *s2,
                        endian: Endian::Little,
                        mods: Vec::new(),
                    });
                }
            }
            None
        }
        _ => None,
    }
}

/// Fold a disjunction: flatten nested candidates, deduplicate in order,
/// and collapse over-wide candidate sets.
pub(crate) fn disjunction(cands: Vec<Expression>) -> Expression {
    let mut out: Vec<Expression> = Vec::new();
    let mut wide: Option<usize> = None;
    for c in cands {
        match c {
            Expression::Vec { cands } => {
                for x in cands {
                    if !out.contains(&x) {
                        out.push(x);
                    }
                }
            }
            Expression::VecW { size } => {
                let w = wide.get_or_insert(size);
                if size > *w {
                    *w = size;
                }
            }
            x => {
                if !out.contains(&x) {
                    out.push(x);
                }
            }
        }
    }
    let size = out.iter().map(|c| c.size()).max().unwrap_or(0);
    if let Some(w) = wide {
        return vecw(cmp::max(w, size));
    }
    if out.len() == 1 {
        return out.remove(0);
    }
    if out.len() > VEC_LIMIT {
        debug!("widening a disjunction of {} candidates", out.len());
        return vecw(size);
    }
    Expression::Vec { cands: out }
}

/// Fold a ternary select with a decided condition or equal branches.
pub(crate) fn ite(cond: Expression, then: Expression, else_: Expression) -> Expression {
    if let Some(v) = cond.as_cst() {
        return if v != 0 { then } else { else_ };
    }
    if then == else_ {
        return then;
    }
    Expression::Tst {
        cond: Box::new(cond),
        then: Box::new(then),
        else_: Box::new(else_),
    }
}

impl Expression {
    /// The bit range `[pos, pos + size)` of this expression, folded where
    /// the structure allows. Bounds are the caller's responsibility.
    pub(crate) fn extract(&self, pos: usize, size: usize) -> Expression {
        if pos == 0 && size == self.size() {
            return self.clone();
        }
        match self {
            Expression::Cst { value, .. } => cst(*value >> pos as u32, size),
            Expression::Top { .. } => top(size),
            Expression::VecW { .. } => vecw(size),
            Expression::Comp { parts } => {
                let mut out = Vec::new();
                let mut off = 0;
                for p in parts {
                    let n = p.size();
                    let lo = cmp::max(pos, off);
                    let hi = cmp::min(pos + size, off + n);
                    if lo < hi {
                        out.push(p.extract(lo - off, hi - lo));
                    }
                    off += n;
                }
                assemble(out)
            }
            Expression::Slc { base, pos: p0, .. } => base.extract(*p0 + pos, size),
            Expression::Vec { cands } => {
                disjunction(cands.iter().map(|c| c.extract(pos, size)).collect())
            }
            Expression::Tst { cond, then, else_ } => ite(
                (**cond).clone(),
                then.extract(pos, size),
                else_.extract(pos, size),
            ),
            Expression::Mem {
                addr,
                endian: Endian::Little,
                mods,
                ..
            } if mods.is_empty() && pos % 8 == 0 && size % 8 == 0 => Expression::Mem {
                addr: Box::new(ptr((**addr).clone(), (pos / 8) as i64)),
                size,
                endian: Endian::Little,
                mods: Vec::new(),
            },
            e => Expression::Slc {
                base: Box::new(e.clone()),
                pos,
                size,
                alias: None,
                sf: false,
            },
        }
    }

    /// Rewrite this expression bottom-up with the local rules.
    pub fn simplify(self) -> Expression {
        match self {
            Expression::Comp { parts } => {
                assemble(parts.into_iter().map(|p| p.simplify()).collect())
            }
            Expression::Slc {
                base,
                pos,
                size,
                alias,
                sf,
            } => {
                let e = base.simplify().extract(pos, size);
                let e = if sf { e.signed() } else { e };
                match e {
                    Expression::Slc {
                        base, pos, size, sf, ..
                    } => Expression::Slc {
                        base,
                        pos,
                        size,
                        alias,
                        sf,
                    },
                    e => e,
                }
            }
            Expression::Ptr { base, disp } => ptr(base.simplify(), disp),
            Expression::Mem {
                addr,
                size,
                endian,
                mods,
            } => Expression::Mem {
                addr: Box::new(ptr(addr.simplify(), 0)),
                size,
                endian,
                mods: mods
                    .into_iter()
                    .map(|(a, v)| (a.simplify(), v.simplify()))
                    .collect(),
            },
            Expression::Tst { cond, then, else_ } => {
                ite(cond.simplify(), then.simplify(), else_.simplify())
            }
            Expression::Op { op, lhs, rhs, sf } => {
                binop_sf(op, lhs.simplify(), rhs.simplify(), sf)
            }
            Expression::Uop { op, rhs } => unop(op, rhs.simplify()),
            Expression::Vec { cands } => {
                disjunction(cands.into_iter().map(|c| c.simplify()).collect())
            }
            e => e,
        }
    }
}
