//! The solver bridge.
//!
//! Expressions lower to bitvector formulas over an external solver, and
//! satisfying assignments lift back into concrete [`crate::state::State`]
//! bindings. Solving capability is optional: without the `z3` cargo
//! feature every state operation keeps working and only [`verify`] and
//! model lifting report the dedicated solver-unavailable error.

/// Outcome of a satisfiability check.
///
/// A timed-out or inconclusive check is `Unknown`, never a false answer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Sat {
    Sat,
    Unsat,
    Unknown,
}

/// True if solving capability is compiled in.
pub fn has_solver() -> bool {
    cfg!(feature = "z3")
}

#[cfg(feature = "z3")]
pub use self::backend::{verify, Solver};

#[cfg(not(feature = "z3"))]
pub use self::fallback::verify;

#[cfg(not(feature = "z3"))]
mod fallback {
    use crate::error::*;
    use crate::il::Expression;
    use crate::state::State;

    /// Decide a test expression against a state's path conditions.
    ///
    /// Always fails here: this build carries no solving capability.
    pub fn verify(_test: &Expression, _state: &State) -> Result<Expression> {
        bail!(ErrorKind::SolverUnavailable)
    }
}

#[cfg(feature = "z3")]
mod backend {
    use super::Sat;
    use crate::error::*;
    use crate::il::{self, Binop, Endian, Expression, Unop};
    use crate::state::State;
    use std::time::Duration;
    use z3::ast::{Array, Ast, Bool, BV};
    use z3::{Config, Context, Params, SatResult, Sort, Tactic};

    const VERIFY_TIMEOUT_MS: u64 = 1000;

    /// A solver session.
    ///
    /// The session owns the asserted expressions, the symbolic locations
    /// they mention, and the counter naming the variables introduced for
    /// `top` and disjunction expressions, so repeated lowering calls never
    /// collide and names stay session-local.
    pub struct Solver<'ctx> {
        context: &'ctx Context,
        solver: z3::Solver<'ctx>,
        eqns: Vec<Expression>,
        locs: Vec<Expression>,
        fresh: usize,
    }

    impl<'ctx> Solver<'ctx> {
        pub fn new(context: &'ctx Context) -> Solver<'ctx> {
            Solver {
                context,
                solver: z3::Solver::new(context),
                eqns: Vec::new(),
                locs: Vec::new(),
                fresh: 0,
            }
        }

        /// A session whose checks give up after `millis` and answer
        /// [`Sat::Unknown`].
        pub fn with_timeout(context: &'ctx Context, millis: u32) -> Solver<'ctx> {
            let solver = z3::Solver::new(context);
            let mut params = Params::new(context);
            params.set_u32("timeout", millis);
            solver.set_params(&params);
            Solver {
                context,
                solver,
                eqns: Vec::new(),
                locs: Vec::new(),
                fresh: 0,
            }
        }

        /// The expressions asserted so far.
        pub fn assertions(&self) -> &[Expression] {
            &self.eqns
        }

        /// Assert 1-bit expressions as formulas.
        pub fn assert(&mut self, conds: &[Expression]) -> Result<()> {
            for e in conds {
                if e.size() != 1 {
                    bail!(ErrorKind::MalformedExpression(format!(
                        "assertion is {} bits wide",
                        e.size()
                    )));
                }
                for l in e.locations() {
                    if !self.locs.contains(&l) {
                        self.locs.push(l);
                    }
                }
                let b = {
                    let mut lower = Lowerer {
                        context: self.context,
                        session: Some(&self.solver),
                        fresh: &mut self.fresh,
                    };
                    lower.boolean(e)?
                };
                self.solver.assert(&b);
                self.eqns.push(e.clone());
            }
            Ok(())
        }

        /// Check satisfiability of the asserted formulas.
        pub fn check(&self) -> Sat {
            debug!("solver check over {} assertions", self.eqns.len());
            match self.solver.check() {
                SatResult::Sat => Sat::Sat,
                SatResult::Unsat => Sat::Unsat,
                SatResult::Unknown => Sat::Unknown,
            }
        }

        /// A satisfying model, if one exists.
        pub fn get_model(&self) -> Option<z3::Model<'ctx>> {
            match self.check() {
                Sat::Sat => self.solver.get_model(),
                _ => None,
            }
        }

        /// Lift a satisfying model into a state of concrete bindings.
        ///
        /// Register locations bind before memory locations, so memory
        /// lifting sees fully resolved address bindings. A location whose
        /// model value is not a concrete integer is skipped rather than
        /// failing the whole lift.
        pub fn get_mapper(&mut self) -> Result<Option<State>> {
            let model = match self.get_model() {
                Some(model) => model,
                None => return Ok(None),
            };
            let mut state = State::default();
            let (regs, mems): (Vec<Expression>, Vec<Expression>) = self
                .locs
                .clone()
                .into_iter()
                .partition(|l| !matches!(l, Expression::Mem { .. }));
            for loc in regs.into_iter().chain(mems) {
                let size = loc.size();
                if size > 64 || matches!(loc, Expression::Lab { .. }) {
                    continue;
                }
                let formula = {
                    let mut lower = Lowerer {
                        context: self.context,
                        session: None,
                        fresh: &mut self.fresh,
                    };
                    lower.bv(&loc)?
                };
                let value = match model.eval(&formula, false).and_then(|v| v.as_u64()) {
                    Some(value) => value,
                    None => continue,
                };
                state.write(&loc, il::cst(value, size))?;
            }
            Ok(Some(state))
        }
    }

    /// Decide a test expression against a state's path conditions.
    ///
    /// The test evaluates under the state, then (conds ∧ test) and
    /// (conds ∧ ¬test) are checked independently. A test implied by the
    /// conditions folds to the true constant, a refuted test to false;
    /// anything genuinely undecided stays symbolic. Contradictory
    /// conditions are logged and leave the test unfolded. A ternary select
    /// folds to a branch when its condition decides.
    pub fn verify(test: &Expression, state: &State) -> Result<Expression> {
        if let Expression::Tst { cond, then, else_ } = test {
            let cond = verify(cond, state)?;
            return il::tst(cond, (**then).clone(), (**else_).clone());
        }
        if test.size() != 1 {
            bail!(ErrorKind::MalformedExpression(format!(
                "test is {} bits wide",
                test.size()
            )));
        }
        let t = test.eval(state)?.simplify();

        let config = Config::new();
        let context = Context::new(&config);
        let solver = Tactic::new(&context, "simplify")
            .and_then(&Tactic::new(&context, "elim-term-ite"))
            .and_then(&Tactic::new(&context, "solve-eqs"))
            .and_then(&Tactic::new(&context, "smt"))
            .try_for(Duration::from_millis(VERIFY_TIMEOUT_MS))
            .solver();
        let mut fresh = 0;
        let zt = {
            let mut lower = Lowerer {
                context: &context,
                session: Some(&solver),
                fresh: &mut fresh,
            };
            let zt = lower.boolean(&t)?;
            for c in state.conds() {
                let zc = lower.boolean(c)?;
                solver.assert(&zc);
            }
            zt
        };

        solver.push();
        solver.assert(&zt);
        let holds = solver.check();
        solver.pop(1);
        solver.assert(&zt.not());
        let fails = solver.check();

        Ok(match (holds, fails) {
            (SatResult::Sat, SatResult::Unsat) => il::bit1(),
            (SatResult::Unsat, SatResult::Sat) => il::bit0(),
            (SatResult::Unsat, SatResult::Unsat) => {
                warn!("path conditions are contradictory while deciding {}", t);
                t
            }
            _ => t,
        })
    }

    /// One lowering pass: a translation context carrying the session
    /// solver (for disjunction constraints) and the fresh-name counter.
    struct Lowerer<'a, 'ctx> {
        context: &'ctx Context,
        session: Option<&'a z3::Solver<'ctx>>,
        fresh: &'a mut usize,
    }

    impl<'a, 'ctx> Lowerer<'a, 'ctx> {
        fn fresh_bv(&mut self, prefix: &str, size: u32) -> BV<'ctx> {
            let n = *self.fresh;
            *self.fresh += 1;
            BV::new_const(self.context, format!("{}{}", prefix, n), size)
        }

        fn bool_to_bv(&self, b: Bool<'ctx>) -> BV<'ctx> {
            b.ite(
                &BV::from_u64(self.context, 1, 1),
                &BV::from_u64(self.context, 0, 1),
            )
        }

        fn boolean(&mut self, e: &Expression) -> Result<Bool<'ctx>> {
            let b = self.bv(e)?;
            Ok(b._eq(&BV::from_u64(self.context, 1, 1)))
        }

        fn bv(&mut self, e: &Expression) -> Result<BV<'ctx>> {
            Ok(match e {
                Expression::Top { size } | Expression::VecW { size } => {
                    self.fresh_bv("_top", *size as u32)
                }
                Expression::Cst { value, size } => {
                    BV::from_u64(self.context, *value, *size as u32)
                }
                Expression::Cfp { bits, size } => BV::from_u64(self.context, *bits, *size as u32),
                Expression::Reg { name, size, .. } | Expression::Lab { name, size } => {
                    BV::new_const(self.context, name.clone(), *size as u32)
                }
                Expression::Comp { parts } => {
                    // most significant part first
                    let mut acc: Option<BV<'ctx>> = None;
                    for p in parts.iter().rev() {
                        let b = self.bv(p)?;
                        acc = Some(match acc {
                            Some(a) => a.concat(&b),
                            None => b,
                        });
                    }
                    match acc {
                        Some(b) => b,
                        None => bail!(ErrorKind::MalformedExpression(
                            "empty concatenation".to_string()
                        )),
                    }
                }
                Expression::Slc {
                    base, pos, size, ..
                } => self
                    .bv(base)?
                    .extract((pos + size - 1) as u32, *pos as u32),
                Expression::Ptr { base, disp } => {
                    let b = self.bv(base)?;
                    if *disp == 0 {
                        b
                    } else {
                        let size = b.get_size();
                        b.bvadd(&BV::from_i64(self.context, *disp, size))
                    }
                }
                Expression::Mem {
                    addr, size, endian, ..
                } => {
                    let asize = addr.size() as u32;
                    let array = Array::new_const(
                        self.context,
                        "M",
                        &Sort::bitvector(self.context, asize),
                        &Sort::bitvector(self.context, 8),
                    );
                    let p = self.bv(addr)?;
                    let mut bytes = Vec::with_capacity(size / 8);
                    for i in 0..size / 8 {
                        let idx = p.bvadd(&BV::from_u64(self.context, i as u64, asize));
                        let byte = array
                            .select(&idx)
                            .as_bv()
                            .ok_or("memory byte select is not a bitvector")?;
                        bytes.push(byte);
                    }
                    if *endian == Endian::Little {
                        bytes.reverse();
                    }
                    let mut it = bytes.into_iter();
                    let acc = match it.next() {
                        Some(b) => b,
                        None => bail!(ErrorKind::MalformedExpression(
                            "memory read of zero bytes".to_string()
                        )),
                    };
                    it.fold(acc, |acc, b| acc.concat(&b))
                }
                Expression::Tst { cond, then, else_ } => {
                    let c = self.boolean(cond)?;
                    let t = self.bv(then)?;
                    let e = self.bv(else_)?;
                    c.ite(&t, &e)
                }
                Expression::Op { op, lhs, rhs, sf } => self.binop(*op, lhs, rhs, *sf)?,
                Expression::Uop { op, rhs } => {
                    let r = self.bv(rhs)?;
                    match op {
                        Unop::Neg => r.bvneg(),
                        Unop::Not => r.bvnot(),
                    }
                }
                Expression::Vec { cands } => self.disjunction(e, cands)?,
            })
        }

        fn binop(
            &mut self,
            op: Binop,
            lhs: &Expression,
            rhs: &Expression,
            sf: bool,
        ) -> Result<BV<'ctx>> {
            let (l, r) = if op == Binop::Pow {
                // the result is twice the operand width
                let l = self.bv(lhs)?;
                let r = self.bv(rhs)?;
                if sf {
                    (
                        l.sign_ext(lhs.size() as u32),
                        r.sign_ext(rhs.size() as u32),
                    )
                } else {
                    (
                        l.zero_ext(lhs.size() as u32),
                        r.zero_ext(rhs.size() as u32),
                    )
                }
            } else {
                (self.bv(lhs)?, self.bv(rhs)?)
            };
            let (l, r) = {
                let (ln, rn) = (l.get_size(), r.get_size());
                if ln < rn {
                    (l.zero_ext(rn - ln), r)
                } else if rn < ln {
                    (l, r.zero_ext(ln - rn))
                } else {
                    (l, r)
                }
            };
            Ok(match op {
                Binop::Add => l.bvadd(&r),
                Binop::Sub => l.bvsub(&r),
                Binop::Mul | Binop::Pow => l.bvmul(&r),
                Binop::Div => {
                    if sf {
                        l.bvsdiv(&r)
                    } else {
                        l.bvudiv(&r)
                    }
                }
                Binop::Mod => {
                    if sf {
                        l.bvsrem(&r)
                    } else {
                        l.bvurem(&r)
                    }
                }
                Binop::And => l.bvand(&r),
                Binop::Or => l.bvor(&r),
                Binop::Xor => l.bvxor(&r),
                Binop::Shl => l.bvshl(&r),
                Binop::Shr => {
                    if sf {
                        l.bvashr(&r)
                    } else {
                        l.bvlshr(&r)
                    }
                }
                Binop::Ror => l.bvrotr(&r),
                Binop::Rol => l.bvrotl(&r),
                Binop::Eq => self.bool_to_bv(l._eq(&r)),
                Binop::Ne => self.bool_to_bv(l._eq(&r).not()),
                Binop::Lt => self.bool_to_bv(if sf { l.bvslt(&r) } else { l.bvult(&r) }),
                Binop::Le => self.bool_to_bv(if sf { l.bvsle(&r) } else { l.bvule(&r) }),
                Binop::Gt => self.bool_to_bv(if sf { l.bvsgt(&r) } else { l.bvugt(&r) }),
                Binop::Ge => self.bool_to_bv(if sf { l.bvsge(&r) } else { l.bvuge(&r) }),
            })
        }

        fn disjunction(&mut self, e: &Expression, cands: &[Expression]) -> Result<BV<'ctx>> {
            let size = e.size() as u32;
            match self.session {
                Some(solver) => {
                    // a fresh variable constrained to equal one candidate
                    let var = self.fresh_bv("_var", size);
                    let mut eqs = Vec::with_capacity(cands.len());
                    for c in cands {
                        let b = self.bv(c)?;
                        let b = if b.get_size() < size {
                            b.zero_ext(size - b.get_size())
                        } else {
                            b
                        };
                        eqs.push(var._eq(&b));
                    }
                    let refs: Vec<&Bool<'ctx>> = eqs.iter().collect();
                    solver.assert(&Bool::or(self.context, &refs));
                    Ok(var)
                }
                None => {
                    if cands.iter().all(|c| c.size() == 1) {
                        let mut bools = Vec::with_capacity(cands.len());
                        for c in cands {
                            bools.push(self.boolean(c)?);
                        }
                        let refs: Vec<&Bool<'ctx>> = bools.iter().collect();
                        Ok(self.bool_to_bv(Bool::or(self.context, &refs)))
                    } else {
                        Ok(self.fresh_bv("_top", size))
                    }
                }
            }
        }
    }

}
