//! The symbolic machine state.
//!
//! A `State` binds register names and memory locations to expressions and
//! carries the path conditions accumulated along one execution path.
//! Instruction semantics mutate a state in place through indexed writes;
//! `compose` and `merge` build new states out of existing ones and never
//! mutate their inputs.

use crate::error::*;
use crate::il::{self, Binop, Endian, Expression};
use crate::instruction::Instruction;
use crate::memory::{AliasPolicy, MemoryModel};
use std::collections::{BTreeMap, BTreeSet};

/// A symbolic machine state.
///
/// Unwritten locations evaluate to free register leaves, so reads before
/// writes stay symbolic instead of failing. The serialized form carries
/// exactly the register bindings, the memory write log, and the path
/// conditions.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct State {
    regs: BTreeMap<String, Expression>,
    memory: MemoryModel,
    conds: Vec<Expression>,
}

impl Default for State {
    fn default() -> State {
        State::new(Endian::Little, AliasPolicy::Aliasing)
    }
}

impl State {
    pub fn new(endian: Endian, policy: AliasPolicy) -> State {
        State {
            regs: BTreeMap::new(),
            memory: MemoryModel::new(endian, policy),
            conds: Vec::new(),
        }
    }

    /// Retrieve the memory model of this state.
    pub fn memory(&self) -> &MemoryModel {
        &self.memory
    }

    /// Retrieve a mutable reference to the memory model of this state.
    pub fn memory_mut(&mut self) -> &mut MemoryModel {
        &mut self.memory
    }

    /// The binding of the named register, if one was written.
    pub fn register(&self, name: &str) -> Option<&Expression> {
        self.regs.get(name)
    }

    /// The names of the registers bound in this state.
    pub fn registers(&self) -> Vec<String> {
        self.regs.keys().cloned().collect()
    }

    /// The path conditions of this state.
    pub fn conds(&self) -> &[Expression] {
        &self.conds
    }

    /// Append a path condition without solving or substituting.
    pub fn add_cond(&mut self, cond: Expression) -> Result<()> {
        if cond.size() != 1 {
            bail!(ErrorKind::MalformedExpression(format!(
                "path condition is {} bits wide",
                cond.size()
            )));
        }
        self.conds.push(cond);
        Ok(())
    }

    /// Print debug information for this `State`.
    pub fn debug(&self) {
        println!("registers");
        for (name, value) in &self.regs {
            println!("{} = {}", name, value);
        }
        println!("memory writes");
        for w in self.memory.writes() {
            println!("{} <- {}", w.address, w.value);
        }
        println!("conds");
        for c in &self.conds {
            println!("{}", c);
        }
    }

    /// Resolve an expression against this state's current bindings.
    pub fn eval(&self, e: &Expression) -> Result<Expression> {
        e.eval(self)
    }

    /// Indexed write: evaluate `value` under the current bindings, then
    /// bind the location. Locations are registers, slices of registers,
    /// and memory reads/pointers.
    pub fn write(&mut self, loc: &Expression, value: Expression) -> Result<()> {
        let value = value.eval(self)?;
        match loc {
            Expression::Reg { name, size, .. } => {
                if value.size() != *size {
                    bail!(ErrorKind::InvalidWrite(format!(
                        "{} is {} bits wide, value is {} bits wide",
                        name,
                        size,
                        value.size()
                    )));
                }
                self.regs.insert(name.clone(), value);
                Ok(())
            }
            Expression::Slc {
                base, pos, size, ..
            } => {
                let (name, width) = match &**base {
                    Expression::Reg { name, size, .. } => (name.clone(), *size),
                    e => bail!(ErrorKind::InvalidWrite(format!(
                        "cannot write through a slice of {}",
                        e
                    ))),
                };
                if value.size() != *size {
                    bail!(ErrorKind::InvalidWrite(format!(
                        "slice is {} bits wide, value is {} bits wide",
                        size,
                        value.size()
                    )));
                }
                let cur = self
                    .regs
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| il::reg(name.clone(), width));
                let mut parts = Vec::new();
                if *pos > 0 {
                    parts.push(cur.extract(0, *pos));
                }
                parts.push(value);
                if pos + size < width {
                    parts.push(cur.extract(pos + size, width - pos - size));
                }
                self.regs.insert(name, il::comp(parts));
                Ok(())
            }
            Expression::Mem { addr, size, .. } => {
                if value.size() != *size {
                    bail!(ErrorKind::InvalidWrite(format!(
                        "memory location is {} bits wide, value is {} bits wide",
                        size,
                        value.size()
                    )));
                }
                let addr = addr.eval(self)?;
                self.memory.write(&addr, value)
            }
            Expression::Ptr { .. } => {
                let addr = loc.eval(self)?;
                self.memory.write(&addr, value)
            }
            e => bail!(ErrorKind::InvalidWrite(format!("{} is not a location", e))),
        }
    }

    /// A new state with the named free variables replaced throughout all
    /// register bindings, memory writes, and conditions.
    pub fn substitute(&self, bindings: &[(&str, Expression)]) -> State {
        let map: BTreeMap<String, Expression> = bindings
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        State {
            regs: self
                .regs
                .iter()
                .map(|(name, value)| (name.clone(), value.substitute(&map)))
                .collect(),
            memory: self.memory.substitute(&map),
            conds: self.conds.iter().map(|c| c.substitute(&map)).collect(),
        }
    }

    /// A new state carrying the given conditions. Conditions equating a
    /// free register with another expression are also applied as
    /// substitutions, so implied bindings fold immediately.
    pub fn assume(&self, conds: &[Expression]) -> Result<State> {
        for c in conds {
            if c.size() != 1 {
                bail!(ErrorKind::MalformedExpression(format!(
                    "path condition is {} bits wide",
                    c.size()
                )));
            }
        }
        let mut bindings: Vec<(&str, Expression)> = Vec::new();
        for c in conds {
            if let Expression::Op {
                op: Binop::Eq,
                lhs,
                rhs,
                ..
            } = c
            {
                match (&**lhs, &**rhs) {
                    (Expression::Reg { name, .. }, value) => {
                        bindings.push((name, value.clone()));
                    }
                    (value, Expression::Reg { name, .. }) => {
                        bindings.push((name, value.clone()));
                    }
                    _ => {}
                }
            }
        }
        let mut out = self.substitute(&bindings);
        out.conds.extend(conds.iter().cloned());
        Ok(out)
    }

    /// Sequential composition: the state representing "run `prev`, then
    /// apply this state's effects on top".
    ///
    /// This state's bindings are resolved through `prev` before being
    /// applied. Under `NoAliasing` resolution is pure substitution with
    /// `prev`'s register bindings; under `Aliasing`, memory reads embedded
    /// in the bindings re-resolve against `prev`'s write log, which can be
    /// more precise when branches alias through memory.
    pub fn compose(&self, prev: &State) -> Result<State> {
        let bindings = prev.regs.clone();
        let mut out = prev.clone();
        for (name, value) in &self.regs {
            let value = self.resolve_through(value, prev, &bindings)?;
            out.regs.insert(name.clone(), value);
        }
        for w in self.memory.writes() {
            let address = self.resolve_through(&w.address, prev, &bindings)?;
            let value = self.resolve_through(&w.value, prev, &bindings)?;
            out.memory.write(&address, value)?;
        }
        for c in &self.conds {
            let c = self.resolve_through(c, prev, &bindings)?;
            out.conds.push(c);
        }
        Ok(out)
    }

    fn resolve_through(
        &self,
        e: &Expression,
        prev: &State,
        bindings: &BTreeMap<String, Expression>,
    ) -> Result<Expression> {
        match self.memory.policy() {
            AliasPolicy::NoAliasing => Ok(e.substitute(bindings)),
            AliasPolicy::Aliasing => e.eval(prev),
        }
    }

    /// Apply one instruction's semantics to this state.
    pub fn execute(&mut self, instruction: &dyn Instruction) -> Result<()> {
        instruction.execute(self)
    }
}

/// Path-sensitive join of states from divergent branches.
///
/// Locations bound identically across all inputs keep that binding; a
/// location with differing bindings becomes a disjunction of the distinct
/// candidate values, in input order. Conditions survive only if present on
/// every path.
pub fn merge(states: &[&State]) -> Result<State> {
    let first = match states.first() {
        Some(first) => *first,
        None => bail!("merging zero states"),
    };
    let mut out = first.clone();
    out.regs = BTreeMap::new();
    out.conds = Vec::new();

    let names: BTreeSet<String> = states
        .iter()
        .flat_map(|s| s.regs.keys().cloned())
        .collect();
    for name in names {
        let size = states
            .iter()
            .find_map(|s| s.regs.get(&name).map(|v| v.size()))
            .unwrap_or(0);
        let mut cands = Vec::new();
        for s in states {
            let v = s
                .regs
                .get(&name)
                .cloned()
                .unwrap_or_else(|| il::reg(name.clone(), size));
            cands.push(v);
        }
        out.regs.insert(name, il::vec(cands));
    }

    // shared write-log prefix survives untouched; divergent writes join
    // into disjunctions per address
    let mut prefix = first.memory.writes().len();
    for s in &states[1..] {
        let w = s.memory.writes();
        let mut i = 0;
        while i < prefix && i < w.len() && first.memory.writes()[i] == w[i] {
            i += 1;
        }
        prefix = i;
    }
    out.memory.truncate_writes(prefix);
    let mut seen: Vec<Expression> = Vec::new();
    for s in states {
        for w in &s.memory.writes()[prefix..] {
            if seen.contains(&w.address) {
                continue;
            }
            seen.push(w.address.clone());
            let length = w.value.size() / 8;
            let mut cands = Vec::new();
            for t in states {
                cands.push(t.memory.read(&w.address, length)?);
            }
            out.memory.write(&w.address, il::vec(cands))?;
        }
    }

    for c in first.conds() {
        if states[1..].iter().all(|s| s.conds.contains(c)) {
            out.conds.push(c.clone());
        }
    }
    Ok(out)
}

impl Expression {
    /// Resolve this expression against the given state.
    ///
    /// Register leaves are replaced by their bindings (a register that was
    /// never written stays itself), slices extract from the resolved base,
    /// and memory reads resolve through the state's memory model together
    /// with any writes the read carries. The result refers only to the
    /// state's free variables.
    pub fn eval(&self, state: &State) -> Result<Expression> {
        Ok(match self {
            Expression::Reg { name, .. } => match state.regs.get(name) {
                Some(value) => value.clone(),
                None => self.clone(),
            },
            Expression::Slc {
                base, pos, size, sf, ..
            } => {
                let e = base.eval(state)?.extract(*pos, *size);
                if *sf {
                    e.signed()
                } else {
                    e
                }
            }
            Expression::Comp { parts } => il::comp(
                parts
                    .iter()
                    .map(|p| p.eval(state))
                    .collect::<Result<Vec<Expression>>>()?,
            ),
            Expression::Ptr { base, disp } => il::ptr(base.eval(state)?, *disp),
            Expression::Mem {
                addr, size, mods, ..
            } => {
                let addr = addr.eval(state)?;
                if mods.is_empty() {
                    state.memory.read(&addr, size / 8)?
                } else {
                    // the carried writes overlay the state's own memory,
                    // oldest first
                    let mut scratch = state.clone();
                    for (a, v) in mods.iter().rev() {
                        let a = a.eval(state)?;
                        let v = v.eval(state)?;
                        scratch.memory.write(&a, v)?;
                    }
                    scratch.memory.read(&addr, size / 8)?
                }
            }
            Expression::Tst { cond, then, else_ } => il::simplify::ite(
                cond.eval(state)?,
                then.eval(state)?,
                else_.eval(state)?,
            ),
            Expression::Op { op, lhs, rhs, sf } => {
                il::simplify::binop_sf(*op, lhs.eval(state)?, rhs.eval(state)?, *sf)
            }
            Expression::Uop { op, rhs } => il::uoper(*op, rhs.eval(state)?),
            Expression::Vec { cands } => il::vec(
                cands
                    .iter()
                    .map(|c| c.eval(state))
                    .collect::<Result<Vec<Expression>>>()?,
            ),
            Expression::VecW { size } => il::top(*size),
            _ => self.clone(),
        })
    }
}
