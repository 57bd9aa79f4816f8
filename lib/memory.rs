//! The symbolic memory model.
//!
//! Memory is an ordered log of symbolic writes over a concrete backing
//! image. Reads resolve against the log newest-write-first; writes whose
//! addresses cannot be proven disjoint from the read remain attached to
//! the result as candidate aliases instead of being guessed at.

use crate::error::*;
use crate::il::{self, Endian, Expression};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::cmp;

/// How reads treat writes under distinct symbolic bases.
///
/// Under `Aliasing`, any write whose address cannot be proven disjoint
/// from the read is kept as a candidate alias. Under `NoAliasing`,
/// distinct symbolic bases are assumed disjoint and only same-base writes
/// are considered. The policy is chosen at construction and threaded
/// through every operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AliasPolicy {
    Aliasing,
    NoAliasing,
}

/// One recorded store: a pointer expression and the value written there.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub address: Expression,
    pub value: Expression,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

/// A sparse store keyed by symbolic addresses.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryModel {
    writes: Vec<MemoryWrite>,
    regions: Vec<Region>,
    endian: Endian,
    policy: AliasPolicy,
}

enum Relation {
    Disjoint,
    /// Same address frame; the value is the write's offset minus the
    /// read's offset, in bytes.
    Overlap(i64),
    MayAlias,
}

#[derive(Clone)]
enum Byte {
    Unresolved,
    Resolved(Expression),
    /// Possibly written by an aliasing store; candidate chain still open.
    Open,
    /// Possibly aliased, but a same-frame write terminates the chain.
    Closed,
}

impl MemoryModel {
    pub fn new(endian: Endian, policy: AliasPolicy) -> MemoryModel {
        MemoryModel {
            writes: Vec::new(),
            regions: Vec::new(),
            endian,
            policy,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn policy(&self) -> AliasPolicy {
        self.policy
    }

    /// The write log, oldest first.
    pub fn writes(&self) -> &[MemoryWrite] {
        &self.writes
    }

    pub(crate) fn truncate_writes(&mut self, len: usize) {
        self.writes.truncate(len);
    }

    /// Install a concrete backing region, e.g. a loaded ROM image.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push(Region { base, bytes });
    }

    /// Record a store of `value` at the given address expression.
    pub fn write(&mut self, address: &Expression, value: Expression) -> Result<()> {
        if value.size() == 0 || value.size() % 8 != 0 {
            bail!(ErrorKind::InvalidWrite(format!(
                "store of {} bits is not a whole number of bytes",
                value.size()
            )));
        }
        self.writes.push(MemoryWrite {
            address: il::ptr(address.clone(), 0),
            value,
        });
        Ok(())
    }

    /// Read `length` bytes at the given address expression.
    ///
    /// If every byte resolves through same-frame writes (or the backing
    /// image), the result is a concrete or composite expression. If any
    /// byte may have been touched by an aliasing write, the result is a
    /// `mem` expression carrying the candidate writes, newest first.
    pub fn read(&self, address: &Expression, length: usize) -> Result<Expression> {
        if length == 0 {
            bail!(ErrorKind::MalformedExpression(
                "read of zero bytes".to_string()
            ));
        }
        let addr = il::ptr(address.clone(), 0);
        let (rbase, rdisp) = parts(&addr);

        let mut bytes = vec![Byte::Unresolved; length];
        let mut mods: Vec<(Expression, Expression)> = Vec::new();

        for w in self.writes.iter().rev() {
            if !bytes
                .iter()
                .any(|b| matches!(b, Byte::Unresolved | Byte::Open))
            {
                break;
            }
            let (wbase, wdisp) = parts(&w.address);
            let wlen = w.value.size() / 8;
            match relate(rbase, rdisp, length, wbase, wdisp, wlen, self.policy) {
                Relation::Disjoint => {}
                Relation::MayAlias => {
                    let mut hit = false;
                    for b in bytes.iter_mut() {
                        match b {
                            Byte::Unresolved => {
                                *b = Byte::Open;
                                hit = true;
                            }
                            Byte::Open => {
                                hit = true;
                            }
                            _ => {}
                        }
                    }
                    if hit {
                        mods.push((w.address.clone(), w.value.clone()));
                    }
                }
                Relation::Overlap(delta) => {
                    let lo = cmp::max(0, delta);
                    let hi = cmp::min(length as i64, delta + wlen as i64);
                    let mut hit = false;
                    for i in lo..hi {
                        let j = (i - delta) as usize;
                        match bytes[i as usize] {
                            Byte::Unresolved => {
                                bytes[i as usize] =
                                    Byte::Resolved(byte_of(&w.value, j, self.endian));
                                hit = true;
                            }
                            Byte::Open => {
                                bytes[i as usize] = Byte::Closed;
                                hit = true;
                            }
                            _ => {}
                        }
                    }
                    if hit {
                        mods.push((w.address.clone(), w.value.clone()));
                    }
                }
            }
        }

        if bytes
            .iter()
            .any(|b| matches!(b, Byte::Open | Byte::Closed))
        {
            debug!(
                "ambiguous read of {} bytes at {} resolves through {} candidate writes",
                length,
                addr,
                mods.len()
            );
            return Ok(Expression::Mem {
                addr: Box::new(addr),
                size: length * 8,
                endian: self.endian,
                mods,
            });
        }

        let mut items: Vec<Expression> = Vec::new();
        let mut i = 0;
        while i < length {
            if let Byte::Resolved(e) = &bytes[i] {
                items.push(e.clone());
                i += 1;
            } else {
                let start = i;
                while i < length && matches!(bytes[i], Byte::Unresolved) {
                    i += 1;
                }
                items.push(self.initial(rbase, rdisp + start as i64, i - start)?);
            }
        }
        if self.endian == Endian::Big {
            items.reverse();
        }
        Ok(il::comp(items))
    }

    /// The value of memory untouched by the write log.
    fn initial(&self, base: &Expression, disp: i64, length: usize) -> Result<Expression> {
        if let Some(b) = base.as_cst() {
            if !self.regions.is_empty() {
                return self.backed(b.wrapping_add(disp as u64), length);
            }
        }
        il::mem_endian(il::ptr(base.clone(), disp), length * 8, self.endian)
    }

    fn backed(&self, address: u64, length: usize) -> Result<Expression> {
        let mut buf = vec![0u8; length];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.backed_byte(address + i as u64)?;
        }
        let mut chunks = Vec::new();
        for c in buf.chunks(8) {
            let v = match self.endian {
                Endian::Little => LittleEndian::read_uint(c, c.len()),
                Endian::Big => BigEndian::read_uint(c, c.len()),
            };
            chunks.push(il::cst(v, c.len() * 8));
        }
        if self.endian == Endian::Big {
            chunks.reverse();
        }
        Ok(il::comp(chunks))
    }

    /// A copy of this store with named free variables replaced in every
    /// recorded write.
    pub(crate) fn substitute(
        &self,
        bindings: &std::collections::BTreeMap<String, Expression>,
    ) -> MemoryModel {
        MemoryModel {
            writes: self
                .writes
                .iter()
                .map(|w| MemoryWrite {
                    address: il::ptr(w.address.substitute(bindings), 0),
                    value: w.value.substitute(bindings),
                })
                .collect(),
            regions: self.regions.clone(),
            endian: self.endian,
            policy: self.policy,
        }
    }

    fn backed_byte(&self, address: u64) -> Result<u8> {
        for r in &self.regions {
            let end = r.base.wrapping_add(r.bytes.len() as u64);
            if address >= r.base && address < end {
                return Ok(r.bytes[(address - r.base) as usize]);
            }
        }
        Err(ErrorKind::UnmappedAccess(address).into())
    }
}

fn parts(p: &Expression) -> (&Expression, i64) {
    match p {
        Expression::Ptr { base, disp } => (base, *disp),
        p => (p, 0),
    }
}

fn byte_of(value: &Expression, j: usize, endian: Endian) -> Expression {
    match endian {
        Endian::Little => value.extract(8 * j, 8),
        Endian::Big => value.extract(value.size() - 8 * (j + 1), 8),
    }
}

/// The conservative disjointness rule: concrete ranges compare
/// numerically, equal symbolic bases compare by displacement, and
/// everything else possibly aliases unless the policy says otherwise.
fn relate(
    rbase: &Expression,
    rdisp: i64,
    rlen: usize,
    wbase: &Expression,
    wdisp: i64,
    wlen: usize,
    policy: AliasPolicy,
) -> Relation {
    if let (Some(rb), Some(wb)) = (rbase.as_cst(), wbase.as_cst()) {
        let ra = rb.wrapping_add(rdisp as u64);
        let wa = wb.wrapping_add(wdisp as u64);
        let delta = wa.wrapping_sub(ra) as i64;
        return if delta < rlen as i64 && delta > -(wlen as i64) {
            Relation::Overlap(delta)
        } else {
            Relation::Disjoint
        };
    }
    if rbase == wbase {
        let delta = wdisp - rdisp;
        return if delta < rlen as i64 && delta > -(wlen as i64) {
            Relation::Overlap(delta)
        } else {
            Relation::Disjoint
        };
    }
    match policy {
        AliasPolicy::NoAliasing => Relation::Disjoint,
        AliasPolicy::Aliasing => Relation::MayAlias,
    }
}
