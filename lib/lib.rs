//! Grackle: the symbolic core of a binary analysis toolkit.
//!
//! Grackle computes the effect of machine instructions over an abstract
//! machine state whose registers and memory hold symbolic expressions
//! instead of concrete bytes. Decoders drive a [`state::State`] through the
//! [`instruction::Instruction`] contract, loaders populate the
//! [`memory::MemoryModel`] with concrete byte ranges, and reasoning queries
//! are discharged through the [`smt`] bridge when solving capability is
//! compiled in.
extern crate byteorder;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod il;
pub mod instruction;
pub mod memory;
pub mod smt;
pub mod state;

pub mod error {
    error_chain! {
        types {
            Error, ErrorKind, ResultExt, Result;
        }

        errors {
            MalformedExpression(reason: String) {
                description("Malformed expression")
                display("Malformed expression: {}", reason)
            }
            UnmappedAccess(address: u64) {
                description("Access to unmapped memory")
                display("Access to unmapped memory at 0x{:x}", address)
            }
            InvalidWrite(reason: String) {
                description("Write to an invalid location")
                display("Write to an invalid location: {}", reason)
            }
            SolverUnavailable {
                description("No solving capability")
                display("No solving capability")
            }
        }
    }
}
