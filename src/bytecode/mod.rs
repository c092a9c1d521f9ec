//! Krill bytecode - tagged values and the opcode set
//!
//! Each process owns its instruction list outright; code is addressed by
//! zero-based index within that list, so processes stay isolated rather
//! than sharing a text segment.

pub mod instruction;
pub mod value;

pub use instruction::{Instruction, Opcode, OpcodeFamily};
pub use value::{Lambda, Value};
