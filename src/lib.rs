//! # Krill: a concurrent bytecode virtual machine
//!
//! Krill runs thousands of isolated lightweight processes over a
//! stack-based bytecode interpreter. Each process owns its code, data
//! stack, locals and mailbox; a reduction-based scheduler preempts
//! cooperatively at opcode boundaries, and links, monitors and
//! supervision trees propagate faults the way the BEAM does.

#![warn(clippy::all)]

pub mod bytecode;
pub mod debug;
pub mod error;
pub mod runtime;
pub mod types;

pub use bytecode::{Instruction, Lambda, Opcode, OpcodeFamily, Value};
pub use error::{ExecError, VmError, VmResult};
pub use runtime::{ChildSpec, Engine, Mailbox, Message, RestartStrategy};
pub use types::{
    EngineStats, ExitReason, MailboxPolicy, MonitorRef, Pid, Priority, ProcessState, VmConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create an engine with the default configuration.
pub fn new_engine() -> Engine {
    Engine::new()
}

/// Create an engine with a custom configuration.
pub fn new_engine_with_config(config: VmConfig) -> Engine {
    Engine::with_config(config)
}
