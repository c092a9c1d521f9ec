//! Krill runtime - isolated processes, cooperative scheduling and
//! supervision
//!
//! The runtime composes the process table, the reduction scheduler, the
//! link and name registries, the timer manager, the fault handler and the
//! instruction executor under the engine's event loop.

pub mod builtins;
pub mod engine;
pub mod executor;
pub mod fault;
pub mod links;
pub mod mailbox;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod timer;

pub use builtins::BuiltinRegistry;
pub use engine::Engine;
pub use executor::{Executor, OpcodeHandler};
pub use fault::{CrashDump, CrashDumpStore, FaultHandler};
pub use links::LinkRegistry;
pub use mailbox::{Acknowledgment, AckStatus, Mailbox, Message};
pub use process::{ProcessContext, ProcessHandle, ProcessTable, WaitKind};
pub use registry::ProcessRegistry;
pub use scheduler::Scheduler;
pub use supervisor::{
    ChildSpec, ChildType, RestartPolicy, RestartStrategy, ShutdownPolicy, Supervisor,
    SupervisorRegistry,
};
pub use timer::{TimerEntry, TimerManager};
