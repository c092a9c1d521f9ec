//! Error types for Krill

use thiserror::Error;
use crate::types::Pid;

/// Main error type for Krill operations
#[derive(Error, Debug)]
pub enum VmError {
    /// Instruction execution errors
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Supervision errors
    #[error("Supervision error: {0}")]
    Supervision(#[from] SupervisionError),

    /// Process not found
    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    /// Maximum processes reached
    #[error("Maximum number of processes ({0}) reached")]
    MaxProcesses(usize),

    /// Iteration limit reached before the system went idle
    #[error("Iteration limit ({0}) reached")]
    IterationLimit(usize),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

/// Errors raised while executing a single instruction.
///
/// Every variant here is catchable by the process's exception machinery:
/// with a handler frame installed the process unwinds to its catch address,
/// otherwise it dies with reason `Exception` and the fault handler fans out.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    /// General runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Malformed instruction or operand
    #[error("Invalid instruction: {0}")]
    InvalidInstruction(String),

    /// Message target could not be resolved to a process address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Jump target outside the instruction list
    #[error("Invalid jump target {target} (code length {len})")]
    InvalidJumpTarget { target: i64, len: usize },

    /// Operand types incompatible with the operation
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Load of an unset local, global or upvalue
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    /// CALL target absent from the subroutine table
    #[error("Undefined subroutine: {0}")]
    UndefinedSubroutine(String),

    /// Built-in function key absent from the registry
    #[error("Undefined function: {0}")]
    UndefinedFunction(String),

    /// Domain error on an otherwise well-typed value
    #[error("Value error: {0}")]
    Value(String),

    /// Data stack underflow, tagged with the offending opcode
    #[error("Stack underflow in {0}")]
    StackUnderflow(String),

    /// Data stack grew past the configured maximum
    #[error("Stack overflow (limit {0})")]
    StackOverflow(usize),

    /// Division or modulo by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Index outside a collection's bounds
    #[error("Index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i64, len: usize },

    /// Failed numeric or type conversion
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Malformed binary or string data
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Target mailbox full under the `fail` policy
    #[error("Mailbox overflow for process {0}")]
    MailboxOverflow(Pid),

    /// Wait-for cycle detected between waiting processes
    #[error("Deadlock: {0}")]
    Deadlock(String),

    /// Unexpected host-level failure routed through the exception path
    #[error("Unhandled error: {0}")]
    Unhandled(String),
}

impl ExecError {
    /// Short class name used in exception values and crash dumps.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Runtime(_) => "Runtime",
            ExecError::InvalidInstruction(_) => "InvalidInstruction",
            ExecError::InvalidAddress(_) => "InvalidAddress",
            ExecError::InvalidJumpTarget { .. } => "InvalidJumpTarget",
            ExecError::TypeMismatch(_) => "TypeMismatch",
            ExecError::UndefinedVariable(_) => "UndefinedVariable",
            ExecError::UndefinedSubroutine(_) => "UndefinedSubroutine",
            ExecError::UndefinedFunction(_) => "UndefinedFunction",
            ExecError::Value(_) => "Value",
            ExecError::StackUnderflow(_) => "StackUnderflow",
            ExecError::StackOverflow(_) => "StackOverflow",
            ExecError::DivisionByZero => "DivisionByZero",
            ExecError::IndexOutOfBounds { .. } => "IndexOutOfBounds",
            ExecError::Conversion(_) => "Conversion",
            ExecError::Encoding(_) => "Encoding",
            ExecError::MailboxOverflow(_) => "MailboxOverflow",
            ExecError::Deadlock(_) => "Deadlock",
            ExecError::Unhandled(_) => "Unhandled",
        }
    }
}

/// Scheduler-specific errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Process not present in any queue
    #[error("Process {0} is not scheduled")]
    NotScheduled(Pid),

    /// A process in a queue no longer exists in the process table
    #[error("Stale queue entry for process {0}")]
    StaleEntry(Pid),
}

/// Supervision tree errors
#[derive(Error, Debug)]
pub enum SupervisionError {
    /// Unknown child id
    #[error("Unknown child: {0}")]
    UnknownChild(String),

    /// Child spec could not be parsed from a value
    #[error("Invalid child spec: {0}")]
    InvalidChildSpec(String),

    /// Restart limit exceeded within the restart window
    #[error("Restart limit exceeded for child {0}")]
    RestartLimitExceeded(String),

    /// Process is not registered as a supervisor
    #[error("Process {0} is not a supervisor")]
    NotASupervisor(Pid),
}

/// Result type for Krill operations
pub type VmResult<T> = Result<T, VmError>;

/// Result type for instruction execution
pub type ExecResult<T> = Result<T, ExecError>;
