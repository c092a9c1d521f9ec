//! Debugger hook interface
//!
//! The engine consults an installed debugger before dispatching an
//! instruction whenever the breakpoint predicate matches or step mode is
//! armed. Only the interface lives here; any actual debugger is an
//! embedding concern.

use crate::bytecode::Instruction;
use crate::runtime::process::ProcessContext;

/// What the debugger wants the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    /// Resume normal execution
    Continue,
    /// Break again before the next instruction
    Step,
    /// Break again once the current call returns
    StepOver,
    /// Terminate the process being debugged
    Abort,
}

/// Engine-side debugger hook.
pub trait Debugger: Send {
    /// Whether to break before this instruction.
    fn should_break(&self, process: &ProcessContext, instruction: &Instruction) -> bool;

    /// Called at a break; the returned action drives stepping.
    fn on_instruction(
        &mut self,
        process: &ProcessContext,
        instruction: &Instruction,
    ) -> DebugAction;
}

/// Stepping state kept by the engine between instructions.
#[derive(Debug, Default)]
pub struct DebugState {
    /// Break before the very next instruction
    pub step_armed: bool,
    /// Break once the call stack shrinks back to this depth
    pub step_over_depth: Option<usize>,
}
