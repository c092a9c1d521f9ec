//! Opcode enumeration and the instruction container

use serde::{Deserialize, Serialize};

use crate::bytecode::value::Value;

/// Opcode families, used for dispatch grouping and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpcodeFamily {
    /// Data stack shuffling
    Stack,
    /// Literal pushes
    Push,
    /// Arithmetic
    Arithmetic,
    /// Bitwise operations
    Bitwise,
    /// Logical operations
    Logical,
    /// Comparisons
    Comparison,
    /// Locals, globals and upvalues
    Variable,
    /// Jumps, calls and returns
    Control,
    /// Closure creation and invocation
    Lambda,
    /// Process lifecycle and registry
    Process,
    /// Mailbox traffic
    Message,
    /// Supervision tree management
    Supervisor,
    /// Exception handling
    Exception,
}

/// The full opcode set.
///
/// Operands live in [`Instruction::operand`], so opcodes themselves are
/// plain tags and can key the custom-handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // Stack
    /// Discard the top of stack
    Pop,
    /// Duplicate the top of stack
    Dup,
    /// Duplicate the top two items
    Dup2,
    /// Swap the top two items
    Swap,
    /// Rotate the top three items upward
    RotUp,
    /// Rotate the top three items downward
    RotDown,
    /// Drop the item below the top
    Nip,
    /// Copy the top below the second item
    Tuck,
    /// Push the current stack depth
    Depth,
    /// Copy the item at depth n onto the top
    Pick,
    /// Move the item at depth n onto the top
    Roll,

    // Push literals
    /// Push null
    PushNull,
    /// Push true
    PushTrue,
    /// Push false
    PushFalse,
    /// Push a signed integer operand
    PushInt,
    /// Push an unsigned integer operand
    PushUint,
    /// Push a float operand
    PushFloat,
    /// Push a string operand
    PushString,
    /// Push a symbol operand (string operands are interned)
    PushSymbol,
    /// Push an arbitrary operand value
    PushCustom,
    /// Push a nested code block
    PushInstructions,

    // Arithmetic
    /// Add
    Add,
    /// Subtract
    Sub,
    /// Multiply
    Mul,
    /// Divide
    Div,
    /// Modulo
    Mod,
    /// Negate
    Neg,
    /// Absolute value
    Abs,
    /// Increment by one
    Inc,
    /// Decrement by one
    Dec,
    /// Raise to a power
    Pow,
    /// Round toward negative infinity
    Floor,
    /// Round toward positive infinity
    Ceil,
    /// Round to nearest
    Round,
    /// Minimum of two values
    Min,
    /// Maximum of two values
    Max,

    // Bitwise
    /// Bitwise and
    BitAnd,
    /// Bitwise or
    BitOr,
    /// Bitwise xor
    BitXor,
    /// Bitwise not
    BitNot,
    /// Shift left
    Shl,
    /// Arithmetic shift right
    Shr,
    /// Logical shift right
    ShrUnsigned,

    // Logical
    /// Truthiness and
    And,
    /// Truthiness or
    Or,
    /// Truthiness not
    Not,
    /// Truthiness xor
    Xor,

    // Comparison
    /// Structural equality
    Eq,
    /// Structural inequality
    Neq,
    /// Identity equality
    Id,
    /// Identity inequality
    Nid,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Top of stack is null
    IsNull,
    /// Top of stack is not null
    IsNotNull,

    // Variables
    /// Load a frame-relative local slot
    LoadLocal,
    /// Store to a frame-relative local slot
    StoreLocal,
    /// Load a global by name
    LoadGlobal,
    /// Store a global by name
    StoreGlobal,
    /// Load a closure upvalue by index
    LoadUpvalue,
    /// Store a closure upvalue by index
    StoreUpvalue,

    // Control
    /// Absolute jump
    Jump,
    /// Relative jump forward
    JumpForward,
    /// Relative jump backward
    JumpBackward,
    /// Jump if top is truthy, consuming it
    JumpIfTrue,
    /// Jump if top is falsy, consuming it
    JumpIfFalse,
    /// Jump if top is truthy, keeping it
    JumpIfTruePeek,
    /// Jump if top is falsy, keeping it
    JumpIfFalsePeek,
    /// Call a named subroutine
    Call,
    /// Call a subroutine whose name is popped from the stack
    CallDynamic,
    /// Call a popped code block or lambda
    CallIndirect,
    /// Call a registered built-in function
    CallBuiltin,
    /// Return from a call
    Return,
    /// Return, leaving the top of stack for the caller
    ReturnValue,
    /// Terminate the process normally
    Halt,
    /// Do nothing
    Nop,

    // Lambdas
    /// Create a closure from a body and capture names
    LambdaCreate,
    /// Invoke a lambda inline with n arguments
    LambdaInvoke,
    /// Partially apply a lambda to n arguments
    LambdaBind,

    // Processes
    /// Spawn a process from a code block or lambda
    Spawn,
    /// Spawn and link atomically
    SpawnLinked,
    /// Spawn and monitor atomically
    SpawnMonitored,
    /// Push the current process address
    SelfPid,
    /// Terminate the current process with a popped reason
    Exit,
    /// Send an exit signal to another process
    ExitRemote,
    /// Untrappable kill of another process
    Kill,
    /// Park the current process for a duration
    Sleep,
    /// Re-enqueue the current process at the back of its queue
    Yield,
    /// Link to another process
    Link,
    /// Remove a link
    Unlink,
    /// Monitor another process
    Monitor,
    /// Remove a monitor by reference
    Demonitor,
    /// Convert incoming exit signals to messages
    TrapExitEnable,
    /// Stop trapping exit signals
    TrapExitDisable,
    /// Whether a process address is alive
    IsAlive,
    /// Snapshot of a process's state
    GetInfo,
    /// Register a name for the current process
    Register,
    /// Remove a name registration
    Unregister,
    /// Look up a registered name
    Whereis,
    /// Set a process flag
    SetFlag,
    /// Read a process flag
    GetFlag,

    // Messages
    /// Send a value to a process or registered name
    Send,
    /// Schedule a delayed send, pushing a timer reference
    SendAfter,
    /// Block until a message arrives, pushing its value
    Receive,
    /// Receive with a timeout, pushing value and success flag
    ReceiveWithTimeout,
    /// Receive the first message matched by an inline function
    ReceiveSelective,
    /// Selective receive with a timeout
    ReceiveSelectiveWithTimeout,
    /// Clone the mailbox head without removing it
    Peek,
    /// Push the mailbox length
    MailboxSize,
    /// Cancel a pending timer by reference
    CancelTimer,

    // Supervisors
    /// Add and start a child under the current supervisor
    StartChild,
    /// Stop a child by id
    StopChild,
    /// Restart a child by id
    RestartChild,
    /// Push an array describing the children
    ListChildren,
    /// Push child counts
    CountChildren,

    // Exceptions
    /// Raise a popped error value
    Throw,
    /// Re-raise the current exception
    Rethrow,
    /// Install an exception handler frame
    TryBegin,
    /// Remove the topmost handler frame
    TryEnd,
    /// Mark a catch-block entry point
    Catch,
    /// Push the current stack trace
    GetStacktrace,
}

impl Opcode {
    /// The opcode's family.
    pub fn family(&self) -> OpcodeFamily {
        use Opcode::*;
        match self {
            Pop | Dup | Dup2 | Swap | RotUp | RotDown | Nip | Tuck | Depth | Pick | Roll => {
                OpcodeFamily::Stack
            }
            PushNull | PushTrue | PushFalse | PushInt | PushUint | PushFloat | PushString
            | PushSymbol | PushCustom | PushInstructions => OpcodeFamily::Push,
            Add | Sub | Mul | Div | Mod | Neg | Abs | Inc | Dec | Pow | Floor | Ceil | Round
            | Min | Max => OpcodeFamily::Arithmetic,
            BitAnd | BitOr | BitXor | BitNot | Shl | Shr | ShrUnsigned => OpcodeFamily::Bitwise,
            And | Or | Not | Xor => OpcodeFamily::Logical,
            Eq | Neq | Id | Nid | Lt | Le | Gt | Ge | IsNull | IsNotNull => {
                OpcodeFamily::Comparison
            }
            LoadLocal | StoreLocal | LoadGlobal | StoreGlobal | LoadUpvalue | StoreUpvalue => {
                OpcodeFamily::Variable
            }
            Jump | JumpForward | JumpBackward | JumpIfTrue | JumpIfFalse | JumpIfTruePeek
            | JumpIfFalsePeek | Call | CallDynamic | CallIndirect | CallBuiltin | Return
            | ReturnValue | Halt | Nop => OpcodeFamily::Control,
            LambdaCreate | LambdaInvoke | LambdaBind => OpcodeFamily::Lambda,
            Spawn | SpawnLinked | SpawnMonitored | SelfPid | Exit | ExitRemote | Kill | Sleep
            | Yield | Link | Unlink | Monitor | Demonitor | TrapExitEnable | TrapExitDisable
            | IsAlive | GetInfo | Register | Unregister | Whereis | SetFlag | GetFlag => {
                OpcodeFamily::Process
            }
            Send | SendAfter | Receive | ReceiveWithTimeout | ReceiveSelective
            | ReceiveSelectiveWithTimeout | Peek | MailboxSize | CancelTimer => {
                OpcodeFamily::Message
            }
            StartChild | StopChild | RestartChild | ListChildren | CountChildren => {
                OpcodeFamily::Supervisor
            }
            Throw | Rethrow | TryBegin | TryEnd | Catch | GetStacktrace => {
                OpcodeFamily::Exception
            }
        }
    }

    /// Stable name for stack traces and error messages.
    pub fn name(&self) -> &'static str {
        use Opcode::*;
        match self {
            Pop => "POP",
            Dup => "DUP",
            Dup2 => "DUP2",
            Swap => "SWAP",
            RotUp => "ROT_UP",
            RotDown => "ROT_DOWN",
            Nip => "NIP",
            Tuck => "TUCK",
            Depth => "DEPTH",
            Pick => "PICK",
            Roll => "ROLL",
            PushNull => "PUSH_NULL",
            PushTrue => "PUSH_TRUE",
            PushFalse => "PUSH_FALSE",
            PushInt => "PUSH_INT",
            PushUint => "PUSH_UINT",
            PushFloat => "PUSH_FLOAT",
            PushString => "PUSH_STRING",
            PushSymbol => "PUSH_SYMBOL",
            PushCustom => "PUSH_CUSTOM",
            PushInstructions => "PUSH_INSTRUCTIONS",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Neg => "NEG",
            Abs => "ABS",
            Inc => "INC",
            Dec => "DEC",
            Pow => "POW",
            Floor => "FLOOR",
            Ceil => "CEIL",
            Round => "ROUND",
            Min => "MIN",
            Max => "MAX",
            BitAnd => "BIT_AND",
            BitOr => "BIT_OR",
            BitXor => "BIT_XOR",
            BitNot => "BIT_NOT",
            Shl => "SHL",
            Shr => "SHR",
            ShrUnsigned => "SHR_U",
            And => "AND",
            Or => "OR",
            Not => "NOT",
            Xor => "XOR",
            Eq => "EQ",
            Neq => "NEQ",
            Id => "ID",
            Nid => "NID",
            Lt => "LT",
            Le => "LE",
            Gt => "GT",
            Ge => "GE",
            IsNull => "IS_NULL",
            IsNotNull => "IS_NOT_NULL",
            LoadLocal => "LOAD_LOCAL",
            StoreLocal => "STORE_LOCAL",
            LoadGlobal => "LOAD_GLOBAL",
            StoreGlobal => "STORE_GLOBAL",
            LoadUpvalue => "LOAD_UPVALUE",
            StoreUpvalue => "STORE_UPVALUE",
            Jump => "JUMP",
            JumpForward => "JUMP_FWD",
            JumpBackward => "JUMP_BWD",
            JumpIfTrue => "JUMP_IF_TRUE",
            JumpIfFalse => "JUMP_IF_FALSE",
            JumpIfTruePeek => "JUMP_IF_TRUE_PEEK",
            JumpIfFalsePeek => "JUMP_IF_FALSE_PEEK",
            Call => "CALL",
            CallDynamic => "CALL_DYNAMIC",
            CallIndirect => "CALL_INDIRECT",
            CallBuiltin => "CALL_BUILT_IN",
            Return => "RETURN",
            ReturnValue => "RETURN_VALUE",
            Halt => "HALT",
            Nop => "NOP",
            LambdaCreate => "LAMBDA_CREATE",
            LambdaInvoke => "LAMBDA_INVOKE",
            LambdaBind => "LAMBDA_BIND",
            Spawn => "SPAWN",
            SpawnLinked => "SPAWN_LINKED",
            SpawnMonitored => "SPAWN_MONITORED",
            SelfPid => "SELF",
            Exit => "EXIT",
            ExitRemote => "EXIT_REMOTE",
            Kill => "KILL",
            Sleep => "SLEEP",
            Yield => "YIELD",
            Link => "LINK",
            Unlink => "UNLINK",
            Monitor => "MONITOR",
            Demonitor => "DEMONITOR",
            TrapExitEnable => "TRAP_EXIT_ENABLE",
            TrapExitDisable => "TRAP_EXIT_DISABLE",
            IsAlive => "IS_ALIVE",
            GetInfo => "GET_INFO",
            Register => "REGISTER",
            Unregister => "UNREGISTER",
            Whereis => "WHEREIS",
            SetFlag => "SET_FLAG",
            GetFlag => "GET_FLAG",
            Send => "SEND",
            SendAfter => "SEND_AFTER",
            Receive => "RECEIVE",
            ReceiveWithTimeout => "RECEIVE_WITH_TIMEOUT",
            ReceiveSelective => "RECEIVE_SELECTIVE",
            ReceiveSelectiveWithTimeout => "RECEIVE_SELECTIVE_WITH_TIMEOUT",
            Peek => "PEEK",
            MailboxSize => "MAILBOX_SIZE",
            CancelTimer => "CANCEL_TIMER",
            StartChild => "START_CHILD",
            StopChild => "STOP_CHILD",
            RestartChild => "RESTART_CHILD",
            ListChildren => "LIST_CHILDREN",
            CountChildren => "COUNT_CHILDREN",
            Throw => "THROW",
            Rethrow => "RETHROW",
            TryBegin => "TRY_BEGIN",
            TryEnd => "TRY_END",
            Catch => "CATCH",
            GetStacktrace => "GET_STACKTRACE",
        }
    }
}

/// One instruction: an opcode plus its operand value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// The operation
    pub opcode: Opcode,
    /// Operand, `Null` for operand-less opcodes
    pub operand: Value,
}

impl Instruction {
    /// An instruction with no operand.
    pub fn new(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            operand: Value::Null,
        }
    }

    /// An instruction carrying an operand.
    pub fn with_operand(opcode: Opcode, operand: Value) -> Self {
        Instruction { opcode, operand }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_families() {
        assert_eq!(Opcode::Dup.family(), OpcodeFamily::Stack);
        assert_eq!(Opcode::PushInt.family(), OpcodeFamily::Push);
        assert_eq!(Opcode::Send.family(), OpcodeFamily::Message);
        assert_eq!(Opcode::Spawn.family(), OpcodeFamily::Process);
        assert_eq!(Opcode::TryBegin.family(), OpcodeFamily::Exception);
        assert_eq!(Opcode::StartChild.family(), OpcodeFamily::Supervisor);
    }

    #[test]
    fn test_instruction_constructors() {
        let plain = Instruction::new(Opcode::Nop);
        assert_eq!(plain.operand, Value::Null);

        let with_op = Instruction::with_operand(Opcode::PushInt, Value::Int(42));
        assert_eq!(with_op.opcode, Opcode::PushInt);
        assert_eq!(with_op.operand, Value::Int(42));
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(Opcode::SelfPid.name(), "SELF");
        assert_eq!(Opcode::ShrUnsigned.name(), "SHR_U");
        assert_eq!(Opcode::CallBuiltin.name(), "CALL_BUILT_IN");
    }
}
