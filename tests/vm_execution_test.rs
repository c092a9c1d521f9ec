//! Instruction-level integration tests: arithmetic promotion, control
//! flow, subroutines, indirect calls, closures and exception handling.

use std::collections::HashMap;

use krill::bytecode::{Instruction, Opcode, Value};
use krill::types::{ExitReason, Priority};
use krill::Engine;

fn op(opcode: Opcode) -> Instruction {
    Instruction::new(opcode)
}

fn with(opcode: Opcode, operand: Value) -> Instruction {
    Instruction::with_operand(opcode, operand)
}

/// Run a single program to completion and return its final data stack.
fn run_program(program: Vec<Instruction>) -> Vec<Value> {
    let engine = Engine::new();
    let pid = engine.spawn(program).unwrap();
    engine.run().unwrap();
    let handle = engine.table().get(pid).unwrap();
    let process = handle.read();
    process.stack.clone()
}

#[test]
fn test_integer_arithmetic() {
    let stack = run_program(vec![
        with(Opcode::PushInt, Value::Int(6)),
        with(Opcode::PushInt, Value::Int(7)),
        op(Opcode::Mul),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Int(42)]);
}

#[test]
fn test_float_promotion() {
    let stack = run_program(vec![
        with(Opcode::PushInt, Value::Int(1)),
        with(Opcode::PushFloat, Value::Float(2.5)),
        op(Opcode::Add),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Float(3.5)]);
}

#[test]
fn test_unsigned_stays_unsigned() {
    let stack = run_program(vec![
        with(Opcode::PushUint, Value::Uint(10)),
        with(Opcode::PushUint, Value::Uint(3)),
        op(Opcode::Div),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Uint(3)]);
}

#[test]
fn test_division_by_zero_kills_process() {
    let engine = Engine::new();
    let pid = engine
        .spawn(vec![
            with(Opcode::PushInt, Value::Int(1)),
            with(Opcode::PushInt, Value::Int(0)),
            op(Opcode::Div),
            op(Opcode::Halt),
        ])
        .unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    let reason = engine.table().get(pid).unwrap().read().exit_reason.clone();
    assert!(matches!(reason, Some(ExitReason::Exception(_))));
    assert_eq!(engine.crash_dumps().len(), 1);
}

#[test]
fn test_try_catch_recovers() {
    // Handler installed at 0; the divide at 3 unwinds to the catch at 5
    let stack = run_program(vec![
        with(Opcode::TryBegin, Value::Int(4)),
        with(Opcode::PushInt, Value::Int(1)),
        with(Opcode::PushInt, Value::Int(0)),
        op(Opcode::Div),
        op(Opcode::Halt),
        op(Opcode::Catch),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack.len(), 1);
    let Value::Map(exception) = &stack[0] else {
        panic!("expected the exception value on the stack");
    };
    assert_eq!(
        exception.get("error"),
        Some(&Value::Str("DivisionByZero".to_string()))
    );
    assert_eq!(
        exception.get("type"),
        Some(&Value::Symbol("exception".to_string()))
    );
}

#[test]
fn test_unwind_restores_stack_depths() {
    // Stack holds a sentinel below the handler; the unwind drops
    // everything pushed after TRY_BEGIN and pushes the exception
    let stack = run_program(vec![
        with(Opcode::PushInt, Value::Int(99)),
        with(Opcode::TryBegin, Value::Int(6)),
        with(Opcode::PushInt, Value::Int(1)),
        with(Opcode::PushInt, Value::Int(2)),
        with(Opcode::PushInt, Value::Int(3)),
        with(Opcode::PushString, Value::Str("thrown".to_string())),
        op(Opcode::Throw),
        op(Opcode::Halt),
        op(Opcode::Catch),
        op(Opcode::Pop),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Int(99)]);
}

#[test]
fn test_subroutine_call_and_return() {
    let engine = Engine::new();
    let mut subroutines = HashMap::new();
    subroutines.insert(
        "add3".to_string(),
        vec![
            with(Opcode::PushInt, Value::Int(3)),
            op(Opcode::Add),
            op(Opcode::ReturnValue),
        ],
    );
    let pid = engine
        .spawn_with(
            vec![
                with(Opcode::PushInt, Value::Int(20)),
                with(Opcode::Call, Value::Str("add3".to_string())),
                op(Opcode::Halt),
            ],
            subroutines,
            HashMap::new(),
            Priority::Normal,
        )
        .unwrap();
    engine.run().unwrap();

    let handle = engine.table().get(pid).unwrap();
    assert_eq!(handle.read().stack, vec![Value::Int(23)]);
}

#[test]
fn test_undefined_subroutine_raises() {
    let engine = Engine::new();
    let pid = engine
        .spawn(vec![
            with(Opcode::Call, Value::Str("missing".to_string())),
            op(Opcode::Halt),
        ])
        .unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    let reason = engine.table().get(pid).unwrap().read().exit_reason.clone();
    let Some(ExitReason::Exception(Value::Map(exception))) = reason else {
        panic!("expected exception exit");
    };
    assert_eq!(
        exception.get("error"),
        Some(&Value::Str("UndefinedSubroutine".to_string()))
    );
}

#[test]
fn test_call_indirect_runs_block_and_returns() {
    let block = vec![
        with(Opcode::PushInt, Value::Int(5)),
        op(Opcode::ReturnValue),
    ];
    let stack = run_program(vec![
        with(Opcode::PushInstructions, Value::Instructions(block)),
        op(Opcode::CallIndirect),
        with(Opcode::PushInt, Value::Int(1)),
        op(Opcode::Add),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Int(6)]);
}

#[test]
fn test_lambda_capture_and_invoke() {
    let engine = Engine::new();
    let body = vec![
        with(Opcode::LoadLocal, Value::Int(0)),
        with(Opcode::LoadGlobal, Value::Str("x".to_string())),
        op(Opcode::Add),
        op(Opcode::ReturnValue),
    ];
    let mut globals = HashMap::new();
    globals.insert("x".to_string(), Value::Int(10));
    let pid = engine
        .spawn_with(
            vec![
                with(
                    Opcode::LambdaCreate,
                    Value::Array(vec![
                        Value::Instructions(body),
                        Value::Array(vec![Value::Str("x".to_string())]),
                    ]),
                ),
                with(Opcode::PushInt, Value::Int(5)),
                with(Opcode::LambdaInvoke, Value::Int(1)),
                op(Opcode::Halt),
            ],
            HashMap::new(),
            globals,
            Priority::Normal,
        )
        .unwrap();
    engine.run().unwrap();

    let handle = engine.table().get(pid).unwrap();
    assert_eq!(handle.read().stack, vec![Value::Int(15)]);
}

#[test]
fn test_lambda_bind_prepends_arguments() {
    let body = vec![
        with(Opcode::LoadLocal, Value::Int(0)),
        with(Opcode::LoadLocal, Value::Int(1)),
        op(Opcode::Sub),
        op(Opcode::ReturnValue),
    ];
    let stack = run_program(vec![
        with(
            Opcode::LambdaCreate,
            Value::Array(vec![Value::Instructions(body), Value::Array(vec![])]),
        ),
        with(Opcode::PushInt, Value::Int(10)),
        with(Opcode::LambdaBind, Value::Int(1)),
        with(Opcode::PushInt, Value::Int(4)),
        with(Opcode::LambdaInvoke, Value::Int(1)),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Int(6)]);
}

#[test]
fn test_upvalues_inside_closure() {
    let engine = Engine::new();
    let body = vec![
        with(Opcode::LoadUpvalue, Value::Int(0)),
        with(Opcode::PushInt, Value::Int(1)),
        op(Opcode::Add),
        op(Opcode::ReturnValue),
    ];
    let mut globals = HashMap::new();
    globals.insert("counter".to_string(), Value::Int(41));
    let pid = engine
        .spawn_with(
            vec![
                with(
                    Opcode::LambdaCreate,
                    Value::Array(vec![
                        Value::Instructions(body),
                        Value::Array(vec![Value::Str("counter".to_string())]),
                    ]),
                ),
                with(Opcode::LambdaInvoke, Value::Int(0)),
                op(Opcode::Halt),
            ],
            HashMap::new(),
            globals,
            Priority::Normal,
        )
        .unwrap();
    engine.run().unwrap();

    let handle = engine.table().get(pid).unwrap();
    assert_eq!(handle.read().stack, vec![Value::Int(42)]);
}

#[test]
fn test_upvalue_outside_closure_raises() {
    let engine = Engine::new();
    let pid = engine
        .spawn(vec![
            with(Opcode::LoadUpvalue, Value::Int(0)),
            op(Opcode::Halt),
        ])
        .unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    let reason = engine.table().get(pid).unwrap().read().exit_reason.clone();
    assert!(matches!(reason, Some(ExitReason::Exception(_))));
}

#[test]
fn test_stack_shuffles() {
    // ( 1 2 3 ) -> rot-up -> ( 2 3 1 ) -> swap -> ( 2 1 3 ) -> nip -> ( 2 3 )
    let stack = run_program(vec![
        with(Opcode::PushInt, Value::Int(1)),
        with(Opcode::PushInt, Value::Int(2)),
        with(Opcode::PushInt, Value::Int(3)),
        op(Opcode::RotUp),
        op(Opcode::Swap),
        op(Opcode::Nip),
        op(Opcode::Depth),
        op(Opcode::Halt),
    ]);
    assert_eq!(
        stack,
        vec![Value::Int(2), Value::Int(3), Value::Uint(2)]
    );
}

#[test]
fn test_pick_and_roll() {
    let stack = run_program(vec![
        with(Opcode::PushInt, Value::Int(10)),
        with(Opcode::PushInt, Value::Int(20)),
        with(Opcode::PushInt, Value::Int(30)),
        with(Opcode::Pick, Value::Int(2)),
        with(Opcode::Roll, Value::Int(3)),
        op(Opcode::Halt),
    ]);
    // PICK 2 copies the 10; ROLL 3 then moves the original 10 to the top
    assert_eq!(
        stack,
        vec![Value::Int(20), Value::Int(30), Value::Int(10), Value::Int(10)]
    );
}

#[test]
fn test_stack_underflow_raises() {
    let engine = Engine::new();
    let pid = engine.spawn(vec![op(Opcode::Pop), op(Opcode::Halt)]).unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    let reason = engine.table().get(pid).unwrap().read().exit_reason.clone();
    let Some(ExitReason::Exception(Value::Map(exception))) = reason else {
        panic!("expected exception exit");
    };
    assert_eq!(
        exception.get("error"),
        Some(&Value::Str("StackUnderflow".to_string()))
    );
}

#[test]
fn test_conditional_jumps() {
    // Jump over the 111 push when the flag is true
    let stack = run_program(vec![
        op(Opcode::PushTrue),
        with(Opcode::JumpIfTrue, Value::Int(3)),
        with(Opcode::PushInt, Value::Int(111)),
        with(Opcode::PushInt, Value::Int(222)),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Int(222)]);
}

#[test]
fn test_invalid_jump_target_raises() {
    let engine = Engine::new();
    let pid = engine
        .spawn(vec![with(Opcode::Jump, Value::Int(50)), op(Opcode::Halt)])
        .unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    let reason = engine.table().get(pid).unwrap().read().exit_reason.clone();
    let Some(ExitReason::Exception(Value::Map(exception))) = reason else {
        panic!("expected exception exit");
    };
    assert_eq!(
        exception.get("error"),
        Some(&Value::Str("InvalidJumpTarget".to_string()))
    );
}

#[test]
fn test_logical_and_comparison_ops() {
    let stack = run_program(vec![
        with(Opcode::PushInt, Value::Int(3)),
        with(Opcode::PushFloat, Value::Float(3.0)),
        op(Opcode::Eq),
        with(Opcode::PushString, Value::Str("".to_string())),
        op(Opcode::Not),
        op(Opcode::And),
        op(Opcode::Halt),
    ]);
    assert_eq!(stack, vec![Value::Bool(true)]);
}

#[test]
fn test_shift_saturation() {
    let stack = run_program(vec![
        with(Opcode::PushInt, Value::Int(-8)),
        with(Opcode::PushInt, Value::Int(70)),
        op(Opcode::Shr),
        with(Opcode::PushUint, Value::Uint(8)),
        with(Opcode::PushInt, Value::Int(70)),
        op(Opcode::Shl),
        op(Opcode::Halt),
    ]);
    // Arithmetic right of a negative sign-fills; left shift saturates to 0
    assert_eq!(stack, vec![Value::Int(-1), Value::Uint(0)]);
}

#[test]
fn test_register_and_whereis() {
    let engine = Engine::new();
    let pid = engine
        .spawn(vec![
            with(Opcode::PushString, Value::Str("me".to_string())),
            op(Opcode::Register),
            op(Opcode::Pop),
            with(Opcode::PushString, Value::Str("me".to_string())),
            op(Opcode::Whereis),
            op(Opcode::Halt),
        ])
        .unwrap();
    engine.run().unwrap();

    let handle = engine.table().get(pid).unwrap();
    assert_eq!(handle.read().stack, vec![Value::Uint(pid.raw())]);
}

#[test]
fn test_get_stacktrace_names_subroutine() {
    let engine = Engine::new();
    let mut subroutines = HashMap::new();
    subroutines.insert(
        "outer".to_string(),
        vec![op(Opcode::GetStacktrace), op(Opcode::ReturnValue)],
    );
    let pid = engine
        .spawn_with(
            vec![
                with(Opcode::Call, Value::Str("outer".to_string())),
                op(Opcode::Halt),
            ],
            subroutines,
            HashMap::new(),
            Priority::Normal,
        )
        .unwrap();
    engine.run().unwrap();

    let handle = engine.table().get(pid).unwrap();
    let process = handle.read();
    let Value::Array(frames) = &process.stack[0] else {
        panic!("expected a stacktrace array");
    };
    assert!(frames.len() >= 2);
    let Value::Map(caller_frame) = &frames[1] else {
        panic!("expected frame maps");
    };
    assert_eq!(
        caller_frame.get("function"),
        Some(&Value::Str("outer".to_string()))
    );
}

#[test]
fn test_custom_opcode_handler_intercepts() {
    let mut engine = Engine::new();
    engine.executor_mut().register_handler(
        Opcode::Nop,
        std::sync::Arc::new(|process, _instruction| {
            process.ip += 1;
            process.stack.push(Value::Str("intercepted".to_string()));
            Ok(Value::Null)
        }),
    );
    let pid = engine.spawn(vec![op(Opcode::Nop), op(Opcode::Halt)]).unwrap();
    engine.run().unwrap();

    let handle = engine.table().get(pid).unwrap();
    assert_eq!(
        handle.read().stack,
        vec![Value::Str("intercepted".to_string())]
    );
}

#[test]
fn test_get_info_reports_links_and_state() {
    let engine = Engine::new();
    let pid = engine
        .spawn(vec![
            op(Opcode::PushNull),
            op(Opcode::GetInfo),
            op(Opcode::Halt),
        ])
        .unwrap();
    engine.run().unwrap();

    let handle = engine.table().get(pid).unwrap();
    let process = handle.read();
    let Value::Map(info) = &process.stack[0] else {
        panic!("expected an info map");
    };
    assert_eq!(info.get("address"), Some(&Value::Uint(pid.raw())));
    assert_eq!(info.get("links"), Some(&Value::Array(vec![])));
    assert_eq!(info.get("trap_exit"), Some(&Value::Bool(false)));
}
