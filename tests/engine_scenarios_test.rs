//! End-to-end scenarios driving the full engine: message round trips,
//! fault propagation over links and monitors, supervision restarts,
//! selective receive and timed waits.

use krill::bytecode::{Instruction, Opcode, Value};
use krill::types::{ExitReason, ProcessState};
use krill::Engine;

fn op(opcode: Opcode) -> Instruction {
    Instruction::new(opcode)
}

fn with(opcode: Opcode, operand: Value) -> Instruction {
    Instruction::with_operand(opcode, operand)
}

fn final_stack(engine: &Engine, pid: krill::Pid) -> Vec<Value> {
    let handle = engine.table().get(pid).expect("process still in table");
    let process = handle.read();
    process.stack.clone()
}

#[test]
fn test_ping_pong_round_trip() {
    let engine = Engine::new();

    let ponger = vec![
        op(Opcode::Receive),
        op(Opcode::Pop),
        with(Opcode::PushString, Value::Str("main".to_string())),
        with(Opcode::PushString, Value::Str("pong".to_string())),
        op(Opcode::Send),
        op(Opcode::Halt),
    ];
    let pinger = vec![
        with(Opcode::PushString, Value::Str("main".to_string())),
        op(Opcode::Register),
        op(Opcode::Pop),
        with(Opcode::PushInstructions, Value::Instructions(ponger)),
        op(Opcode::Spawn),
        with(Opcode::PushString, Value::Str("ping".to_string())),
        op(Opcode::Send),
        op(Opcode::Receive),
        op(Opcode::Halt),
    ];

    let p1 = engine.spawn(pinger).unwrap();
    engine.run().unwrap();

    assert_eq!(final_stack(&engine, p1), vec![Value::Str("pong".to_string())]);
    assert_eq!(
        engine.table().get(p1).unwrap().read().exit_reason,
        Some(ExitReason::Normal)
    );
}

#[test]
fn test_linked_crash_propagates() {
    let engine = Engine::new();

    let crasher = vec![
        with(Opcode::PushString, Value::Str("boom".to_string())),
        op(Opcode::Throw),
    ];
    let watcher = vec![
        with(Opcode::PushInstructions, Value::Instructions(crasher)),
        op(Opcode::SpawnLinked),
        op(Opcode::Pop),
        op(Opcode::Receive),
    ];

    let p1 = engine.spawn(watcher).unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    let p1_handle = engine.table().get(p1).unwrap();
    assert_eq!(p1_handle.state(), ProcessState::Dead);
    let reason = p1_handle.read().exit_reason.clone().unwrap();
    let ExitReason::Exception(value) = reason else {
        panic!("expected exception reason, got {:?}", reason);
    };
    let Value::Map(entries) = value else {
        panic!("expected structured exception");
    };
    assert_eq!(
        entries.get("message"),
        Some(&Value::Str("boom".to_string()))
    );

    // The crash is dumped once, for the originating process only
    assert_eq!(engine.crash_dumps().len(), 1);
}

#[test]
fn test_monitor_of_dead_process_yields_down() {
    let engine = Engine::new();
    let ghost: u64 = 99_999_999;

    let program = vec![
        with(Opcode::PushUint, Value::Uint(ghost)),
        op(Opcode::Monitor),
        op(Opcode::Pop),
        op(Opcode::Receive),
        op(Opcode::Halt),
    ];
    let p1 = engine.spawn(program).unwrap();
    engine.run().unwrap();

    let stack = final_stack(&engine, p1);
    assert_eq!(stack.len(), 1);
    let Value::Map(down) = &stack[0] else {
        panic!("expected a DOWN map, got {:?}", stack[0]);
    };
    assert_eq!(down.get("signal"), Some(&Value::Str("DOWN".to_string())));
    assert_eq!(down.get("process"), Some(&Value::Uint(ghost)));
    assert_eq!(
        down.get("reason"),
        Some(&Value::Symbol("invalid_process".to_string()))
    );
}

#[test]
fn test_supervisor_restarts_until_budget_exhausted() {
    let engine = Engine::new();

    let crasher_code = vec![
        with(Opcode::PushString, Value::Str("child down".to_string())),
        op(Opcode::Throw),
    ];
    let spec = Value::map_from(vec![
        ("id", Value::Str("crasher".to_string())),
        ("instructions", Value::Instructions(crasher_code)),
        ("restart", Value::Symbol("permanent".to_string())),
        ("max_restarts", Value::Int(3)),
        ("restart_window", Value::Float(5.0)),
    ]);
    let supervisor_code = vec![
        with(Opcode::PushCustom, spec),
        op(Opcode::StartChild),
        op(Opcode::Pop),
        with(Opcode::Sleep, Value::Float(0.4)),
        op(Opcode::Halt),
    ];

    let sup = engine.spawn(supervisor_code).unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    // Initial crash plus three restarts, each crashing once
    assert_eq!(engine.crash_dumps().len(), 4);

    // The child stays dead once the budget is spent; the supervisor
    // outlived every crash and finished normally
    let listing = engine.supervisors().list_children(sup).unwrap();
    let Value::Array(children) = listing else {
        panic!("expected child listing");
    };
    let Value::Map(child) = &children[0] else {
        panic!("expected child entry");
    };
    assert_eq!(child.get("pid"), Some(&Value::Null));
    assert_eq!(
        engine.table().get(sup).unwrap().read().exit_reason,
        Some(ExitReason::Normal)
    );
}

#[test]
fn test_selective_receive_scans_past_non_matching() {
    let engine = Engine::new();

    let matcher = vec![
        with(Opcode::LoadLocal, Value::Int(0)),
        with(
            Opcode::CallBuiltin,
            Value::Array(vec![
                Value::Str("core".to_string()),
                Value::Str("is_integer".to_string()),
                Value::Uint(1),
            ]),
        ),
        op(Opcode::ReturnValue),
    ];
    let program = vec![
        op(Opcode::SelfPid),
        with(Opcode::PushInt, Value::Int(1)),
        op(Opcode::Send),
        op(Opcode::SelfPid),
        with(Opcode::PushString, Value::Str("skip".to_string())),
        op(Opcode::Send),
        op(Opcode::SelfPid),
        with(Opcode::PushInt, Value::Int(2)),
        op(Opcode::Send),
        with(
            Opcode::ReceiveSelective,
            Value::Instructions(matcher.clone()),
        ),
        with(Opcode::ReceiveSelective, Value::Instructions(matcher)),
        op(Opcode::Halt),
    ];

    let p1 = engine.spawn(program).unwrap();
    engine.run().unwrap();

    assert_eq!(final_stack(&engine, p1), vec![Value::Int(1), Value::Int(2)]);

    // Only the non-matching message remains queued
    let mailbox = engine.table().mailbox(p1).unwrap();
    let mut mailbox = mailbox.lock();
    assert_eq!(mailbox.len(), 1);
    assert_eq!(
        mailbox.shift().unwrap().value,
        Value::Str("skip".to_string())
    );
}

#[test]
fn test_sleep_wakes_after_deadline() {
    let engine = Engine::new();
    let program = vec![
        with(Opcode::Sleep, Value::Float(0.05)),
        with(Opcode::PushInt, Value::Int(7)),
        op(Opcode::Halt),
    ];

    let started = std::time::Instant::now();
    let p1 = engine.spawn(program).unwrap();
    engine.run().unwrap();

    assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    assert_eq!(final_stack(&engine, p1), vec![Value::Int(7)]);
    assert_eq!(
        engine.table().get(p1).unwrap().read().exit_reason,
        Some(ExitReason::Normal)
    );
}

#[test]
fn test_receive_timeout_pushes_indicator() {
    let engine = Engine::new();
    let program = vec![
        with(Opcode::ReceiveWithTimeout, Value::Float(0.05)),
        op(Opcode::Halt),
    ];

    let p1 = engine.spawn(program).unwrap();
    engine.run().unwrap();

    assert_eq!(
        final_stack(&engine, p1),
        vec![Value::Null, Value::Bool(false)]
    );
}

#[test]
fn test_trapped_exit_signal_becomes_message() {
    let engine = Engine::new();

    let exiter = vec![
        with(Opcode::PushString, Value::Str("target".to_string())),
        with(Opcode::PushSymbol, Value::Symbol("oops".to_string())),
        op(Opcode::ExitRemote),
        op(Opcode::Halt),
    ];
    let trapper = vec![
        op(Opcode::TrapExitEnable),
        with(Opcode::PushString, Value::Str("target".to_string())),
        op(Opcode::Register),
        op(Opcode::Pop),
        with(Opcode::PushInstructions, Value::Instructions(exiter)),
        op(Opcode::Spawn),
        op(Opcode::Pop),
        op(Opcode::Receive),
        op(Opcode::Halt),
    ];

    let p1 = engine.spawn(trapper).unwrap();
    engine.run().unwrap();

    let stack = final_stack(&engine, p1);
    assert_eq!(stack.len(), 1);
    let Value::Map(message) = &stack[0] else {
        panic!("expected an EXIT message, got {:?}", stack[0]);
    };
    assert_eq!(message.get("signal"), Some(&Value::Str("EXIT".to_string())));
    assert_eq!(
        message.get("reason"),
        Some(&Value::Symbol("oops".to_string()))
    );
    assert_eq!(
        message.get("link_type"),
        Some(&Value::Str("Link".to_string()))
    );
}

#[test]
fn test_send_after_delivers_later_and_cancel_returns_false() {
    let engine = Engine::new();
    let program = vec![
        op(Opcode::SelfPid),
        with(Opcode::PushString, Value::Str("delayed".to_string())),
        with(Opcode::PushFloat, Value::Float(0.03)),
        op(Opcode::SendAfter),
        // Hold the timer reference while we wait for delivery
        op(Opcode::Receive),
        op(Opcode::Pop),
        op(Opcode::CancelTimer),
        op(Opcode::Halt),
    ];

    let p1 = engine.spawn(program).unwrap();
    engine.run().unwrap();

    // Cancelling after the timer fired reports false
    assert_eq!(final_stack(&engine, p1), vec![Value::Bool(false)]);
}

#[test]
fn test_kill_is_untrappable() {
    let engine = Engine::new();

    let victim = vec![
        op(Opcode::TrapExitEnable),
        with(Opcode::PushString, Value::Str("victim".to_string())),
        op(Opcode::Register),
        op(Opcode::Pop),
        op(Opcode::Receive),
        op(Opcode::Halt),
    ];
    let killer = vec![
        with(Opcode::PushInstructions, Value::Instructions(victim)),
        op(Opcode::Spawn),
        op(Opcode::Pop),
        // Give the victim a slice to arm its trap and park
        op(Opcode::Yield),
        with(Opcode::PushString, Value::Str("victim".to_string())),
        op(Opcode::Kill),
        op(Opcode::Halt),
    ];

    engine.spawn(killer).unwrap();
    engine.run().unwrap();
    engine.wait_for_fault_handler();

    let victim_pid = engine
        .table()
        .pids()
        .into_iter()
        .find(|pid| {
            engine
                .table()
                .get(*pid)
                .map(|handle| handle.read().exit_reason == Some(ExitReason::Kill))
                .unwrap_or(false)
        });
    assert!(victim_pid.is_some(), "victim should be dead with reason kill");
}
