//! Property-based tests for value semantics, stack-op identities and
//! mailbox selection laws.

use proptest::prelude::*;

use krill::bytecode::{Instruction, Opcode, Value};
use krill::runtime::mailbox::{matches, Mailbox, Message};
use krill::types::Pid;
use krill::Engine;

fn op(opcode: Opcode) -> Instruction {
    Instruction::new(opcode)
}

fn with(opcode: Opcode, operand: Value) -> Instruction {
    Instruction::with_operand(opcode, operand)
}

fn run_program(program: Vec<Instruction>) -> Vec<Value> {
    let engine = Engine::new();
    let pid = engine.spawn(program).unwrap();
    engine.run().unwrap();
    let handle = engine.table().get(pid).unwrap();
    let process = handle.read();
    process.stack.clone()
}

/// Strategy over structured values: primitives plus shallow collections.
fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<u64>().prop_map(Value::Uint),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        "[a-z]{0,12}".prop_map(Value::Str),
        "[a-z_]{1,8}".prop_map(Value::Symbol),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Binary),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            proptest::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|pairs| {
                let mut map = indexmap::IndexMap::new();
                for (key, value) in pairs {
                    map.insert(key, value);
                }
                Value::Map(map)
            }),
        ]
    })
}

fn push_instruction(value: &Value) -> Instruction {
    with(Opcode::PushCustom, value.clone())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_clone_is_structurally_equal(value in value_strategy()) {
        let clone = value.clone();
        prop_assert_eq!(&clone, &value);
    }

    #[test]
    fn test_clone_of_array_is_independent(values in proptest::collection::vec(value_strategy(), 0..4)) {
        let original = Value::Array(values.clone());
        let mut clone = original.clone();
        if let Value::Array(items) = &mut clone {
            items.push(Value::Int(12345));
        }
        prop_assert_eq!(original, Value::Array(values));
    }

    #[test]
    fn test_numeric_equality_is_symmetric(a in any::<i64>(), b in any::<u64>()) {
        let left = Value::Int(a);
        let right = Value::Uint(b);
        prop_assert_eq!(left == right, right == left);
    }

    #[test]
    fn test_null_pattern_matches_everything(value in value_strategy()) {
        prop_assert!(matches(&value, &Value::Null));
    }

    #[test]
    fn test_select_returns_message_iff_pattern_matches(
        value in value_strategy(),
        pattern in value_strategy(),
    ) {
        let mut mailbox = Mailbox::with_capacity(16);
        mailbox.push(Message::new(Pid::new(), value.clone()));

        let expected = matches(&value, &pattern);
        let selected = mailbox.select(&pattern);
        prop_assert_eq!(selected.is_some(), expected);
        // A miss leaves the message queued
        prop_assert_eq!(mailbox.len(), if expected { 0 } else { 1 });
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_dup_pop_is_identity(value in value_strategy()) {
        let stack = run_program(vec![
            push_instruction(&value),
            op(Opcode::Dup),
            op(Opcode::Pop),
            op(Opcode::Halt),
        ]);
        prop_assert_eq!(stack, vec![value]);
    }

    #[test]
    fn test_swap_twice_is_identity(a in value_strategy(), b in value_strategy()) {
        let stack = run_program(vec![
            push_instruction(&a),
            push_instruction(&b),
            op(Opcode::Swap),
            op(Opcode::Swap),
            op(Opcode::Halt),
        ]);
        prop_assert_eq!(stack, vec![a, b]);
    }

    #[test]
    fn test_push_pop_leaves_stack_unchanged(
        base in value_strategy(),
        pushed in value_strategy(),
    ) {
        let stack = run_program(vec![
            push_instruction(&base),
            push_instruction(&pushed),
            op(Opcode::Pop),
            op(Opcode::Halt),
        ]);
        prop_assert_eq!(stack, vec![base]);
    }
}

#[test]
fn test_mailbox_fifo_order_is_preserved() {
    let mut mailbox = Mailbox::with_capacity(64);
    let sender = Pid::new();
    for index in 0..10 {
        mailbox.push(Message::new(sender, Value::Int(index)));
    }
    for index in 0..10 {
        assert_eq!(mailbox.shift().unwrap().value, Value::Int(index));
    }
}
