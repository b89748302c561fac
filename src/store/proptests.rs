//! Property-based tests for the message assembly store

use super::*;
use proptest::prelude::*;

fn small_limits() -> TurnLimits {
    TurnLimits {
        max_fragment_chars: 16,
        max_buffer_chars: 64,
        max_text_chars: 64,
    }
}

#[derive(Debug, Clone)]
enum Op {
    User(u8),
    Placeholder(u8),
    Delta(u8, String),
    Finalize(u8, Option<String>),
    Error(u8),
    ClearStreaming,
}

fn arb_op() -> impl Strategy<Value = Op> {
    let id = 0u8..4;
    prop_oneof![
        id.clone().prop_map(Op::User),
        id.clone().prop_map(Op::Placeholder),
        (id.clone(), "[a-z ]{0,20}").prop_map(|(i, t)| Op::Delta(i, t)),
        (id.clone(), proptest::option::of("[a-z]{0,10}")).prop_map(|(i, t)| Op::Finalize(i, t)),
        id.prop_map(Op::Error),
        Just(Op::ClearStreaming),
    ]
}

fn apply(store: &TurnStore, op: &Op) -> TurnStore {
    let id = |i: &u8| format!("t{i}");
    let (next, _) = match op {
        Op::User(i) => store.add_user(&id(i), "question"),
        Op::Placeholder(i) => store.add_placeholder(&id(i)),
        Op::Delta(i, text) => store.append_delta(&id(i), text),
        Op::Finalize(i, text) => store.finalize(&id(i), text.clone(), None, None),
        Op::Error(i) => store.set_error(&id(i), "boom"),
        Op::ClearStreaming => store.clear_streaming(),
    };
    next
}

proptest! {
    /// In-order fragments assemble to their concatenation, capped
    #[test]
    fn prop_buffer_is_capped_concatenation(fragments in proptest::collection::vec("[a-z]{0,16}", 0..12)) {
        let limits = small_limits();
        let (mut store, _) = TurnStore::new(limits).add_placeholder("a");
        for fragment in &fragments {
            store = store.append_delta("a", fragment).0;
        }

        let expected: String = fragments.concat().chars().take(limits.max_buffer_chars).collect();
        let turn = store.get("a").unwrap();
        prop_assert_eq!(&turn.buffered_text, &expected);
        prop_assert_eq!(turn.truncated, fragments.concat().chars().count() > limits.max_buffer_chars);
    }

    /// At most one turn streams, whatever the operation sequence
    #[test]
    fn prop_at_most_one_streaming_turn(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let mut store = TurnStore::new(small_limits());
        for op in &ops {
            store = apply(&store, op);
            prop_assert!(store.streaming_count() <= 1, "after {:?}: {:?}", op, store);
            if let Some(id) = store.streaming_id() {
                prop_assert!(store.get(id).is_some_and(|t| t.is_streaming));
            }
        }
    }

    /// Finalizing twice is the same as finalizing once
    #[test]
    fn prop_finalize_is_idempotent(
        ops in proptest::collection::vec(arb_op(), 0..20),
        target in 0u8..4,
        text in proptest::option::of("[a-z]{0,10}"),
    ) {
        let mut store = TurnStore::new(small_limits());
        for op in &ops {
            store = apply(&store, op);
        }
        let id = format!("t{target}");
        let (once, _) = store.finalize(&id, text.clone(), None, None);
        let (twice, outcome) = once.finalize(&id, text, None, None);
        prop_assert_eq!(outcome, Outcome::NoOp);
        prop_assert_eq!(once, twice);
    }

    /// Final turns never change
    #[test]
    fn prop_final_turns_are_immutable(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let mut store = TurnStore::new(small_limits());
        for op in &ops {
            let next = apply(&store, op);
            for turn in store.turns().filter(|t| t.is_final()) {
                prop_assert_eq!(next.get(&turn.id), Some(turn));
            }
            store = next;
        }
    }
}
