use std::cmp::Ordering;
use std::collections::HashSet;

use dm_core::{
    Delivery, Message, MessagePage, MessageStore,
    store::{DEFAULT_PAGE_SIZE, OptimisticDraft},
};
use proptest::prelude::*;

// --- Strategies for interleaved store operations ---

#[derive(Debug, Clone)]
enum Op {
    /// Live insert of server message `m-{id}`.
    RemoteInsert { id: u8, created_at_ms: u64, inbound: bool },
    /// Local send that has not been confirmed yet.
    OptimisticSend { created_at_ms: u64 },
    /// Confirmation of the `send`-th optimistic send as `m-{id}`.
    Confirm { send: usize, id: u8, created_at_ms: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0_u8..24, 0_u64..64, any::<bool>()).prop_map(|(id, created_at_ms, inbound)| {
            Op::RemoteInsert {
                id,
                created_at_ms,
                inbound,
            }
        }),
        (0_u64..64).prop_map(|created_at_ms| Op::OptimisticSend { created_at_ms }),
        (0_usize..8, 0_u8..24, 0_u64..64).prop_map(|(send, id, created_at_ms)| Op::Confirm {
            send,
            id,
            created_at_ms,
        }),
    ]
}

fn server_message(id: u8, created_at_ms: u64, inbound: bool) -> Message {
    let (sender_id, receiver_id) = if inbound { ("bob", "alice") } else { ("alice", "bob") };
    Message {
        id: format!("m-{id:02}"),
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        content: format!("server {id}"),
        created_at_ms,
        is_read: false,
        reply_to: None,
        reactions: Vec::new(),
        client_txn_id: None,
        delivery: Delivery::Confirmed,
    }
}

fn loaded_store() -> MessageStore {
    let mut store = MessageStore::new("alice", DEFAULT_PAGE_SIZE);
    let (request, _) = store.begin_open("bob").unwrap();
    store
        .complete_open(&request, Ok(MessagePage::default()))
        .unwrap();
    store
}

fn run(ops: &[Op]) -> MessageStore {
    let mut store = loaded_store();
    let mut sends = Vec::new();

    for op in ops {
        match op {
            Op::RemoteInsert {
                id,
                created_at_ms,
                inbound,
            } => {
                store.apply_remote_insert(server_message(*id, *created_at_ms, *inbound));
            }
            Op::OptimisticSend { created_at_ms } => {
                let txn = format!("tx-{}", sends.len());
                store
                    .apply_optimistic_send(OptimisticDraft {
                        client_txn_id: txn.clone(),
                        content: "hello".to_string(),
                        reply_to_id: None,
                        created_at_ms: *created_at_ms,
                    })
                    .unwrap();
                sends.push(txn);
            }
            Op::Confirm {
                send,
                id,
                created_at_ms,
            } => {
                if let Some(txn) = sends.get(*send) {
                    store.confirm_send(txn, server_message(*id, *created_at_ms, false));
                }
            }
        }
    }
    store
}

proptest! {
    /// Every id appears exactly once, whatever the arrival order.
    #[test]
    fn one_entry_per_message_id(ops in proptest::collection::vec(arb_op(), 0..64)) {
        let store = run(&ops);
        let mut seen = HashSet::new();
        for message in store.messages() {
            prop_assert!(seen.insert(message.id.clone()), "duplicate id {}", message.id);
        }
    }

    /// The window is strictly ordered by `(created_at_ms, id)`.
    #[test]
    fn window_stays_sorted(ops in proptest::collection::vec(arb_op(), 0..64)) {
        let store = run(&ops);
        for pair in store.messages().windows(2) {
            prop_assert_eq!(pair[0].display_cmp(&pair[1]), Ordering::Less);
        }
    }

    /// A confirmed send never leaves its placeholder behind.
    #[test]
    fn confirmed_sends_leave_no_placeholder(ops in proptest::collection::vec(arb_op(), 0..64)) {
        let store = run(&ops);
        let mut confirmed = HashSet::new();
        let mut sends = 0_usize;
        for op in &ops {
            match op {
                Op::OptimisticSend { .. } => sends += 1,
                Op::Confirm { send, .. } if *send < sends => {
                    confirmed.insert(format!("tx-{send}"));
                }
                _ => {}
            }
        }

        for message in store.messages().iter().filter(|m| m.is_pending()) {
            let txn = message.client_txn_id.clone().unwrap_or_default();
            prop_assert!(!confirmed.contains(&txn), "placeholder for {} survived", txn);
        }
    }
}
