//! Property-based tests over the event queue, loop protector, and
//! snapshot hashing.

use std::time::{Duration, Instant};

use proptest::prelude::*;
use serde_json::json;

use arbiter::domain::models::event::Event;
use arbiter::domain::models::snapshot::stable_hash;
use arbiter::services::event_queue::{BoundedEventQueue, EventQueueConfig};
use arbiter::services::loop_protector::{LoopProtector, LoopProtectorConfig};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime builds")
}

/// Arbitrary scalar JSON values for state generation.
fn json_leaf() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i32>().prop_map(serde_json::Value::from),
        "[a-z]{0,12}".prop_map(serde_json::Value::from),
    ]
}

fn json_state() -> impl Strategy<Value = serde_json::Value> {
    prop::collection::btree_map("[a-z]{1,8}", json_leaf(), 0..8)
        .prop_map(|map| serde_json::Value::Object(map.into_iter().collect()))
}

proptest! {
    /// Every enqueued event ends up either ACKed exactly once or in the
    /// DLQ exactly once, for any mix of failing and succeeding events.
    #[test]
    fn ack_xor_dead_letter(fail_mask in prop::collection::vec(any::<bool>(), 1..40)) {
        runtime().block_on(async move {
            let queue = BoundedEventQueue::new(EventQueueConfig {
                max_retries: 1,
                retry_backoff_ms: 1,
                max_backoff_ms: 2,
                ..Default::default()
            });

            let total = fail_mask.len() as u64;
            for (i, fails) in fail_mask.iter().enumerate() {
                let event = Event::parse_new(
                    "agent.prop",
                    &format!("thread-{i}"),
                    json!({"fails": fails}),
                )
                .unwrap();
                queue.enqueue(event).await.unwrap();
            }

            // Pump until the queue settles, failing flagged events on
            // every attempt.
            let deadline = Instant::now() + Duration::from_secs(10);
            while !queue.is_idle().await {
                assert!(Instant::now() < deadline, "queue did not settle");
                let batch = queue.dequeue_batch(64).await;
                if batch.is_empty() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    continue;
                }
                for event in batch {
                    if event.data["fails"].as_bool().unwrap_or(false) {
                        queue.nack(event.id, Some("flagged".into())).await.unwrap();
                    } else {
                        queue.ack(event.id).await.unwrap();
                    }
                }
            }

            let stats = queue.stats().await;
            let expected_failures = fail_mask.iter().filter(|f| **f).count() as u64;
            prop_assert_eq!(stats.total_acked, total - expected_failures);
            prop_assert_eq!(stats.total_dead_lettered, expected_failures);
            prop_assert_eq!(stats.in_flight, 0);
            Ok(())
        })?;
    }

    /// Within any window the protector admits at most `max_event_count`
    /// emissions.
    #[test]
    fn loop_guard_bounds_admissions(
        max_count in 1_usize..20,
        emissions in 1_usize..100,
    ) {
        let mut guard = LoopProtector::new(LoopProtectorConfig {
            enabled: true,
            max_event_count: max_count,
            max_event_rate: f64::MAX,
            window_ms: 60_000,
        });

        let start = Instant::now();
        let mut admitted = 0_usize;
        for i in 0..emissions {
            if guard
                .admit_at("agent.prop", start + Duration::from_millis(i as u64))
                .is_ok()
            {
                admitted += 1;
            }
        }
        prop_assert!(admitted <= max_count);
        prop_assert_eq!(admitted, emissions.min(max_count));
    }

    /// Snapshot hashing is deterministic under reserialization and
    /// sensitive to content changes.
    #[test]
    fn snapshot_hash_round_trip(state in json_state()) {
        let h1 = stable_hash(&[], &state).unwrap();
        let reserialized: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();
        let h2 = stable_hash(&[], &reserialized).unwrap();
        prop_assert_eq!(&h1, &h2);

        let mut mutated = state.clone();
        if let serde_json::Value::Object(ref mut map) = mutated {
            map.insert("__probe".to_string(), json!(1));
        }
        let h3 = stable_hash(&[], &mutated).unwrap();
        prop_assert_ne!(&h1, &h3);
    }
}
