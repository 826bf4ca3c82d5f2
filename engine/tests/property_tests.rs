//! Property tests for the experience buffer and configuration parsing

use proptest::prelude::*;
use serde_json::json;

use taskmesh_engine::config::Config;
use taskmesh_engine::experience::{ExperienceBuffer, NewExperience};

fn entry(priority: f64) -> NewExperience {
    NewExperience {
        worker_id: "w1".to_string(),
        state: json!({}),
        action: "validation".into(),
        result: json!({}),
        next_state: json!({}),
        reward: 1.0,
        priority: Some(priority),
        metadata: serde_json::Value::Null,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // After any sequence of adds the buffer holds at most `capacity`
    // entries, and those entries are the highest-priority ones seen
    // (ties broken arbitrarily, which multiset comparison absorbs).
    #[test]
    fn test_buffer_retains_highest_priority_subset(
        priorities in proptest::collection::vec(0.0..=1.0f64, 1..40),
        capacity in 1..10usize,
    ) {
        runtime().block_on(async {
            let buffer = ExperienceBuffer::new(capacity, 0.5);
            for &p in &priorities {
                buffer.add(entry(p)).await;
            }

            prop_assert!(buffer.len().await <= capacity);

            let mut retained: Vec<f64> = buffer
                .sample(priorities.len(), None)
                .await
                .iter()
                .map(|e| e.priority)
                .collect();
            retained.sort_by(|a, b| a.partial_cmp(b).expect("finite"));

            let mut expected = priorities.clone();
            expected.sort_by(|a, b| b.partial_cmp(a).expect("finite"));
            expected.truncate(capacity);
            expected.sort_by(|a, b| a.partial_cmp(b).expect("finite"));

            prop_assert_eq!(retained, expected);
            Ok(())
        })?;
    }

    // Stored priorities always land in [0, 1] whatever the caller sends.
    #[test]
    fn test_priority_clamped_on_add(priority in -10.0..10.0f64) {
        runtime().block_on(async {
            let buffer = ExperienceBuffer::new(10, 0.5);
            buffer.add(entry(priority)).await;

            let stored = buffer.sample(1, None).await[0].priority;
            prop_assert!((0.0..=1.0).contains(&stored));
            prop_assert_eq!(stored, priority.clamp(0.0, 1.0));
            Ok(())
        })?;
    }

    // A draw never repeats an entry and never exceeds the pool.
    #[test]
    fn test_sampling_without_replacement(
        pool_size in 1..30usize,
        count in 0..40usize,
    ) {
        runtime().block_on(async {
            let buffer = ExperienceBuffer::new(100, 0.5);
            for i in 0..pool_size {
                buffer.add(entry((i as f64) / (pool_size as f64))).await;
            }

            let drawn = buffer.sample(count, None).await;
            prop_assert_eq!(drawn.len(), count.min(pool_size));

            let mut ids: Vec<_> = drawn.iter().map(|e| e.id).collect();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), drawn.len());
            Ok(())
        })?;
    }

    // Any combination of in-range values parses and survives as-is.
    #[test]
    fn test_config_parsing(
        poll in 1..3600u64,
        timeout in 1..3600u64,
        retention in 1..10_000usize,
        capacity in 1..10_000usize,
        default_priority in 0.0..=1.0f64,
        batch in 1..512usize,
    ) {
        let text = format!(
            r#"
[coordinator]
poll_interval_secs = {poll}
task_timeout_secs = {timeout}
task_retention = {retention}

[buffer]
capacity = {capacity}
default_priority = {default_priority}

[training]
batch_size = {batch}
"#
        );

        let config: Config = toml::from_str(&text).expect("parse");
        config.validate().expect("in-range values validate");

        prop_assert_eq!(config.coordinator.poll_interval_secs, poll);
        prop_assert_eq!(config.coordinator.task_timeout_secs, timeout);
        prop_assert_eq!(config.coordinator.task_retention, retention);
        prop_assert_eq!(config.buffer.capacity, capacity);
        prop_assert_eq!(config.buffer.default_priority, default_priority);
        prop_assert_eq!(config.training.batch_size, batch);

        // Unspecified sections keep their defaults.
        prop_assert_eq!(config.coordinator.stale_after_secs, 60);
        prop_assert_eq!(config.training.min_buffer_size, 100);
    }
}
