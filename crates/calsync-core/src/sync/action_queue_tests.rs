//! Tests for the action_queue module.

#[cfg(test)]
mod tests {
    use super::super::action_queue::*;
    use crate::event::Event;
    use crate::sync::backoff::RetryPolicy;
    use crate::sync::types::{ActionType, EntityType};
    use chrono::{FixedOffset, TimeZone, Utc};
    use proptest::prelude::*;
    use std::time::Duration;

    fn snapshot(id: &str, title: &str) -> Event {
        let tz = FixedOffset::east_opt(3600).unwrap();
        Event::new(
            id,
            "primary",
            title,
            tz.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
        )
    }

    fn no_wait(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn record(queue: &ActionQueue, t: ActionType, id: &str, title: &str, remote: bool) -> RecordOutcome {
        queue
            .record(t, EntityType::Event, id, Some(snapshot(id, title)), remote)
            .unwrap()
    }

    #[test]
    fn test_create_appends() {
        let queue = ActionQueue::open_memory().unwrap();
        let outcome = record(&queue, ActionType::Create, "e1", "A", false);
        assert!(matches!(outcome, RecordOutcome::Appended(_)));
        assert_eq!(queue.len().unwrap(), 1);
        let pending = queue.pending().unwrap();
        assert_eq!(pending[0].action_type, ActionType::Create);
        assert_eq!(pending[0].entity_id, "e1");
    }

    #[test]
    fn test_updates_coalesce_into_one_action() {
        let queue = ActionQueue::open_memory().unwrap();
        record(&queue, ActionType::Update, "e1", "v1", true);
        let outcome = record(&queue, ActionType::Update, "e1", "v2", true);

        assert!(matches!(outcome, RecordOutcome::Coalesced(_)));
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Update);
        assert_eq!(pending[0].data.as_ref().unwrap().title, "v2");
    }

    #[test]
    fn test_update_coalesces_into_queued_create() {
        let queue = ActionQueue::open_memory().unwrap();
        record(&queue, ActionType::Create, "e1", "draft", false);
        record(&queue, ActionType::Update, "e1", "final", false);

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Create);
        assert_eq!(pending[0].data.as_ref().unwrap().title, "final");
    }

    #[test]
    fn test_update_does_not_touch_in_flight_action() {
        let queue = ActionQueue::open_memory().unwrap();
        let RecordOutcome::Appended(first) = record(&queue, ActionType::Create, "e1", "v1", false)
        else {
            panic!("expected append");
        };
        assert!(queue.begin_flight(&first.id).unwrap());

        let outcome = record(&queue, ActionType::Update, "e1", "v2", false);
        assert!(matches!(outcome, RecordOutcome::Appended(_)));

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].data.as_ref().unwrap().title, "v1");
        assert_eq!(pending[1].data.as_ref().unwrap().title, "v2");
    }

    #[test]
    fn test_delete_of_never_synced_entity_is_discarded() {
        let queue = ActionQueue::open_memory().unwrap();
        record(&queue, ActionType::Create, "e1", "A", false);
        record(&queue, ActionType::Update, "e1", "B", false);

        let outcome = queue
            .record(ActionType::Delete, EntityType::Event, "e1", None, false)
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Discarded { superseded: 1 });
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_delete_of_synced_entity_supersedes_updates() {
        let queue = ActionQueue::open_memory().unwrap();
        record(&queue, ActionType::Update, "e1", "B", true);
        let outcome = queue
            .record(ActionType::Delete, EntityType::Event, "e1", None, true)
            .unwrap();

        assert!(matches!(outcome, RecordOutcome::Appended(_)));
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Delete);
    }

    #[test]
    fn test_delete_kept_when_create_in_flight() {
        let queue = ActionQueue::open_memory().unwrap();
        let RecordOutcome::Appended(create) = record(&queue, ActionType::Create, "e1", "A", false)
        else {
            panic!("expected append");
        };
        queue.begin_flight(&create.id).unwrap();

        let outcome = queue
            .record(ActionType::Delete, EntityType::Event, "e1", None, false)
            .unwrap();
        assert!(matches!(outcome, RecordOutcome::Appended(_)));

        let types: Vec<_> = queue.pending().unwrap().iter().map(|a| a.action_type).collect();
        assert_eq!(types, vec![ActionType::Create, ActionType::Delete]);
    }

    #[test]
    fn test_pending_is_ordered_by_timestamp() {
        let queue = ActionQueue::open_memory().unwrap();
        for id in ["c", "a", "b"] {
            record(&queue, ActionType::Create, id, id, false);
        }
        let pending = queue.pending().unwrap();
        let ids: Vec<_> = pending.iter().map(|a| a.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(pending.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_mark_synchronized_then_purge() {
        let queue = ActionQueue::open_memory().unwrap();
        let RecordOutcome::Appended(action) = record(&queue, ActionType::Create, "e1", "A", false)
        else {
            panic!("expected append");
        };
        queue.begin_flight(&action.id).unwrap();
        queue.mark_synchronized(&action.id).unwrap();

        assert_eq!(queue.len().unwrap(), 0);
        assert_eq!(queue.snapshot().unwrap().len(), 1);
        assert!(!queue.is_in_flight(&action.id).unwrap());

        assert_eq!(queue.purge_synchronized().unwrap(), 1);
        assert!(queue.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_mark_failed_retries_then_dead_letters() {
        let queue = ActionQueue::open_memory().unwrap();
        let RecordOutcome::Appended(action) = record(&queue, ActionType::Create, "e1", "A", false)
        else {
            panic!("expected append");
        };
        let policy = no_wait(3);
        let now = Utc::now();

        for expected in 1..3 {
            match queue.mark_failed(&action.id, "503", &policy, now).unwrap() {
                FailureDisposition::Retrying { retry_count, .. } => assert_eq!(retry_count, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        let last = queue.mark_failed(&action.id, "503", &policy, now).unwrap();
        let FailureDisposition::DeadLettered(letter) = last else {
            panic!("expected dead letter");
        };
        assert_eq!(letter.action.retry_count, 3);
        assert_eq!(letter.error, "503");
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.dead_letter_count().unwrap(), 1);
        assert_eq!(queue.dead_letters().unwrap()[0].action.id, action.id);
    }

    #[test]
    fn test_mark_failed_sets_backoff_gate() {
        let queue = ActionQueue::open_memory().unwrap();
        let RecordOutcome::Appended(action) = record(&queue, ActionType::Create, "e1", "A", false)
        else {
            panic!("expected append");
        };
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
        };
        let now = Utc::now();
        let FailureDisposition::Retrying { next_attempt_at, .. } =
            queue.mark_failed(&action.id, "timeout", &policy, now).unwrap()
        else {
            panic!("expected retry");
        };
        assert!(next_attempt_at >= now);
        assert!(next_attempt_at <= now + chrono::Duration::seconds(10));

        let stored = queue.get(&action.id).unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
        assert_eq!(stored.next_attempt_at, Some(next_attempt_at));
    }

    #[test]
    fn test_dead_letter_immediately() {
        let queue = ActionQueue::open_memory().unwrap();
        let RecordOutcome::Appended(action) = record(&queue, ActionType::Update, "e1", "A", true)
        else {
            panic!("expected append");
        };
        let letter = queue.dead_letter(&action.id, "not found", Utc::now()).unwrap();
        assert_eq!(letter.action.retry_count, 0);
        assert!(queue.is_empty().unwrap());
        assert!(queue.mark_synchronized(&action.id).is_err());
    }

    #[test]
    fn test_persist_and_reload() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("calsync.db");
        let first_id = {
            let queue = ActionQueue::open(&path).unwrap();
            record(&queue, ActionType::Create, "e1", "A", false);
            record(&queue, ActionType::Update, "e2", "B", true);
            queue.pending().unwrap()[0].id.clone()
        };

        let queue = ActionQueue::open(&path).unwrap();
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first_id);
        assert_eq!(pending[1].data.as_ref().unwrap().title, "B");

        // Timestamps keep increasing after a reload.
        let next = queue.next_timestamp().unwrap();
        assert!(next > pending[1].timestamp);
    }

    proptest! {
        #[test]
        fn prop_consecutive_updates_leave_one_action(titles in prop::collection::vec("[a-z]{1,8}", 1..20)) {
            let queue = ActionQueue::open_memory().unwrap();
            for title in &titles {
                record(&queue, ActionType::Update, "e1", title, true);
            }
            let pending = queue.pending().unwrap();
            prop_assert_eq!(pending.len(), 1);
            prop_assert_eq!(&pending[0].data.as_ref().unwrap().title, titles.last().unwrap());
        }

        #[test]
        fn prop_per_entity_creation_order_survives_interleaving(
            ops in prop::collection::vec((0usize..3, any::<bool>()), 1..30)
        ) {
            let queue = ActionQueue::open_memory().unwrap();
            let ids = ["a", "b", "c"];
            for (i, (entity, is_create)) in ops.iter().enumerate() {
                let t = if *is_create { ActionType::Create } else { ActionType::Update };
                let title = i.to_string();
                record(&queue, t, ids[*entity], &title, true);
            }
            let pending = queue.pending().unwrap();
            prop_assert!(pending.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        }
    }
}
