//! Bulk registration with partial-failure semantics.

use millrace::{
    BackendError, FifoBackend, InMemoryBackend, JobTemplate, QueueBackend, RawTrigger,
    ScheduleDeclaration, ScheduleFilter, ScheduleOutcome, ScheduleRegistry,
};
use std::sync::Arc;

fn declaration(name: &str, trigger: Option<RawTrigger>) -> ScheduleDeclaration {
    ScheduleDeclaration {
        name: name.to_string(),
        trigger,
        template: JobTemplate::new(name),
        enabled: true,
        explicit_id: None,
    }
}

#[tokio::test]
async fn test_five_declarations_one_invalid_yields_four_successes() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let declarations = vec![
        declaration("hourly", Some(RawTrigger::cron("0 * * * *"))),
        declaration("rapid", Some(RawTrigger::interval_secs(30))),
        declaration("broken", Some(RawTrigger::cron("@sometime"))),
        declaration("weekly", Some(RawTrigger::interval_str("1w"))),
        declaration("launch", Some(RawTrigger::date("2099-06-01T00:00:00Z"))),
    ];

    let outcomes = registry.schedule_all(declarations, false).await;
    assert_eq!(outcomes.len(), 5);

    let registered = outcomes.iter().filter(|o| o.is_registered()).count();
    assert_eq!(registered, 4);

    let failures: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            ScheduleOutcome::Failed { name, error } => Some((name.as_str(), error)),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "broken");

    // The four good schedules are actually in the store.
    let stored = backend.list_schedules(&ScheduleFilter::all()).await.unwrap();
    assert_eq!(stored.len(), 4);
}

#[tokio::test]
async fn test_disabled_and_manual_declarations_are_reported_skipped() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let mut off = declaration("off", Some(RawTrigger::interval_secs(60)));
    off.enabled = false;

    let outcomes = registry
        .schedule_all(
            vec![
                off,
                declaration("manual", None),
                declaration("live", Some(RawTrigger::interval_secs(60))),
            ],
            false,
        )
        .await;

    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, ScheduleOutcome::Skipped { .. }))
        .count();
    assert_eq!(skipped, 2);
    assert_eq!(outcomes.iter().filter(|o| o.is_registered()).count(), 1);
}

#[tokio::test]
async fn test_bulk_against_queue_only_backend_fails_per_item() {
    // A backend without scheduler capability rejects every registration,
    // but the bulk call still yields per-item results instead of raising.
    let backend: Arc<dyn QueueBackend> = Arc::new(FifoBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let outcomes = registry
        .schedule_all(
            vec![
                declaration("a", Some(RawTrigger::interval_secs(60))),
                declaration("b", Some(RawTrigger::interval_secs(120))),
            ],
            false,
        )
        .await;

    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        match outcome {
            ScheduleOutcome::Failed { error, .. } => {
                assert!(error.contains("not supported"), "error was: {}", error);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_unsupported_capability_is_detectable() {
    let backend = FifoBackend::new();
    let err = backend
        .pause_schedule(&millrace::ScheduleId::new("s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Unsupported { .. }));
}
