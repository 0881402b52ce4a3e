use release_sync::{
    ApiResource, BackoffPolicy, BuilderFactory, CancelToken, CauseKind, ClusterApplier,
    ClusterError, ClusterVerb, DynamicClient, EngineStatus, InMemoryCluster, Manifest, ManifestApplier, ManifestRef,
    ObjectModifier, Payload, QueueStatusSink, ResourceBuilder, ResourceKindId, ResourceMapper,
    SyncEngine, SyncError, SyncPhase, DEFAULT_REQUEUE_ANNOTATION_KEY,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Actions = Arc<Mutex<Vec<ManifestRef>>>;
type Reactors = Arc<HashMap<ManifestRef, ClusterError>>;

struct RecordingBuilder {
    actions: Actions,
    reactors: Reactors,
    target: ManifestRef,
}

impl ResourceBuilder for RecordingBuilder {
    fn with_modifier(&mut self, _modifier: ObjectModifier) {}

    fn commit(self: Box<Self>) -> Result<(), ClusterError> {
        self.actions.lock().unwrap().push(self.target.clone());
        match self.reactors.get(&self.target) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn recording_factory(actions: &Actions, reactors: &Reactors) -> BuilderFactory {
    let actions = actions.clone();
    let reactors = reactors.clone();
    Arc::new(move |_client: Arc<dyn DynamicClient>, manifest: &Manifest| {
        Box::new(RecordingBuilder {
            actions: actions.clone(),
            reactors: reactors.clone(),
            target: manifest.reference(),
        }) as Box<dyn ResourceBuilder>
    })
}

fn test_kind(kind: &str) -> ResourceKindId {
    ResourceKindId::new("test.sync.io", "v1", kind)
}

fn manifest(kind: &str, name: &str, requeue: Option<&str>) -> Manifest {
    let mut metadata = json!({"namespace": "default", "name": name});
    if let Some(value) = requeue {
        metadata["annotations"] = json!({ DEFAULT_REQUEUE_ANNOTATION_KEY: value });
    }
    Manifest::from_value(json!({
        "apiVersion": "test.sync.io/v1",
        "kind": kind,
        "metadata": metadata,
    }))
    .expect("valid manifest")
}

struct Harness {
    actions: Actions,
    engine: SyncEngine<ClusterApplier>,
    statuses: QueueStatusSink,
}

fn harness(reactors: Vec<(ManifestRef, ClusterError)>) -> Harness {
    let actions: Actions = Arc::default();
    let reactors: Reactors = Arc::new(reactors.into_iter().collect());
    let mut mapper = ResourceMapper::new();
    mapper.register(test_kind("TestA"), recording_factory(&actions, &reactors));
    mapper.register(test_kind("TestB"), recording_factory(&actions, &reactors));
    let applier = ClusterApplier::new(Arc::new(InMemoryCluster::new()), mapper);
    let statuses = QueueStatusSink::new(256);
    let engine = SyncEngine::new(applier)
        .with_backoff(BackoffPolicy::immediate(3))
        .with_status_sink(Arc::new(statuses.clone()));
    Harness {
        actions,
        engine,
        statuses,
    }
}

fn recorded(actions: &Actions) -> Vec<String> {
    actions
        .lock()
        .unwrap()
        .iter()
        .map(|action| action.name.clone())
        .collect()
}

fn payload(manifests: Vec<Manifest>) -> Payload {
    Payload::new("test", "v0.0.0", manifests)
}

#[test]
fn applies_every_manifest_once_in_order() {
    let h = harness(vec![]);
    let payload = payload(vec![
        manifest("TestA", "testa", None),
        manifest("TestB", "testb", None),
    ]);
    let summary = h.engine.apply_payload(&payload, &CancelToken::new()).unwrap();
    assert_eq!(recorded(&h.actions), vec!["testa", "testb"]);
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.recovered, 0);
}

#[test]
fn unannotated_failure_aborts_after_exhausting_attempts() {
    let a = manifest("TestA", "testa", None);
    let h = harness(vec![(a.reference(), ClusterError::no_match("no kind TestA"))]);
    let payload = payload(vec![a.clone(), manifest("TestB", "testb", None)]);
    let err = h
        .engine
        .apply_payload(&payload, &CancelToken::new())
        .unwrap_err();
    assert_eq!(recorded(&h.actions), vec!["testa", "testa", "testa"]);
    let apply = err.apply_error().expect("apply error");
    assert_eq!(apply.manifest(), &a.reference());
    assert_eq!(apply.attempts(), 3);
    assert_eq!(apply.cause().kind(), CauseKind::NoMatch);
}

#[test]
fn annotated_failure_is_deferred_and_retried_after_the_payload() {
    let a = manifest("TestA", "testa", Some("NoMatch"));
    let h = harness(vec![(a.reference(), ClusterError::no_match("no kind TestA"))]);
    let payload = payload(vec![a.clone(), manifest("TestB", "testb", None)]);
    let err = h
        .engine
        .apply_payload(&payload, &CancelToken::new())
        .unwrap_err();
    assert_eq!(
        recorded(&h.actions),
        vec!["testa", "testa", "testa", "testb", "testa", "testa", "testa"]
    );
    assert_eq!(err.apply_error().unwrap().manifest(), &a.reference());
}

#[test]
fn deferred_retry_stops_at_first_fatal_failure() {
    let a = manifest("TestA", "testa", Some("NoMatch"));
    let b = manifest("TestB", "testb", Some("NoMatch"));
    let h = harness(vec![
        (a.reference(), ClusterError::no_match("no kind TestA")),
        (b.reference(), ClusterError::no_match("no kind TestB")),
    ]);
    let payload = payload(vec![a.clone(), b]);
    let err = h
        .engine
        .apply_payload(&payload, &CancelToken::new())
        .unwrap_err();
    assert_eq!(
        recorded(&h.actions),
        vec![
            "testa", "testa", "testa", "testb", "testb", "testb", "testa", "testa", "testa"
        ]
    );
    assert_eq!(err.apply_error().unwrap().manifest(), &a.reference());
}

#[test]
fn retry_later_defers_without_annotation() {
    let a = manifest("TestA", "testa", None);
    let h = harness(vec![(
        a.reference(),
        ClusterError::retry_later("not established"),
    )]);
    let payload = payload(vec![a, manifest("TestB", "testb", None)]);
    let err = h
        .engine
        .apply_payload(&payload, &CancelToken::new())
        .unwrap_err();
    assert_eq!(recorded(&h.actions).len(), 7);
    assert_eq!(
        err.apply_error().unwrap().cause().kind(),
        CauseKind::RetryLater
    );
}

#[test]
fn not_found_does_not_satisfy_no_match_matcher() {
    let a = manifest("TestA", "testa", Some("NoMatch"));
    let h = harness(vec![(
        a.reference(),
        ClusterError::not_found("namespaces \"default\" not found").with_status(404),
    )]);
    let payload = payload(vec![a, manifest("TestB", "testb", None)]);
    assert!(h
        .engine
        .apply_payload(&payload, &CancelToken::new())
        .is_err());
    assert_eq!(recorded(&h.actions), vec!["testa", "testa", "testa"]);
}

/// Applier that fails each manifest a fixed number of times before succeeding.
struct FlakyApplier {
    failures: Mutex<HashMap<String, usize>>,
    cause: ClusterError,
    calls: Mutex<Vec<String>>,
}

impl FlakyApplier {
    fn new(failures: &[(&str, usize)], cause: ClusterError) -> Self {
        Self {
            failures: Mutex::new(
                failures
                    .iter()
                    .map(|(name, count)| (name.to_string(), *count))
                    .collect(),
            ),
            cause,
            calls: Mutex::default(),
        }
    }
}

impl ManifestApplier for FlakyApplier {
    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError> {
        self.calls.lock().unwrap().push(manifest.name().to_string());
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(manifest.name()) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(self.cause.clone())
            }
            _ => Ok(()),
        }
    }
}

#[test]
fn transient_failure_recovers_within_attempt_budget() {
    let applier = Arc::new(FlakyApplier::new(&[("testa", 2)], ClusterError::other("boom")));
    let engine = SyncEngine::new(applier.clone()).with_backoff(BackoffPolicy::immediate(3));
    let payload = payload(vec![
        manifest("TestA", "testa", None),
        manifest("TestB", "testb", None),
    ]);
    let summary = engine.apply_payload(&payload, &CancelToken::new()).unwrap();
    assert_eq!(summary.attempts, 4);
    assert_eq!(summary.applied, 2);
    assert_eq!(
        *applier.calls.lock().unwrap(),
        vec!["testa", "testa", "testa", "testb"]
    );
}

#[test]
fn deferred_manifest_succeeds_in_retry_pass() {
    let applier = Arc::new(FlakyApplier::new(
        &[("testa", 3)],
        ClusterError::no_match("no kind TestA"),
    ));
    let sink = QueueStatusSink::new(256);
    let engine = SyncEngine::new(applier.clone())
        .with_backoff(BackoffPolicy::immediate(3))
        .with_status_sink(Arc::new(sink.clone()));
    let payload = payload(vec![
        manifest("TestA", "testa", Some("NoMatch")),
        manifest("TestB", "testb", None),
    ]);
    let summary = engine.apply_payload(&payload, &CancelToken::new()).unwrap();
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.attempts, 5);
    assert_eq!(
        *applier.calls.lock().unwrap(),
        vec!["testa", "testa", "testa", "testb", "testa"]
    );
    let statuses = sink.drain();
    assert!(statuses.iter().any(|s| s.phase == SyncPhase::Deferred));
    let last = statuses.last().unwrap();
    assert_eq!(last.phase, SyncPhase::Completed);
    assert_eq!(last.fraction(), 1.0);
}

#[test]
fn status_counters_never_decrease() {
    let a = manifest("TestA", "testa", Some("NoMatch"));
    let h = harness(vec![(a.reference(), ClusterError::no_match("no kind TestA"))]);
    let payload = payload(vec![a, manifest("TestB", "testb", None)]);
    let _ = h.engine.apply_payload(&payload, &CancelToken::new());
    let statuses: Vec<EngineStatus> = h.statuses.drain();
    assert!(!statuses.is_empty());
    for pair in statuses.windows(2) {
        assert!(pair[1].attempted >= pair[0].attempted);
        assert!(pair[1].succeeded >= pair[0].succeeded);
        assert!(pair[1].deferred >= pair[0].deferred);
    }
    let last = statuses.last().unwrap();
    assert_eq!(last.phase, SyncPhase::Failed);
    assert!(last.is_terminal());
    assert_eq!(last.attempted, 7);
    assert_eq!(last.succeeded, 1);
    assert_eq!(last.deferred, 1);
    assert!(last.last_error.is_some());
}

#[test]
fn cancelled_token_stops_before_the_first_attempt() {
    let h = harness(vec![]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let payload = payload(vec![manifest("TestA", "testa", None)]);
    let err = h.engine.apply_payload(&payload, &cancel).unwrap_err();
    assert_eq!(err, SyncError::Cancelled);
    assert!(recorded(&h.actions).is_empty());
    assert_eq!(h.statuses.latest().unwrap().phase, SyncPhase::Cancelled);
}

#[test]
fn cancellation_interrupts_backoff_sleep() {
    let applier = Arc::new(FlakyApplier::new(&[("testa", 5)], ClusterError::other("boom")));
    let backoff = BackoffPolicy {
        max_attempts: 3,
        initial_delay: std::time::Duration::from_secs(60),
        factor: 2.0,
        cap: std::time::Duration::from_secs(120),
        jitter: 0.0,
    };
    let engine = SyncEngine::new(applier.clone()).with_backoff(backoff);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        trigger.cancel();
    });
    let payload = payload(vec![manifest("TestA", "testa", None)]);
    let started = std::time::Instant::now();
    let err = engine.apply_payload(&payload, &cancel).unwrap_err();
    handle.join().unwrap();
    assert_eq!(err, SyncError::Cancelled);
    assert!(started.elapsed() < std::time::Duration::from_secs(30));
    assert_eq!(applier.calls.lock().unwrap().len(), 1);
}

#[test]
fn empty_payload_completes_immediately() {
    let h = harness(vec![]);
    let summary = h
        .engine
        .apply_payload(&payload(vec![]), &CancelToken::new())
        .unwrap();
    assert_eq!(summary.attempts, 0);
    assert_eq!(h.statuses.latest().unwrap().phase, SyncPhase::Completed);
}

#[test]
fn reapplying_an_applied_payload_only_updates() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.register_kind(ApiResource::new(test_kind("TestA"), "testas", true));
    cluster.register_kind(ApiResource::new(test_kind("TestB"), "testbs", true));
    let applier = ClusterApplier::new(cluster.clone(), ResourceMapper::new());
    let engine = SyncEngine::new(applier).with_backoff(BackoffPolicy::immediate(3));
    let payload = payload(vec![
        manifest("TestA", "testa", None),
        manifest("TestB", "testb", None),
    ]);

    let first = engine.apply_payload(&payload, &CancelToken::new()).unwrap();
    assert_eq!(first.applied, 2);
    let objects = cluster.object_count();
    let first_actions = cluster.actions().len();

    let second = engine.apply_payload(&payload, &CancelToken::new()).unwrap();
    assert_eq!(second.applied, 2);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.recovered, 0);
    assert_eq!(cluster.object_count(), objects);
    let verbs: Vec<ClusterVerb> = cluster.actions()[first_actions..]
        .iter()
        .map(|action| action.verb)
        .collect();
    assert_eq!(
        verbs,
        vec![
            ClusterVerb::Get,
            ClusterVerb::Update,
            ClusterVerb::Get,
            ClusterVerb::Update
        ]
    );
}

#[test]
fn invalid_backoff_is_clamped_before_it_reaches_the_engine() {
    let unbounded = BackoffPolicy {
        max_attempts: 80,
        initial_delay: std::time::Duration::from_secs(10),
        factor: 2.0,
        cap: std::time::Duration::ZERO,
        jitter: 0.0,
    };
    let engine = SyncEngine::new(Arc::new(FlakyApplier::new(&[], ClusterError::other("boom"))))
        .with_backoff(unbounded);
    assert!(engine.backoff().validate().is_ok());
    assert_eq!(engine.backoff().cap, BackoffPolicy::default().cap);
    assert!(engine
        .backoff()
        .schedule()
        .all(|delay| delay <= BackoffPolicy::default().cap));
}
