use release_sync::{
    unknown_matchers, ApplyError, ClusterError, Manifest, RequeuePolicy,
    DEFAULT_REQUEUE_ANNOTATION_KEY,
};
use serde_json::json;
use std::collections::BTreeMap;

fn config_map(annotations: Option<&str>) -> Manifest {
    let mut metadata = json!({"name": "cm", "namespace": "default"});
    if let Some(value) = annotations {
        metadata["annotations"] = json!({ DEFAULT_REQUEUE_ANNOTATION_KEY: value });
    }
    Manifest::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": metadata,
    }))
    .expect("valid manifest")
}

fn wrapped(cause: ClusterError, manifest: &Manifest) -> ApplyError {
    ApplyError::new(manifest.reference(), 3, cause)
}

fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[test]
fn matchers_absent_without_annotation() {
    let policy = RequeuePolicy::default();
    assert_eq!(policy.requeue_matchers(&BTreeMap::new()), (false, vec![]));
    assert_eq!(
        policy.requeue_matchers(&annotations(&[("dummy", "dummy")])),
        (false, vec![])
    );
}

#[test]
fn matchers_parsed_in_declaration_order() {
    let policy = RequeuePolicy::default();
    assert_eq!(
        policy.requeue_matchers(&annotations(&[(DEFAULT_REQUEUE_ANNOTATION_KEY, "NoMatch")])),
        (true, vec!["NoMatch".to_string()])
    );
    assert_eq!(
        policy.requeue_matchers(&annotations(&[(
            DEFAULT_REQUEUE_ANNOTATION_KEY,
            "NoMatch,NotFound"
        )])),
        (true, vec!["NoMatch".to_string(), "NotFound".to_string()])
    );
}

#[test]
fn matchers_trim_whitespace_and_skip_empty_entries() {
    let policy = RequeuePolicy::default();
    assert_eq!(
        policy.requeue_matchers(&annotations(&[(
            DEFAULT_REQUEUE_ANNOTATION_KEY,
            " NotFound , ,NoMatch,"
        )])),
        (true, vec!["NotFound".to_string(), "NoMatch".to_string()])
    );
    assert_eq!(
        policy.requeue_matchers(&annotations(&[(DEFAULT_REQUEUE_ANNOTATION_KEY, "")])),
        (true, vec![])
    );
}

#[test]
fn custom_annotation_key_is_honoured() {
    let policy = RequeuePolicy::new("example.com/requeue");
    assert_eq!(policy.annotation_key(), "example.com/requeue");
    let parsed = policy.requeue_matchers(&annotations(&[
        (DEFAULT_REQUEUE_ANNOTATION_KEY, "NoMatch"),
        ("example.com/requeue", "NotFound"),
    ]));
    assert_eq!(parsed, (true, vec!["NotFound".to_string()]));
}

#[test]
fn no_error_never_requeues() {
    let policy = RequeuePolicy::default();
    let manifest = config_map(Some("NoMatch,NotFound"));
    assert!(!policy.should_requeue::<ClusterError>(None, &manifest));
}

#[test]
fn unannotated_manifest_does_not_requeue_ordinary_errors() {
    let policy = RequeuePolicy::default();
    let manifest = config_map(None);
    for cause in [
        ClusterError::other("random error"),
        ClusterError::no_match("no matches for kind"),
        ClusterError::not_found("missing"),
    ] {
        assert!(!policy.should_requeue(Some(&cause), &manifest));
        let err = wrapped(cause, &manifest);
        assert!(!policy.should_requeue(Some(&err), &manifest));
    }
}

#[test]
fn listed_matcher_requeues_raw_and_wrapped_causes() {
    let policy = RequeuePolicy::default();
    let manifest = config_map(Some("NoMatch"));
    let cause = ClusterError::no_match("no matches for kind");
    assert!(policy.should_requeue(Some(&cause), &manifest));
    assert!(policy.should_requeue(Some(&wrapped(cause, &manifest)), &manifest));
}

#[test]
fn unlisted_matcher_does_not_requeue() {
    let policy = RequeuePolicy::default();
    let manifest = config_map(Some("NotFound"));
    let cause = ClusterError::no_match("no matches for kind");
    assert!(!policy.should_requeue(Some(&cause), &manifest));
    assert!(!policy.should_requeue(Some(&wrapped(cause, &manifest)), &manifest));
}

#[test]
fn not_found_is_not_a_no_match() {
    let policy = RequeuePolicy::default();
    let manifest = config_map(Some("NoMatch"));
    let cause = ClusterError::not_found("namespaces \"default\" not found").with_status(404);
    assert!(!policy.should_requeue(Some(&cause), &manifest));

    let manifest = config_map(Some("NotFound"));
    assert!(policy.should_requeue(Some(&cause), &manifest));
}

#[test]
fn other_causes_never_requeue_even_when_annotated() {
    let policy = RequeuePolicy::default();
    let manifest = config_map(Some("NoMatch,NotFound"));
    let cause = ClusterError::other("Internal error occurred: dummy").with_status(500);
    assert!(!policy.should_requeue(Some(&cause), &manifest));
    assert!(!policy.should_requeue(Some(&wrapped(cause, &manifest)), &manifest));
}

#[test]
fn retry_later_requeues_without_annotation() {
    let policy = RequeuePolicy::default();
    let manifest = config_map(None);
    let cause = ClusterError::retry_later("definition not yet established");
    assert!(policy.should_requeue(Some(&cause), &manifest));
    assert!(policy.should_requeue(Some(&wrapped(cause, &manifest)), &manifest));
}

#[test]
fn unknown_matchers_are_reported() {
    let matchers = vec![
        "NoMatch".to_string(),
        "Conflict".to_string(),
        "NotFound".to_string(),
        "nomatch".to_string(),
    ];
    assert_eq!(unknown_matchers(&matchers), vec!["Conflict", "nomatch"]);
}
