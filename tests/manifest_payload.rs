use release_sync::{
    load_manifest_file, load_payload_dir, Manifest, ManifestError, ObjectMeta, Payload,
    PayloadError, ResourceKindId,
};
use serde_json::json;
use std::fs;
use tempfile::tempdir;

#[test]
fn api_version_splits_into_group_and_version() {
    let core = ResourceKindId::from_api_version("v1", "ConfigMap").unwrap();
    assert_eq!(core, ResourceKindId::new("", "v1", "ConfigMap"));
    assert_eq!(core.api_version(), "v1");
    let apps = ResourceKindId::from_api_version("apps/v1", "Deployment").unwrap();
    assert_eq!(apps.group, "apps");
    assert_eq!(apps.to_string(), "apps/v1, Kind=Deployment");
    for invalid in ["/v1", "apps/", "a/b/c"] {
        assert!(matches!(
            ResourceKindId::from_api_version(invalid, "X"),
            Err(ManifestError::InvalidApiVersion(_))
        ));
    }
}

#[test]
fn manifest_exposes_identity_and_annotations() {
    let manifest = Manifest::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "namespace": "operators",
            "name": "controller",
            "annotations": {"a": "1"},
        },
    }))
    .unwrap();
    assert_eq!(manifest.namespace(), "operators");
    assert_eq!(manifest.name(), "controller");
    assert_eq!(manifest.annotations().get("a").map(String::as_str), Some("1"));
    assert_eq!(
        manifest.reference().to_string(),
        "Deployment operators/controller (apps/v1)"
    );
}

#[test]
fn cluster_scoped_reference_omits_namespace() {
    let manifest = Manifest::from_json(
        r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "operators"}}"#,
    )
    .unwrap();
    assert_eq!(manifest.reference().to_string(), "Namespace operators (v1)");
}

#[test]
fn malformed_manifests_are_rejected() {
    assert!(matches!(
        Manifest::from_value(json!([1, 2])),
        Err(ManifestError::NotAnObject)
    ));
    assert!(matches!(
        Manifest::from_value(json!({"kind": "ConfigMap", "metadata": {"name": "x"}})),
        Err(ManifestError::MissingField("apiVersion"))
    ));
    assert!(matches!(
        Manifest::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap"})),
        Err(ManifestError::MissingField("metadata.name"))
    ));
    assert!(matches!(
        Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "x", "annotations": {"a": 1}},
        })),
        Err(ManifestError::InvalidMetadata(_))
    ));
    assert!(matches!(
        Manifest::from_json("{not json"),
        Err(ManifestError::Decode(_))
    ));
}

#[test]
fn object_meta_creates_and_updates_metadata() {
    let mut object = json!({"apiVersion": "v1", "kind": "ConfigMap"})
        .as_object()
        .cloned()
        .unwrap();
    {
        let mut meta = ObjectMeta::of(&mut object);
        assert_eq!(meta.name(), None);
        let mut labels = meta.labels();
        labels.insert("app".into(), "sync".into());
        meta.set_labels(labels);
        meta.set_resource_version("7");
        assert_eq!(meta.resource_version(), Some("7"));
    }
    assert_eq!(
        object["metadata"],
        json!({"labels": {"app": "sync"}, "resourceVersion": "7"})
    );
}

#[test]
fn payload_dir_loads_files_in_lexical_order() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("20-config.yaml"),
        concat!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  namespace: default\n  name: first\n",
            "---\n---\n",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  namespace: default\n  name: second\n",
        ),
    )
    .unwrap();
    fs::write(
        dir.path().join("10-namespace.json"),
        r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "default"}}"#,
    )
    .unwrap();
    fs::write(dir.path().join("README.md"), "ignored").unwrap();
    fs::create_dir(dir.path().join("nested.yaml")).unwrap();

    let payload = load_payload_dir(dir.path(), "release", "4.2.0").unwrap();
    assert_eq!(payload.source_id(), "release");
    assert_eq!(payload.version(), "4.2.0");
    let names: Vec<&str> = payload.manifests().iter().map(Manifest::name).collect();
    assert_eq!(names, vec!["default", "first", "second"]);
}

#[test]
fn invalid_document_reports_file_and_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    fs::write(
        &path,
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n---\nkind: ConfigMap\n",
    )
    .unwrap();
    match load_manifest_file(&path) {
        Err(PayloadError::Manifest { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected manifest error, got {other:?}"),
    }
    assert!(matches!(
        load_manifest_file(&dir.path().join("notes.txt")),
        Err(PayloadError::Io { .. })
    ));
}

#[test]
fn digest_tracks_manifest_content_and_order() {
    let config_map = |name: &str| {
        Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name},
        }))
        .unwrap()
    };
    let a = config_map("a");
    let b = config_map("b");
    let forward = Payload::new("s", "v", vec![a.clone(), b.clone()]);
    let same = Payload::new("other", "v2", vec![a.clone(), b.clone()]);
    let reversed = Payload::new("s", "v", vec![b, a]);
    assert_eq!(forward.digest().len(), 64);
    assert_eq!(forward.digest(), same.digest());
    assert_ne!(forward.digest(), reversed.digest());
}
