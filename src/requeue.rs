use crate::error::{CauseKind, Classified};
use crate::manifest::Manifest;
use std::collections::BTreeMap;

/// Annotation opting a manifest into the deferred pass for listed error conditions.
pub const DEFAULT_REQUEUE_ANNOTATION_KEY: &str = "v1.release-sync.io/requeue-on-error";

/// Matcher names understood in the requeue annotation.
pub const KNOWN_REQUEUE_MATCHERS: &[&str] = &["NoMatch", "NotFound"];

/// Decides whether a manifest's final apply error defers it instead of aborting the sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeuePolicy {
    annotation_key: String,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEUE_ANNOTATION_KEY)
    }
}

impl RequeuePolicy {
    pub fn new(annotation_key: impl Into<String>) -> Self {
        Self {
            annotation_key: annotation_key.into(),
        }
    }

    pub fn annotation_key(&self) -> &str {
        &self.annotation_key
    }

    /// Parses the requeue annotation, returning whether it is present and its
    /// matcher names in declaration order.
    pub fn requeue_matchers(&self, annotations: &BTreeMap<String, String>) -> (bool, Vec<String>) {
        match annotations.get(&self.annotation_key) {
            Some(value) => (
                true,
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|matcher| !matcher.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            None => (false, Vec::new()),
        }
    }

    /// Returns true when `err` should defer `manifest` to the deferred pass.
    pub fn should_requeue<E: Classified>(&self, err: Option<&E>, manifest: &Manifest) -> bool {
        let Some(err) = err else {
            return false;
        };
        let kind = err.cause_kind();
        if kind == CauseKind::RetryLater {
            return true;
        }
        let (present, matchers) = self.requeue_matchers(manifest.annotations());
        if !present || matchers.is_empty() {
            return false;
        }
        match kind.matcher_name() {
            Some(name) => matchers.iter().any(|matcher| matcher == name),
            None => false,
        }
    }
}

/// Returns matcher names in `matchers` that the evaluator does not recognise.
pub fn unknown_matchers(matchers: &[String]) -> Vec<&str> {
    matchers
        .iter()
        .map(String::as_str)
        .filter(|matcher| !KNOWN_REQUEUE_MATCHERS.contains(matcher))
        .collect()
}
