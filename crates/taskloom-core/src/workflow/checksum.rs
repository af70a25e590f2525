//! Backward-compatible fingerprint of a workflow declaration.
//!
//! The declaration is serialized to JSON, optional fields carrying their
//! default value are removed, and the canonical (key-sorted) string is
//! digested. A declaration written before a field existed therefore hashes
//! the same as one that sets the field to its default, while any non-default
//! value changes the fingerprint.

use serde_json::{Map, Value};
use taskloom_types::error::ValidationIssue;
use taskloom_types::workflow::WorkflowDeclaration;

use crate::error::EngineError;
use crate::service::hash::ContentHasher;

/// Fingerprint a declaration.
pub fn checksum(declaration: &WorkflowDeclaration, hasher: &dyn ContentHasher) -> Result<String, EngineError> {
    let mut value = serde_json::to_value(declaration).map_err(|e| {
        EngineError::Validation(vec![ValidationIssue::new("declaration", e.to_string())])
    })?;
    normalize(&mut value);
    Ok(hasher.compute_hash(&value.to_string()))
}

/// Fingerprint a declaration already in JSON form, such as one stored by an
/// older release. The value is parsed first, so fields it omits hash as
/// their defaults.
pub fn checksum_value(value: Value, hasher: &dyn ContentHasher) -> Result<String, EngineError> {
    let declaration: WorkflowDeclaration = serde_json::from_value(value).map_err(|e| {
        EngineError::Validation(vec![ValidationIssue::new("declaration", e.to_string())])
    })?;
    checksum(&declaration, hasher)
}

/// Strip default-valued optional step fields in place.
pub fn normalize(value: &mut Value) {
    let Some(root) = value.as_object_mut() else {
        return;
    };
    if let Some(Value::Array(jobs)) = root.get_mut("jobs") {
        for job in jobs {
            normalize_job(job);
        }
    }
    if let Some(job) = root.get_mut("on_failure_job") {
        normalize_job(job);
    }
}

fn normalize_job(job: &mut Value) {
    let Some(Value::Array(steps)) = job.get_mut("steps") else {
        return;
    };
    for step in steps {
        if let Some(step) = step.as_object_mut() {
            normalize_step(step);
        }
    }
}

fn normalize_step(step: &mut Map<String, Value>) {
    if step.get("is_durable") == Some(&Value::Bool(false)) {
        step.remove("is_durable");
    }
    if step.get("slot_requests").is_some_and(is_default_slot_request) {
        step.remove("slot_requests");
    }
}

/// No slot requests, or exactly one unit of the default slot type.
fn is_default_slot_request(value: &Value) -> bool {
    match value.as_object() {
        Some(map) if map.is_empty() => true,
        Some(map) => map.len() == 1 && map.get("default").and_then(Value::as_u64) == Some(1),
        None => value.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Returns the canonical string itself so tests can see what was hashed.
    struct IdentityHasher;

    impl ContentHasher for IdentityHasher {
        fn compute_hash(&self, content: &str) -> String {
            content.to_string()
        }
    }

    fn declaration(step: Value) -> WorkflowDeclaration {
        serde_json::from_value(json!({
            "name": "wf",
            "jobs": [{"name": "main", "steps": [step]}],
        }))
        .unwrap()
    }

    /// The JSON an older release stored, before `is_durable` and
    /// `slot_requests` existed.
    fn legacy() -> Value {
        json!({
            "name": "wf",
            "event_triggers": [],
            "cron_triggers": [],
            "jobs": [{
                "name": "main",
                "steps": [{
                    "readable_id": "a",
                    "action": "do:a",
                    "parents": [],
                    "retries": 0,
                    "rate_limits": [],
                    "desired_labels": {},
                }],
            }],
        })
    }

    fn sum(step: Value) -> String {
        checksum(&declaration(step), &IdentityHasher).unwrap()
    }

    #[test]
    fn test_default_durability_matches_legacy() {
        let explicit = sum(json!({"readable_id": "a", "action": "do:a", "is_durable": false}));
        assert_eq!(explicit, checksum_value(legacy(), &IdentityHasher).unwrap());
    }

    #[test]
    fn test_default_slot_request_matches_legacy() {
        let explicit = sum(json!({
            "readable_id": "a",
            "action": "do:a",
            "slot_requests": {"default": 1},
        }));
        assert_eq!(explicit, checksum_value(legacy(), &IdentityHasher).unwrap());
    }

    #[test]
    fn test_durable_step_changes_checksum() {
        let durable = sum(json!({"readable_id": "a", "action": "do:a", "is_durable": true}));
        assert_ne!(durable, checksum_value(legacy(), &IdentityHasher).unwrap());
    }

    #[test]
    fn test_non_default_slot_request_changes_checksum() {
        let gpu = sum(json!({
            "readable_id": "a",
            "action": "do:a",
            "slot_requests": {"gpu": 2},
        }));
        assert_ne!(gpu, checksum_value(legacy(), &IdentityHasher).unwrap());

        let two_default = sum(json!({
            "readable_id": "a",
            "action": "do:a",
            "slot_requests": {"default": 2},
        }));
        assert_ne!(two_default, gpu);
        assert_ne!(two_default, checksum_value(legacy(), &IdentityHasher).unwrap());
    }

    #[test]
    fn test_omitted_fields_hash_as_their_defaults() {
        let sparse = json!({
            "name": "wf",
            "jobs": [{"name": "main", "steps": [{"readable_id": "a", "action": "do:a"}]}],
        });
        assert_eq!(
            checksum_value(sparse, &IdentityHasher).unwrap(),
            checksum_value(legacy(), &IdentityHasher).unwrap()
        );
    }

    #[test]
    fn test_unparseable_value_is_rejected() {
        let err = checksum_value(json!({"jobs": "none"}), &IdentityHasher).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_on_failure_job_is_normalized_too() {
        let mut value = json!({
            "on_failure_job": {"steps": [{"is_durable": false, "slot_requests": {}}]},
        });
        normalize(&mut value);
        assert_eq!(value, json!({"on_failure_job": {"steps": [{}]}}));
    }
}
