//! Declaration validation.
//!
//! A pure function over the declaration returning every problem found, so a
//! client sees the whole list at once instead of fixing issues one by one.

use std::collections::HashSet;

use taskloom_types::config::MAX_DURATION_SECS;
use taskloom_types::error::ValidationIssue;
use taskloom_types::run::{MAX_PRIORITY, MIN_PRIORITY};
use taskloom_types::workflow::{JobDeclaration, WorkflowDeclaration};

use super::dag::topological_steps;
use super::schedule::parse_schedule;

/// Every issue with `declaration`. Empty means valid.
pub fn validate_declaration(declaration: &WorkflowDeclaration) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if declaration.name.trim().is_empty() {
        issues.push(ValidationIssue::new("name", "must not be empty"));
    }
    if declaration.jobs.is_empty() {
        issues.push(ValidationIssue::new("jobs", "at least one job is required"));
    }

    let mut job_names = HashSet::new();
    for (i, job) in declaration.jobs.iter().enumerate() {
        let path = format!("jobs[{i}]");
        if !job_names.insert(job.name.as_str()) {
            issues.push(ValidationIssue::new(&path, format!("duplicate job name '{}'", job.name)));
        }
        validate_job(&path, job, &mut issues);
    }
    if let Some(job) = &declaration.on_failure_job {
        if job_names.contains(job.name.as_str()) {
            issues.push(ValidationIssue::new(
                "on_failure_job",
                format!("duplicate job name '{}'", job.name),
            ));
        }
        validate_job("on_failure_job", job, &mut issues);
    }

    for (i, key) in declaration.event_triggers.iter().enumerate() {
        if key.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("event_triggers[{i}]"), "must not be empty"));
        }
    }
    for (i, expression) in declaration.cron_triggers.iter().enumerate() {
        if let Err(e) = parse_schedule(expression) {
            issues.push(ValidationIssue::new(format!("cron_triggers[{i}]"), e.to_string()));
        }
    }

    if let Some(priority) = declaration.default_priority {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            issues.push(ValidationIssue::new(
                "default_priority",
                format!("must be between {MIN_PRIORITY} and {MAX_PRIORITY}"),
            ));
        }
    }

    if let Some(concurrency) = &declaration.concurrency {
        match (&concurrency.expression, &concurrency.action) {
            (None, None) => issues.push(ValidationIssue::new(
                "concurrency",
                "one of 'expression' or 'action' is required",
            )),
            (Some(_), Some(_)) => issues.push(ValidationIssue::new(
                "concurrency",
                "'expression' and 'action' are mutually exclusive",
            )),
            (Some(expression), None) if expression.trim().is_empty() => {
                issues.push(ValidationIssue::new("concurrency.expression", "must not be empty"))
            }
            (None, Some(action)) if action.trim().is_empty() => {
                issues.push(ValidationIssue::new("concurrency.action", "must not be empty"))
            }
            _ => {}
        }
        if concurrency.max_runs == 0 {
            issues.push(ValidationIssue::new("concurrency.max_runs", "must be at least 1"));
        }
    }

    issues
}

fn validate_job(path: &str, job: &JobDeclaration, issues: &mut Vec<ValidationIssue>) {
    if job.name.trim().is_empty() {
        issues.push(ValidationIssue::new(format!("{path}.name"), "must not be empty"));
    }
    if job.steps.is_empty() {
        issues.push(ValidationIssue::new(format!("{path}.steps"), "at least one step is required"));
        return;
    }

    let mut ids = HashSet::new();
    let mut duplicate = false;
    for (i, step) in job.steps.iter().enumerate() {
        let step_path = format!("{path}.steps[{i}]");
        if step.readable_id.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("{step_path}.readable_id"), "must not be empty"));
        }
        if !ids.insert(step.readable_id.as_str()) {
            duplicate = true;
            issues.push(ValidationIssue::new(
                &step_path,
                format!("duplicate step id '{}'", step.readable_id),
            ));
        }
        if step.action.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("{step_path}.action"), "must not be empty"));
        }
        if step.timeout_secs.is_some_and(|secs| !(1..=MAX_DURATION_SECS).contains(&secs)) {
            issues.push(ValidationIssue::new(
                format!("{step_path}.timeout_secs"),
                format!("must be between 1 and {MAX_DURATION_SECS}"),
            ));
        }
        for (j, limit) in step.rate_limits.iter().enumerate() {
            if limit.key.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("{step_path}.rate_limits[{j}].key"),
                    "must not be empty",
                ));
            }
            if limit.units <= 0 {
                issues.push(ValidationIssue::new(
                    format!("{step_path}.rate_limits[{j}].units"),
                    "must be positive",
                ));
            }
        }
        for (slot, units) in &step.slot_requests {
            if *units == 0 {
                issues.push(ValidationIssue::new(
                    format!("{step_path}.slot_requests.{slot}"),
                    "must be at least 1",
                ));
            }
        }
    }

    // The graph check keys steps by id, so it is meaningless with duplicates.
    if !duplicate {
        if let Err(e) = topological_steps(&job.steps) {
            issues.push(ValidationIssue::new(format!("{path}.steps"), e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: serde_json::Value) -> WorkflowDeclaration {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_declaration_has_no_issues() {
        let decl = parse(json!({
            "name": "wf",
            "cron_triggers": ["*/5 * * * *"],
            "concurrency": {"expression": "input.tenant", "max_runs": 2},
            "jobs": [{"name": "main", "steps": [
                {"readable_id": "a", "action": "do:a"},
                {"readable_id": "b", "action": "do:b", "parents": ["a"]},
            ]}],
        }));
        assert!(validate_declaration(&decl).is_empty());
    }

    #[test]
    fn test_collects_every_issue() {
        let decl = parse(json!({
            "name": "",
            "default_priority": 9,
            "concurrency": {"max_runs": 0},
            "jobs": [{"name": "main", "steps": [
                {"readable_id": "a", "action": "do:a", "parents": ["b"]},
                {"readable_id": "b", "action": "do:b", "parents": ["a"],
                 "rate_limits": [{"key": "api", "units": 0}]},
            ]}],
        }));
        let issues = validate_declaration(&decl);
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"name"));
        assert!(paths.contains(&"default_priority"));
        assert!(paths.contains(&"concurrency"));
        assert!(paths.contains(&"concurrency.max_runs"));
        assert!(paths.contains(&"jobs[0].steps[1].rate_limits[0].units"));
        assert!(issues.iter().any(|i| i.message.contains("cycle")));
    }

    #[test]
    fn test_duplicate_ids_and_job_names() {
        let decl = parse(json!({
            "name": "wf",
            "jobs": [
                {"name": "main", "steps": [
                    {"readable_id": "a", "action": "do:a"},
                    {"readable_id": "a", "action": "do:a"},
                ]},
                {"name": "main", "steps": [{"readable_id": "x", "action": "do:x"}]},
            ],
        }));
        let issues = validate_declaration(&decl);
        assert!(issues.iter().any(|i| i.message == "duplicate step id 'a'"));
        assert!(issues.iter().any(|i| i.message == "duplicate job name 'main'"));
    }

    #[test]
    fn test_bad_cron_and_exclusive_concurrency() {
        let decl = parse(json!({
            "name": "wf",
            "cron_triggers": ["whenever"],
            "concurrency": {"expression": "input.k", "action": "key:get"},
            "jobs": [{"name": "main", "steps": [{"readable_id": "a", "action": "do:a"}]}],
        }));
        let paths: Vec<String> = validate_declaration(&decl).into_iter().map(|i| i.path).collect();
        assert_eq!(paths, vec!["cron_triggers[0]".to_string(), "concurrency".to_string()]);
    }

    #[test]
    fn test_step_timeout_must_fit_a_deadline() {
        let decl = parse(json!({
            "name": "wf",
            "jobs": [{"name": "main", "steps": [
                {"readable_id": "a", "action": "do:a", "timeout_secs": 3600},
                {"readable_id": "b", "action": "do:b", "timeout_secs": 18446744073709551u64},
                {"readable_id": "c", "action": "do:c", "timeout_secs": 0},
            ]}],
        }));
        let paths: Vec<String> = validate_declaration(&decl).into_iter().map(|i| i.path).collect();
        assert_eq!(
            paths,
            vec![
                "jobs[0].steps[1].timeout_secs".to_string(),
                "jobs[0].steps[2].timeout_secs".to_string(),
            ]
        );
    }
}
