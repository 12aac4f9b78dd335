//! Import: reconciling a JSONL file's contents into the store, with collision
//! remapping and merge-conflict-marker detection.

use crate::error::{BeadsError, Result};
use crate::storage::Storage;
use crate::types::Issue;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// old ID -> new ID, for every issue remapped because its prefix didn't
    /// match the workspace's configured prefix.
    pub remapped: HashMap<String, String>,
}

const CONFLICT_MARKERS: [&str; 3] = ["<<<<<<< ", "=======", ">>>>>>> "];

/// Scans for standalone VCS conflict-marker lines. A marker embedded inside a
/// JSON string value is never on a line by itself at column 0 in valid JSONL
/// (each line is a complete JSON object), so a literal line-prefix match is
/// sufficient and doesn't false-positive on escaped content.
fn detect_conflict_markers(contents: &str) -> Option<(usize, &str)> {
    for (i, line) in contents.lines().enumerate() {
        if CONFLICT_MARKERS.iter().any(|m| line.starts_with(m)) {
            return Some((i + 1, line));
        }
    }
    None
}

/// Derives a prefix for a cold-start store: parse the first well-formed ID in
/// the JSONL and take the segment before the first hyphen, falling back to
/// the parent directory name of `path`.
pub fn derive_cold_start_prefix(contents: &str, path: &Path) -> String {
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(issue) = serde_json::from_str::<Issue>(line) {
            if let Some((prefix, _)) = issue.id.split_once('-') {
                return prefix.to_string();
            }
        }
    }
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("bd")
        .to_string()
}

/// Imports JSONL bytes into the store. `skip_prefix_validation=false` enables
/// collision remapping for any issue whose prefix doesn't match
/// `workspace_prefix`.
pub fn import_jsonl(
    storage: &dyn Storage,
    contents: &str,
    workspace_prefix: &str,
    skip_prefix_validation: bool,
    actor: &str,
) -> Result<ImportReport> {
    if let Some((line_no, line)) = detect_conflict_markers(contents) {
        return Err(BeadsError::user_with_hint(
            format!("merge conflict marker found at line {line_no}: {line}"),
            "resolve the conflict in the JSONL file before importing",
        ));
    }

    let mut issues = Vec::new();
    let mut offset = 0usize;
    for (i, line) in contents.lines().enumerate() {
        let line_start = offset;
        offset += line.len() + 1; // +1 for the newline consumed by `.lines()`
        if line.trim().is_empty() {
            continue;
        }
        let issue: Issue = serde_json::from_str(line).map_err(|e| {
            let byte_offset = line_start + e.column().saturating_sub(1);
            BeadsError::user(format!("parse error at line {}, byte offset {byte_offset}: {e}", i + 1))
        })?;
        issues.push(issue);
    }

    let mut report = ImportReport::default();
    let mut remap: HashMap<String, String> = HashMap::new();

    if !skip_prefix_validation {
        // An ID collides and needs remapping either because its prefix
        // doesn't belong to this workspace, or because its prefix matches
        // but it collides with a different local issue of the same ID
        // (two peers independently picked the same counter value).
        for issue in issues.iter_mut() {
            let prefix = issue.id.split_once('-').map(|(p, _)| p);
            let wrong_prefix = prefix != Some(workspace_prefix);
            let colliding_with_different_local_issue = !wrong_prefix
                && storage
                    .get_issue(&issue.id)
                    .map_err(|e| BeadsError::integrity("sync", "import.collision_check", e.to_string()))?
                    .map(|local| !same_logical_issue(&local, issue))
                    .unwrap_or(false);

            if wrong_prefix || colliding_with_different_local_issue {
                let new_id = storage
                    .generate_next_id(workspace_prefix)
                    .map_err(|e| BeadsError::integrity("sync", "import.remap", e.to_string()))?;
                remap.insert(issue.id.clone(), new_id.clone());
                issue.id = new_id;
            }
        }

        // Rewrite internal cross-references within the imported batch.
        for issue in issues.iter_mut() {
            for dep in issue.dependencies.iter_mut() {
                if let Some(new_id) = remap.get(&dep.depends_on_id) {
                    dep.depends_on_id = new_id.clone();
                }
                if let Some(new_id) = remap.get(&dep.issue_id) {
                    dep.issue_id = new_id.clone();
                }
            }
        }
    }

    for mut issue in issues {
        if issue.status == crate::types::Status::Closed && issue.closed_at.is_none() {
            issue.closed_at = Some(Utc::now());
        }

        let existing = storage
            .get_issue(&issue.id)
            .map_err(|e| BeadsError::integrity("sync", "import.get_issue", e.to_string()))?;

        match existing {
            None => {
                storage
                    .create_issue(&issue, actor)
                    .map_err(|e| BeadsError::integrity("sync", "import.create", e.to_string()))?;
                report.created += 1;
            }
            Some(current) if issue.updated_at >= current.updated_at => {
                apply_full_update(storage, &current, &issue, actor)?;
                report.updated += 1;
            }
            Some(_) => {
                report.skipped += 1;
            }
        }

        storage
            .set_export_hash(&issue.id, &issue.compute_content_hash())
            .map_err(|e| BeadsError::integrity("sync", "import.set_export_hash", e.to_string()))?;
    }

    report.remapped = remap;
    Ok(report)
}

/// Two issues sharing an ID are the "same" logical issue (an update, not a
/// collision) if they agree on creation time — the one field a remap never
/// touches and two independently-generated issues are vanishingly unlikely
/// to share.
fn same_logical_issue(a: &Issue, b: &Issue) -> bool {
    a.created_at == b.created_at
}

/// Carries the full incoming issue through an update: scalar fields via
/// `update_issue`, then labels and dependencies reconciled by diffing
/// against what's already stored, then any comments the peer has that we
/// don't.
fn apply_full_update(storage: &dyn Storage, current: &Issue, incoming: &Issue, actor: &str) -> Result<()> {
    let mut updates = HashMap::new();
    updates.insert("title".to_string(), incoming.title.clone());
    updates.insert("description".to_string(), incoming.description.clone());
    updates.insert("design".to_string(), incoming.design.clone());
    updates.insert("acceptance_criteria".to_string(), incoming.acceptance_criteria.clone());
    updates.insert("notes".to_string(), incoming.notes.clone());
    updates.insert("status".to_string(), incoming.status.as_str().to_string());
    updates.insert("priority".to_string(), incoming.priority.to_string());
    updates.insert("issue_type".to_string(), incoming.issue_type.as_str().to_string());
    updates.insert("assignee".to_string(), incoming.assignee.clone());
    updates.insert("sender".to_string(), incoming.sender.clone());
    updates.insert("updated_at".to_string(), incoming.updated_at.to_rfc3339());
    if let Some(closed_at) = incoming.closed_at {
        updates.insert("closed_at".to_string(), closed_at.to_rfc3339());
    }
    if let Some(due_at) = incoming.due_at {
        updates.insert("due_at".to_string(), due_at.to_rfc3339());
    }
    if let Some(defer_until) = incoming.defer_until {
        updates.insert("defer_until".to_string(), defer_until.to_rfc3339());
    }
    updates.insert("external_ref".to_string(), incoming.external_ref.clone().unwrap_or_default());
    updates.insert("source_repo".to_string(), incoming.source_repo.clone());
    updates.insert("ephemeral".to_string(), incoming.ephemeral.to_string());
    updates.insert("pinned".to_string(), incoming.pinned.to_string());
    updates.insert("is_template".to_string(), incoming.is_template.to_string());

    storage
        .update_issue(&incoming.id, updates, actor)
        .map_err(|e| BeadsError::integrity("sync", "import.update", e.to_string()))?;

    let current_labels: HashSet<&str> = current.labels.iter().map(String::as_str).collect();
    let incoming_labels: HashSet<&str> = incoming.labels.iter().map(String::as_str).collect();
    for label in incoming_labels.difference(&current_labels) {
        storage
            .add_label(&incoming.id, label, actor)
            .map_err(|e| BeadsError::integrity("sync", "import.add_label", e.to_string()))?;
    }
    for label in current_labels.difference(&incoming_labels) {
        storage
            .remove_label(&incoming.id, label, actor)
            .map_err(|e| BeadsError::integrity("sync", "import.remove_label", e.to_string()))?;
    }

    let current_deps: HashSet<(String, String)> = current
        .dependencies
        .iter()
        .map(|d| (d.depends_on_id.clone(), d.dep_type.as_str().to_string()))
        .collect();
    let incoming_deps: HashSet<(String, String)> = incoming
        .dependencies
        .iter()
        .map(|d| (d.depends_on_id.clone(), d.dep_type.as_str().to_string()))
        .collect();
    for dep in incoming.dependencies.iter() {
        let key = (dep.depends_on_id.clone(), dep.dep_type.as_str().to_string());
        if !current_deps.contains(&key) {
            storage
                .add_dependency(dep, actor)
                .map_err(|e| BeadsError::integrity("sync", "import.add_dependency", e.to_string()))?;
        }
    }
    for dep in current.dependencies.iter() {
        let key = (dep.depends_on_id.clone(), dep.dep_type.as_str().to_string());
        if !incoming_deps.contains(&key) {
            storage
                .remove_dependency(&incoming.id, &dep.depends_on_id, actor)
                .map_err(|e| BeadsError::integrity("sync", "import.remove_dependency", e.to_string()))?;
        }
    }

    let current_comments: HashSet<(&str, &str)> =
        current.comments.iter().map(|c| (c.author.as_str(), c.text.as_str())).collect();
    for comment in incoming.comments.iter() {
        if !current_comments.contains(&(comment.author.as_str(), comment.text.as_str())) {
            storage
                .add_issue_comment(&incoming.id, &comment.author, &comment.text)
                .map_err(|e| BeadsError::integrity("sync", "import.add_comment", e.to_string()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use std::path::PathBuf;

    #[test]
    fn conflict_marker_on_its_own_line_aborts_import() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        let jsonl = "<<<<<<< HEAD\n{\"id\":\"bd-1\"}\n";
        let err = import_jsonl(&storage, jsonl, "bd", false, "t").unwrap_err();
        assert!(matches!(err, BeadsError::User { .. }));
    }

    #[test]
    fn conflict_marker_text_inside_json_string_does_not_abort() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        let line = serde_json::json!({
            "id": "bd-1",
            "content_hash": null,
            "title": "mentions <<<<<<< in body text",
            "description": "",
            "status": "open",
            "priority": 2,
            "issue_type": "task",
            "created_at": Utc::now().to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        })
        .to_string();
        let result = import_jsonl(&storage, &line, "bd", false, "t");
        assert!(result.is_ok());
    }

    #[test]
    fn cold_start_prefix_derived_from_first_id() {
        let jsonl = "{\"id\":\"proj-1\",\"content_hash\":null,\"title\":\"x\",\"description\":\"\",\"status\":\"open\",\"priority\":2,\"issue_type\":\"task\",\"created_at\":\"2024-01-01T00:00:00Z\",\"updated_at\":\"2024-01-01T00:00:00Z\"}\n";
        let prefix = derive_cold_start_prefix(jsonl, Path::new("/tmp/whatever/issues.jsonl"));
        assert_eq!(prefix, "proj");
    }

    #[test]
    fn same_prefix_id_collision_with_a_different_issue_is_remapped() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        storage.set_config("issue_prefix", "bd").unwrap();
        let local = new_issue("bd-1", "2020-01-01T00:00:00Z");
        storage.create_issue(&local, "t").unwrap();

        // A peer's independently-created "bd-1" with a different creation
        // time collides with the local issue of the same ID and must be
        // remapped rather than silently treated as an update to it.
        let incoming = new_issue("bd-1", "2024-06-01T00:00:00Z");
        let line = serde_json::to_string(&incoming).unwrap();
        let report = import_jsonl(&storage, &line, "bd", false, "t").unwrap();

        assert_eq!(report.created, 1);
        assert!(report.remapped.contains_key("bd-1"));
        let local_still_present = storage.get_issue("bd-1").unwrap().unwrap();
        assert_eq!(local_still_present.created_at.to_rfc3339(), "2020-01-01T00:00:00+00:00");
    }

    #[test]
    fn importing_a_close_sets_closed_at_and_reopen_clears_it() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        storage.set_config("issue_prefix", "bd").unwrap();
        let open_issue = new_issue("bd-1", "2020-01-01T00:00:00Z");
        storage.create_issue(&open_issue, "t").unwrap();

        let mut closed = open_issue.clone();
        closed.status = crate::types::Status::Closed;
        closed.updated_at = Utc::now();
        let line = serde_json::to_string(&closed).unwrap();
        import_jsonl(&storage, &line, "bd", false, "t").unwrap();

        let after_close = storage.get_issue("bd-1").unwrap().unwrap();
        assert_eq!(after_close.status, crate::types::Status::Closed);
        assert!(after_close.closed_at.is_some());

        let mut reopened = after_close.clone();
        reopened.status = crate::types::Status::Open;
        reopened.updated_at = Utc::now();
        let line = serde_json::to_string(&reopened).unwrap();
        import_jsonl(&storage, &line, "bd", false, "t").unwrap();

        let after_reopen = storage.get_issue("bd-1").unwrap().unwrap();
        assert_eq!(after_reopen.status, crate::types::Status::Open);
        assert!(after_reopen.closed_at.is_none());
    }

    fn new_issue(id: &str, created_at: &str) -> Issue {
        let created_at = created_at.parse().unwrap();
        Issue {
            id: id.to_string(),
            content_hash: None,
            title: "t".into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            notes: String::new(),
            status: crate::types::Status::Open,
            priority: 2,
            issue_type: crate::types::IssueType::Task,
            assignee: String::new(),
            sender: String::new(),
            estimated_minutes: None,
            created_at,
            updated_at: created_at,
            closed_at: None,
            due_at: None,
            defer_until: None,
            last_activity: None,
            external_ref: None,
            compaction_level: 0,
            compacted_at: None,
            compacted_at_commit: None,
            original_size: 0,
            source_repo: String::new(),
            ephemeral: false,
            pinned: false,
            is_template: false,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
        }
    }
}
