//! Export: reconciling the store's dirty set (or the whole store) into the
//! on-disk JSONL file via a single atomic rename.

use crate::atomic;
use crate::error::{BeadsError, Result};
use crate::router::RouteTable;
use crate::storage::Storage;
use crate::types::Issue;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub written: usize,
    pub removed: usize,
    pub skipped_ephemeral: usize,
    pub skipped_foreign: usize,
}

/// An ID is locally owned unless its prefix differs from this workspace's
/// own prefix *and* a route table entry claims that prefix for a sibling
/// workspace. Unrecognized prefixes with no route stay local — routing is
/// opt-in via `route.<prefix>` config, not inferred from the ID alone.
fn is_owned_locally(id: &str, local_prefix: &str, routes: &RouteTable) -> bool {
    let id_prefix = id.split_once('-').map(|(p, _)| p).unwrap_or(id);
    id_prefix == local_prefix || routes.route_for(id_prefix).is_none()
}

/// Reads the existing JSONL file into a map keyed by ID. Returns an empty map
/// if the file doesn't exist.
fn read_existing(path: &Path) -> Result<BTreeMap<String, Issue>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let contents = std::fs::read_to_string(path).map_err(BeadsError::from)?;
    let mut map = BTreeMap::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let issue: Issue = serde_json::from_str(line).map_err(BeadsError::from)?;
        map.insert(issue.id.clone(), issue);
    }
    Ok(map)
}

fn write_map(path: &Path, map: &BTreeMap<String, Issue>) -> Result<String> {
    let mut buf = String::new();
    for issue in map.values() {
        buf.push_str(&serde_json::to_string(issue).map_err(BeadsError::from)?);
        buf.push('\n');
    }
    atomic::write_atomic(path, buf.as_bytes())?;
    Ok(atomic::hash_bytes(buf.as_bytes()))
}

/// Runs the pre-export integrity check: if the stored `jsonl_file_hash` is
/// non-empty and disagrees with the on-disk hash, the caller must force a
/// full export instead of an incremental one.
pub fn needs_full_export(storage: &dyn Storage, path: &Path) -> Result<bool> {
    let stored_hash = storage
        .get_metadata("jsonl_file_hash")
        .map_err(|e| BeadsError::integrity("sync", "needs_full_export", e.to_string()))?;

    match stored_hash {
        Some(hash) if !hash.is_empty() => {
            let on_disk = atomic::hash_file(path)?;
            Ok(on_disk.as_deref() != Some(hash.as_str()))
        }
        _ => Ok(false),
    }
}

fn hydrate_dirty(storage: &dyn Storage, ids: &[String]) -> Result<Vec<Option<Issue>>> {
    ids.iter()
        .map(|id| {
            storage
                .get_issue(id)
                .map_err(|e| BeadsError::integrity("sync", "export.hydrate", e.to_string()))
        })
        .collect()
}

/// Incremental export: only the dirty IDs are refetched and merged into the
/// existing JSONL.
pub fn export_incremental(storage: &dyn Storage, path: &Path) -> Result<ExportReport> {
    if needs_full_export(storage, path)? {
        storage
            .clear_all_export_hashes()
            .map_err(|e| BeadsError::integrity("sync", "export.clear_hashes", e.to_string()))?;
        return export_full(storage, path);
    }

    let mut map = read_existing(path)?;
    let dirty_ids = storage
        .get_dirty_issues()
        .map_err(|e| BeadsError::integrity("sync", "export.get_dirty", e.to_string()))?;

    let local_prefix = storage
        .get_config("issue_prefix")
        .map_err(|e| BeadsError::integrity("sync", "export.get_prefix", e.to_string()))?
        .unwrap_or_else(|| "bd".to_string());
    let routes = RouteTable::from_config(storage)?;

    let mut report = ExportReport::default();
    let issues = hydrate_dirty(storage, &dirty_ids)?;

    for (id, issue) in dirty_ids.iter().zip(issues.into_iter()) {
        match issue {
            None => {
                map.remove(id);
                report.removed += 1;
            }
            Some(issue) if !issue.is_exportable() => {
                map.remove(id);
                report.skipped_ephemeral += 1;
            }
            Some(_) if !is_owned_locally(id, &local_prefix, &routes) => {
                map.remove(id);
                report.skipped_foreign += 1;
            }
            Some(issue) => {
                map.insert(id.clone(), issue);
                report.written += 1;
            }
        }
    }

    let hash = write_map(path, &map)?;

    storage
        .clear_dirty_issues_by_id(&dirty_ids)
        .map_err(|e| BeadsError::integrity("sync", "export.clear_dirty", e.to_string()))?;
    storage
        .set_jsonl_file_hash(&hash)
        .map_err(|e| BeadsError::integrity("sync", "export.set_hash", e.to_string()))?;
    storage
        .set_metadata("last_import_time", &chrono::Utc::now().to_rfc3339())
        .map_err(|e| BeadsError::integrity("sync", "export.set_last_import", e.to_string()))?;

    for id in map.keys() {
        storage
            .set_export_hash(id, &map[id].compute_content_hash())
            .map_err(|e| BeadsError::integrity("sync", "export.set_export_hash", e.to_string()))?;
    }

    Ok(report)
}

/// Full export: every non-ephemeral issue in the store, ignoring the dirty
/// set and any prior JSONL content.
pub fn export_full(storage: &dyn Storage, path: &Path) -> Result<ExportReport> {
    let all = storage
        .search_issues("", &Default::default())
        .map_err(|e| BeadsError::integrity("sync", "export_full.search", e.to_string()))?;

    let local_prefix = storage
        .get_config("issue_prefix")
        .map_err(|e| BeadsError::integrity("sync", "export_full.get_prefix", e.to_string()))?
        .unwrap_or_else(|| "bd".to_string());
    let routes = RouteTable::from_config(storage)?;

    let mut map = BTreeMap::new();
    let mut report = ExportReport::default();
    for issue in all {
        if !issue.is_exportable() {
            report.skipped_ephemeral += 1;
        } else if !is_owned_locally(&issue.id, &local_prefix, &routes) {
            report.skipped_foreign += 1;
        } else {
            report.written += 1;
            map.insert(issue.id.clone(), issue);
        }
    }

    let hash = write_map(path, &map)?;

    storage
        .clear_dirty_issues()
        .map_err(|e| BeadsError::integrity("sync", "export_full.clear_dirty", e.to_string()))?;
    storage
        .set_jsonl_file_hash(&hash)
        .map_err(|e| BeadsError::integrity("sync", "export_full.set_hash", e.to_string()))?;
    storage
        .set_metadata("last_import_time", &chrono::Utc::now().to_rfc3339())
        .map_err(|e| BeadsError::integrity("sync", "export_full.set_last_import", e.to_string()))?;

    for (id, issue) in &map {
        storage
            .set_export_hash(id, &issue.compute_content_hash())
            .map_err(|e| BeadsError::integrity("sync", "export_full.set_export_hash", e.to_string()))?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use crate::types::{IssueType, Status};
    use chrono::Utc;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn new_issue(id: &str, ephemeral: bool) -> Issue {
        let now = Utc::now();
        Issue {
            id: id.to_string(),
            content_hash: None,
            title: "t".into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            notes: String::new(),
            status: Status::Open,
            priority: 2,
            issue_type: IssueType::Task,
            assignee: String::new(),
            sender: String::new(),
            estimated_minutes: None,
            created_at: now,
            updated_at: now,
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
            ephemeral,
            pinned: false,
            is_template: false,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
        }
    }

    #[test]
    fn full_export_skips_ephemeral_issues() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        storage.create_issue(&new_issue("bd-1", false), "t").unwrap();
        storage.create_issue(&new_issue("bd-2", false), "t").unwrap();
        storage.create_issue(&new_issue("bd-wisp-x", true), "t").unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let report = export_full(&storage, &path).unwrap();

        assert_eq!(report.written, 2);
        assert_eq!(report.skipped_ephemeral, 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn full_export_skips_issues_owned_by_a_routed_sibling() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        storage.set_config("issue_prefix", "bd").unwrap();
        storage.set_config("route.other", "/tmp/other-workspace.db").unwrap();
        storage.create_issue(&new_issue("bd-1", false), "t").unwrap();
        storage.create_issue(&new_issue("other-1", false), "t").unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let report = export_full(&storage, &path).unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.skipped_foreign, 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("bd-1"));
    }

    #[test]
    fn incremental_export_writes_zero_bytes_when_clean() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        storage.create_issue(&new_issue("bd-1", false), "t").unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        export_full(&storage, &path).unwrap();
        storage.clear_dirty_issues().unwrap();

        let before = std::fs::read_to_string(&path).unwrap();
        let report = export_incremental(&storage, &path).unwrap();
        let after = std::fs::read_to_string(&path).unwrap();

        assert_eq!(report.written, 0);
        assert_eq!(before, after);
    }
}
