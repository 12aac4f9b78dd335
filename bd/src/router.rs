//! Cross-repo router: forwards a lookup for an ID whose prefix belongs to a
//! sibling workspace, instead of failing with "not found" in the local store.

use crate::error::{BeadsError, Result};
use crate::storage::sqlite::SqliteStorage;
use crate::storage::Storage;
use crate::types::Issue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maps an issue-ID prefix to the filesystem path of the sibling workspace
/// that owns it. Populated from the local store's `config` table
/// (`route.<prefix>` keys) at construction.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, PathBuf>,
}

impl RouteTable {
    pub fn from_config(storage: &dyn Storage) -> Result<Self> {
        let config = storage
            .get_all_config()
            .map_err(|e| BeadsError::integrity("router", "from_config", e.to_string()))?;

        let mut routes = HashMap::new();
        for (key, value) in config {
            if let Some(prefix) = key.strip_prefix("route.") {
                routes.insert(prefix.to_string(), PathBuf::from(value));
            }
        }
        Ok(RouteTable { routes })
    }

    pub fn route_for(&self, prefix: &str) -> Option<&Path> {
        self.routes.get(prefix).map(PathBuf::as_path)
    }
}

/// Looks up `id` in the local store; if its prefix doesn't match
/// `local_prefix` and a route exists, opens the sibling workspace read-only
/// and forwards the lookup there instead. `already_routed` prevents chaining
/// a forwarded request onward to a third workspace.
pub fn get_issue_with_routing(
    storage: &dyn Storage,
    routes: &RouteTable,
    local_prefix: &str,
    id: &str,
    already_routed: bool,
) -> Result<Option<Issue>> {
    let id_prefix = id.split_once('-').map(|(p, _)| p).unwrap_or(id);

    if id_prefix == local_prefix || already_routed {
        return storage
            .get_issue(id)
            .map_err(|e| BeadsError::integrity("router", "get_issue", e.to_string()));
    }

    match routes.route_for(id_prefix) {
        Some(sibling_path) => {
            let sibling = SqliteStorage::new(sibling_path.to_path_buf())
                .map_err(|e| BeadsError::integrity("router", "open_sibling", e.to_string()))?;
            get_issue_with_routing(&sibling, &RouteTable::default(), id_prefix, id, true)
        }
        None => storage
            .get_issue(id)
            .map_err(|e| BeadsError::integrity("router", "get_issue", e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use std::path::PathBuf;

    #[test]
    fn unrouted_prefix_falls_through_to_local_lookup() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        let routes = RouteTable::default();
        let result = get_issue_with_routing(&storage, &routes, "bd", "bd-1", false).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn already_routed_request_never_forwards_again() {
        let storage = SqliteStorage::new(PathBuf::from(":memory:")).unwrap();
        let mut routes = RouteTable::default();
        routes.routes.insert("other".into(), PathBuf::from("/nonexistent/path.db"));
        let result = get_issue_with_routing(&storage, &routes, "bd", "other-1", true);
        assert!(result.is_ok());
    }
}
