//! Global daemon registry: a single JSON file under the user's state
//! directory listing every live bd daemon on the machine, keyed by
//! workspace path. Used by `bd daemon status`/`killall` across workspaces.

use crate::error::{BeadsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub workspace: PathBuf,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub version: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    daemons: HashMap<String, RegistryEntry>,
}

fn registry_path() -> Result<PathBuf> {
    let base = dirs::state_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| BeadsError::environment("could not resolve a state directory for the daemon registry"))?;
    Ok(base.join("bd").join("daemons.json"))
}

fn load(path: &std::path::Path) -> Result<RegistryFile> {
    if !path.exists() {
        return Ok(RegistryFile::default());
    }
    let contents = std::fs::read_to_string(path).map_err(BeadsError::from)?;
    if contents.trim().is_empty() {
        return Ok(RegistryFile::default());
    }
    serde_json::from_str(&contents).map_err(BeadsError::from)
}

fn save(path: &std::path::Path, file: &RegistryFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(BeadsError::from)?;
    }
    let contents = serde_json::to_string_pretty(file).map_err(BeadsError::from)?;
    crate::atomic::write_atomic(path, contents.as_bytes())
}

pub fn register(workspace: &std::path::Path, entry: RegistryEntry) -> Result<()> {
    let path = registry_path()?;
    let mut file = load(&path)?;
    file.daemons.insert(workspace.to_string_lossy().to_string(), entry);
    save(&path, &file)
}

pub fn unregister(workspace: &std::path::Path) -> Result<()> {
    let path = registry_path()?;
    let mut file = load(&path)?;
    file.daemons.remove(&workspace.to_string_lossy().to_string());
    save(&path, &file)
}

pub fn list() -> Result<Vec<RegistryEntry>> {
    let path = registry_path()?;
    Ok(load(&path)?.daemons.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemons.json");
        let mut file = RegistryFile::default();
        file.daemons.insert(
            "/ws".into(),
            RegistryEntry {
                workspace: "/ws".into(),
                pid: 123,
                socket_path: "/tmp/bd.sock".into(),
                version: "0.1.0".into(),
                started_at: "2026-01-01T00:00:00Z".into(),
            },
        );
        save(&path, &file).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.daemons.len(), 1);
    }

    #[test]
    fn unregister_removes_missing_entry_without_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemons.json");
        let file = RegistryFile::default();
        save(&path, &file).unwrap();
        let mut loaded = load(&path).unwrap();
        loaded.daemons.remove("/nonexistent");
        save(&path, &loaded).unwrap();
    }
}
