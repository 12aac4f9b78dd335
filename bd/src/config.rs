//! Layered configuration: built-in defaults < store `config` table < environment
//! (`BEADS_*`) < explicit CLI flags.

use crate::storage::Storage;
use std::collections::HashMap;
use std::env;

/// Recognized configuration keys. Unknown keys found in the store are kept
/// and logged once at load time rather than dropped or rejected.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "issue_prefix",
    "sync.branch",
    "sync.remote",
    "daemon.auto-sync",
    "daemon.auto-pull",
    "daemon.auto_commit",
    "daemon.auto_push",
    "flush-debounce",
    "git.author",
    "git.no-gpg-sign",
    "hooks.chain_strategy",
    "hooks.chain_timeout_ms",
];

/// A layered view over the store's `config` table and the process environment.
/// CLI flags are applied by callers via [`Settings::with_override`] since they
/// are parsed per-subcommand.
pub struct Settings {
    store: HashMap<String, String>,
    overrides: HashMap<String, String>,
}

impl Settings {
    /// Loads the config table from the store and warns once about any key
    /// outside the recognized set.
    pub fn load(storage: &dyn Storage) -> crate::error::Result<Self> {
        let store = storage
            .get_all_config()
            .map_err(|e| crate::error::BeadsError::integrity("config", "load", e.to_string()))?;

        for key in store.keys() {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                log::warn!("unrecognized config key `{key}` preserved but not understood");
            }
        }

        Ok(Settings {
            store,
            overrides: HashMap::new(),
        })
    }

    /// Registers an explicit CLI-flag override, taking precedence over
    /// everything else for this key.
    pub fn with_override(mut self, key: &str, value: impl Into<String>) -> Self {
        self.overrides.insert(key.to_string(), value.into());
        self
    }

    /// Resolves a key through the precedence chain: CLI override > env
    /// (`BEADS_<KEY_UPPER_WITH_UNDERSCORES>`) > store > default.
    pub fn get(&self, key: &str, default: Option<&str>) -> Option<String> {
        if let Some(v) = self.overrides.get(key) {
            return Some(v.clone());
        }
        let env_key = format!("BEADS_{}", key.to_uppercase().replace(['.', '-'], "_"));
        if let Ok(v) = env::var(&env_key) {
            return Some(v);
        }
        if let Some(v) = self.store.get(key) {
            return Some(v.clone());
        }
        default.map(|s| s.to_string())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key, None)
            .and_then(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
    }

    pub fn issue_prefix(&self) -> Option<String> {
        self.get("issue_prefix", None)
    }

    pub fn flush_debounce_ms(&self) -> u64 {
        self.get("flush-debounce", Some("5000"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000)
    }

    pub fn sync_branch(&self) -> Option<String> {
        self.get("sync.branch", None)
    }

    pub fn sync_remote(&self) -> String {
        self.get("sync.remote", Some("origin")).unwrap_or_else(|| "origin".into())
    }
}

/// The resolved decision of whether auto-commit and auto-push are active,
/// after applying the legacy/unified-switch precedence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub auto_commit: bool,
    pub auto_push: bool,
    pub auto_pull: bool,
}

impl SyncPolicy {
    /// Resolves the effective sync policy.
    ///
    /// When `daemon.auto-sync` is explicitly set, it forces both auto-commit
    /// and auto-push to its value for the duration of the process, overriding
    /// the legacy `daemon.auto_commit`/`daemon.auto_push` keys. When absent,
    /// the legacy keys are honored individually, preserving asymmetric setups
    /// (e.g. auto-commit without auto-push) that predate the unified switch.
    pub fn resolve(settings: &Settings) -> Self {
        let legacy_commit = settings.get_bool("daemon.auto_commit").unwrap_or(false);
        let legacy_push = settings.get_bool("daemon.auto_push").unwrap_or(false);
        let auto_pull = settings.get_bool("daemon.auto-pull").unwrap_or(false);

        match settings.get_bool("daemon.auto-sync") {
            Some(unified) => {
                if legacy_commit != unified || legacy_push != unified {
                    log::warn!(
                        "daemon.auto-sync={unified} overrides legacy daemon.auto_commit={legacy_commit}/daemon.auto_push={legacy_push}"
                    );
                }
                SyncPolicy {
                    auto_commit: unified,
                    auto_push: unified,
                    auto_pull,
                }
            }
            None => SyncPolicy {
                auto_commit: legacy_commit,
                auto_push: legacy_push,
                auto_pull,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_with(store: HashMap<String, String>) -> Settings {
        Settings {
            store,
            overrides: HashMap::new(),
        }
    }

    #[test]
    fn unified_switch_overrides_legacy_flags() {
        let mut store = HashMap::new();
        store.insert("daemon.auto-sync".into(), "true".into());
        store.insert("daemon.auto_commit".into(), "false".into());
        store.insert("daemon.auto_push".into(), "false".into());
        let settings = settings_with(store);

        let policy = SyncPolicy::resolve(&settings);
        assert!(policy.auto_commit);
        assert!(policy.auto_push);
    }

    #[test]
    fn legacy_flags_honored_when_unified_switch_absent() {
        let mut store = HashMap::new();
        store.insert("daemon.auto_commit".into(), "true".into());
        store.insert("daemon.auto_push".into(), "false".into());
        let settings = settings_with(store);

        let policy = SyncPolicy::resolve(&settings);
        assert!(policy.auto_commit);
        assert!(!policy.auto_push);
    }

    #[test]
    fn cli_override_wins_over_store() {
        let mut store = HashMap::new();
        store.insert("issue_prefix".into(), "store-prefix".into());
        let settings = settings_with(store).with_override("issue_prefix", "flag-prefix");
        assert_eq!(settings.issue_prefix(), Some("flag-prefix".to_string()));
    }

    #[test]
    fn default_flush_debounce_is_five_seconds() {
        let settings = settings_with(HashMap::new());
        assert_eq!(settings.flush_debounce_ms(), 5000);
    }
}
