//! SQLite schema definition and in-place migrations.
//!
//! The schema is applied once at store-open time via [`apply_schema`]. Existing
//! databases created by an older binary are upgraded column-by-column through
//! [`run_migrations`] rather than requiring a wipe; every migration step probes
//! `pragma_table_info` first so re-running it on an already-upgraded database is
//! a no-op.

use rusqlite::Connection;

/// Bump when the schema gains a column or table that `run_migrations` must backfill.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS issues (
    id                   TEXT PRIMARY KEY,
    content_hash         TEXT,
    title                TEXT NOT NULL,
    description          TEXT NOT NULL DEFAULT '',
    design               TEXT NOT NULL DEFAULT '',
    acceptance_criteria  TEXT NOT NULL DEFAULT '',
    notes                TEXT NOT NULL DEFAULT '',
    status               TEXT NOT NULL DEFAULT 'open',
    priority             INTEGER NOT NULL DEFAULT 2,
    issue_type           TEXT NOT NULL DEFAULT 'task',
    assignee             TEXT NOT NULL DEFAULT '',
    sender               TEXT NOT NULL DEFAULT '',
    estimated_minutes    INTEGER,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    closed_at            TEXT,
    due_at               TEXT,
    defer_until          TEXT,
    last_activity        TEXT,
    external_ref         TEXT,
    compaction_level     INTEGER NOT NULL DEFAULT 0,
    compacted_at         TEXT,
    compacted_at_commit  TEXT,
    original_size        INTEGER NOT NULL DEFAULT 0,
    source_repo          TEXT NOT NULL DEFAULT '',
    ephemeral            INTEGER NOT NULL DEFAULT 0,
    pinned               INTEGER NOT NULL DEFAULT 0,
    is_template          INTEGER NOT NULL DEFAULT 0,
    CHECK ((status = 'closed') = (closed_at IS NOT NULL) OR status = 'tombstone')
);

CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
CREATE INDEX IF NOT EXISTS idx_issues_priority ON issues(priority);
CREATE INDEX IF NOT EXISTS idx_issues_assignee ON issues(assignee);
CREATE INDEX IF NOT EXISTS idx_issues_external_ref ON issues(external_ref);
CREATE INDEX IF NOT EXISTS idx_issues_ready
    ON issues(status, priority, created_at)
    WHERE status NOT IN ('closed', 'deferred', 'blocked', 'hooked', 'tombstone');

CREATE TABLE IF NOT EXISTS dependencies (
    issue_id       TEXT NOT NULL,
    depends_on_id  TEXT NOT NULL,
    type           TEXT NOT NULL,
    thread_id      TEXT,
    metadata       TEXT,
    created_at     TEXT NOT NULL,
    created_by     TEXT NOT NULL,
    PRIMARY KEY (issue_id, depends_on_id, type),
    CHECK (issue_id != depends_on_id)
);

CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON dependencies(depends_on_id);
CREATE INDEX IF NOT EXISTS idx_dependencies_type ON dependencies(type);

CREATE TABLE IF NOT EXISTS labels (
    issue_id  TEXT NOT NULL,
    label     TEXT NOT NULL,
    PRIMARY KEY (issue_id, label)
);

CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label);

CREATE TABLE IF NOT EXISTS comments (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id    TEXT NOT NULL,
    author      TEXT NOT NULL,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_id);

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id    TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    actor       TEXT NOT NULL,
    old_value   TEXT,
    new_value   TEXT,
    comment     TEXT,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_events_issue ON events(issue_id);

CREATE TABLE IF NOT EXISTS config (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dirty_issues (
    issue_id   TEXT PRIMARY KEY,
    marked_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS export_hashes (
    issue_id      TEXT PRIMARY KEY,
    content_hash  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS child_counters (
    parent_id   TEXT PRIMARY KEY,
    last_child  INTEGER NOT NULL DEFAULT 0
);
"#;

/// Creates every table/index that doesn't already exist, then runs the
/// idempotent column-level migrations, then sets the pragmas the store needs
/// for concurrent CLI + daemon access.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    run_migrations(conn)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Upgrades an on-disk database created by an older binary in place. Each
/// step is guarded by a `pragma_table_info` probe so re-running this against
/// an already-current database touches nothing.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    // issues: columns added after the original spec-only schema
    for (column, ddl) in [
        ("sender", "ALTER TABLE issues ADD COLUMN sender TEXT NOT NULL DEFAULT ''"),
        ("due_at", "ALTER TABLE issues ADD COLUMN due_at TEXT"),
        ("defer_until", "ALTER TABLE issues ADD COLUMN defer_until TEXT"),
        ("last_activity", "ALTER TABLE issues ADD COLUMN last_activity TEXT"),
        ("ephemeral", "ALTER TABLE issues ADD COLUMN ephemeral INTEGER NOT NULL DEFAULT 0"),
        ("pinned", "ALTER TABLE issues ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0"),
        ("is_template", "ALTER TABLE issues ADD COLUMN is_template INTEGER NOT NULL DEFAULT 0"),
    ] {
        if !has_column(conn, "issues", column)? {
            conn.execute(ddl, [])?;
        }
    }

    // dependencies: thread_id/metadata were added after the initial blocks/related/parent-child set
    for (column, ddl) in [
        ("thread_id", "ALTER TABLE dependencies ADD COLUMN thread_id TEXT"),
        ("metadata", "ALTER TABLE dependencies ADD COLUMN metadata TEXT"),
    ] {
        if !has_column(conn, "dependencies", column)? {
            conn.execute(ddl, [])?;
        }
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_issues_ready
            ON issues(status, priority, created_at)
            WHERE status NOT IN ('closed', 'deferred', 'blocked', 'hooked', 'tombstone');",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).unwrap();
    }

    #[test]
    fn migrations_add_expected_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE issues (id TEXT PRIMARY KEY, title TEXT NOT NULL, status TEXT NOT NULL,
             priority INTEGER NOT NULL, issue_type TEXT NOT NULL, assignee TEXT NOT NULL DEFAULT '',
             created_at TEXT NOT NULL, updated_at TEXT NOT NULL, closed_at TEXT,
             description TEXT NOT NULL DEFAULT '', design TEXT NOT NULL DEFAULT '',
             acceptance_criteria TEXT NOT NULL DEFAULT '', notes TEXT NOT NULL DEFAULT '',
             estimated_minutes INTEGER, external_ref TEXT, compaction_level INTEGER NOT NULL DEFAULT 0,
             compacted_at TEXT, compacted_at_commit TEXT, original_size INTEGER NOT NULL DEFAULT 0,
             source_repo TEXT NOT NULL DEFAULT '');
             CREATE TABLE dependencies (issue_id TEXT, depends_on_id TEXT, type TEXT,
             created_at TEXT NOT NULL, created_by TEXT NOT NULL);",
        )
        .unwrap();
        run_migrations(&conn).unwrap();
        assert!(has_column(&conn, "issues", "sender").unwrap());
        assert!(has_column(&conn, "issues", "ephemeral").unwrap());
        assert!(has_column(&conn, "dependencies", "thread_id").unwrap());
    }
}
