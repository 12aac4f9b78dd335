//! SQLite storage implementation

use crate::storage::schema::apply_schema;
use crate::storage::Storage;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// SQLite storage implementation
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    /// (dev, ino)-equivalent freshness token captured at open time; compared
    /// against the current on-disk file before any operation that must see a
    /// fresh checkout.
    opened_len: Arc<Mutex<Option<u64>>>,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub fn new(path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        apply_schema(&conn).with_context(|| "failed to apply schema")?;

        let opened_len = fs::metadata(&path).ok().map(|m| m.len());

        Ok(SqliteStorage {
            conn: Arc::new(Mutex::new(conn)),
            path,
            opened_len: Arc::new(Mutex::new(opened_len)),
        })
    }

    fn record_event(
        &self,
        conn: &Connection,
        issue_id: &str,
        event_type: EventType,
        actor: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
        comment: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO events (issue_id, event_type, actor, old_value, new_value, comment, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                issue_id,
                event_type.as_str(),
                actor,
                old_value,
                new_value,
                comment,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    fn mark_dirty(&self, conn: &Connection, issue_id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at) VALUES (?, ?)",
            params![issue_id, Utc::now()],
        )?;
        Ok(())
    }

    fn row_to_issue(row: &rusqlite::Row) -> rusqlite::Result<Issue> {
        Ok(Issue {
            id: row.get("id")?,
            content_hash: row.get("content_hash")?,
            title: row.get("title")?,
            description: row.get("description")?,
            design: row.get("design")?,
            acceptance_criteria: row.get("acceptance_criteria")?,
            notes: row.get("notes")?,
            status: Status::from_str_opt(&row.get::<_, String>("status")?).unwrap_or(Status::Open),
            priority: row.get("priority")?,
            issue_type: IssueType::from(row.get::<_, String>("issue_type")?),
            assignee: row.get("assignee")?,
            sender: row.get("sender")?,
            estimated_minutes: row.get("estimated_minutes")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            closed_at: row.get("closed_at")?,
            due_at: row.get("due_at")?,
            defer_until: row.get("defer_until")?,
            last_activity: row.get("last_activity")?,
            external_ref: row.get("external_ref")?,
            compaction_level: row.get("compaction_level")?,
            compacted_at: row.get("compacted_at")?,
            compacted_at_commit: row.get("compacted_at_commit")?,
            original_size: row.get("original_size")?,
            source_repo: row.get("source_repo")?,
            ephemeral: row.get::<_, i64>("ephemeral")? != 0,
            pinned: row.get::<_, i64>("pinned")? != 0,
            is_template: row.get::<_, i64>("is_template")? != 0,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
        })
    }

    const ISSUE_COLUMNS: &'static str = "id, content_hash, title, description, design, acceptance_criteria, notes,
         status, priority, issue_type, assignee, sender, estimated_minutes,
         created_at, updated_at, closed_at, due_at, defer_until, last_activity, external_ref,
         compaction_level, compacted_at, compacted_at_commit, original_size, source_repo,
         ephemeral, pinned, is_template";

    fn fetch_issue(conn: &Connection, id: &str) -> rusqlite::Result<Option<Issue>> {
        let sql = format!("SELECT {} FROM issues WHERE id = ?", Self::ISSUE_COLUMNS);
        conn.query_row(&sql, params![id], Self::row_to_issue).optional()
    }

    fn hydrate(&self, conn: &Connection, mut issue: Issue) -> Result<Issue> {
        let mut stmt = conn.prepare("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
        issue.labels = stmt
            .query_map(params![issue.id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let mut stmt = conn.prepare(
            "SELECT issue_id, depends_on_id, type, thread_id, metadata, created_at, created_by
             FROM dependencies WHERE issue_id = ? ORDER BY depends_on_id",
        )?;
        issue.dependencies = stmt
            .query_map(params![issue.id], |row| {
                let metadata: Option<String> = row.get(4)?;
                Ok(Dependency {
                    issue_id: row.get(0)?,
                    depends_on_id: row.get(1)?,
                    dep_type: DependencyType::from_str_opt(&row.get::<_, String>(2)?)
                        .unwrap_or(DependencyType::Related),
                    thread_id: row.get(3)?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    created_at: row.get(5)?,
                    created_by: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Dependency>>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, issue_id, author, text, created_at FROM comments WHERE issue_id = ? ORDER BY id",
        )?;
        issue.comments = stmt
            .query_map(params![issue.id], |row| {
                Ok(Comment {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    author: row.get(2)?,
                    text: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Comment>>>()?;

        Ok(issue)
    }
}

impl Storage for SqliteStorage {
    fn create_issue(&self, issue: &Issue, actor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO issues (
                id, content_hash, title, description, design, acceptance_criteria, notes,
                status, priority, issue_type, assignee, sender, estimated_minutes,
                created_at, updated_at, closed_at, due_at, defer_until, last_activity, external_ref,
                compaction_level, compacted_at, compacted_at_commit, original_size, source_repo,
                ephemeral, pinned, is_template
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                issue.id,
                issue.content_hash,
                issue.title,
                issue.description,
                issue.design,
                issue.acceptance_criteria,
                issue.notes,
                issue.status.as_str(),
                issue.priority,
                issue.issue_type.as_str(),
                issue.assignee,
                issue.sender,
                issue.estimated_minutes,
                issue.created_at,
                issue.updated_at,
                issue.closed_at,
                issue.due_at,
                issue.defer_until,
                issue.last_activity,
                issue.external_ref,
                issue.compaction_level,
                issue.compacted_at,
                issue.compacted_at_commit,
                issue.original_size,
                issue.source_repo,
                issue.ephemeral as i64,
                issue.pinned as i64,
                issue.is_template as i64,
            ],
        )?;

        for label in &issue.labels {
            conn.execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                params![issue.id, label],
            )?;
        }
        for dep in &issue.dependencies {
            conn.execute(
                "INSERT OR IGNORE INTO dependencies (issue_id, depends_on_id, type, thread_id, metadata, created_at, created_by)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    issue.id,
                    dep.depends_on_id,
                    dep.dep_type.as_str(),
                    dep.thread_id,
                    dep.metadata.as_ref().map(|m| m.to_string()),
                    dep.created_at,
                    dep.created_by,
                ],
            )?;
        }

        self.record_event(&conn, &issue.id, EventType::Created, actor, None, None, None)?;
        self.mark_dirty(&conn, &issue.id)?;

        Ok(())
    }

    fn create_issues(&self, issues: &[Issue], actor: &str) -> Result<()> {
        for issue in issues {
            self.create_issue(issue, actor)?;
        }
        Ok(())
    }

    fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let conn = self.conn.lock().unwrap();
        match Self::fetch_issue(&conn, id)? {
            Some(issue) => Ok(Some(self.hydrate(&conn, issue)?)),
            None => Ok(None),
        }
    }

    fn get_issue_by_external_ref(&self, external_ref: &str) -> Result<Option<Issue>> {
        let conn = self.conn.lock().unwrap();

        let id = conn
            .query_row(
                "SELECT id FROM issues WHERE external_ref = ?",
                params![external_ref],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        drop(conn);
        match id {
            Some(id) => self.get_issue(&id),
            None => Ok(None),
        }
    }

    fn update_issue(&self, id: &str, mut updates: HashMap<String, String>, actor: &str) -> Result<()> {
        const ALLOWED: &[&str] = &[
            "title", "description", "design", "acceptance_criteria", "notes", "status",
            "priority", "issue_type", "assignee", "sender", "estimated_minutes", "closed_at",
            "due_at", "defer_until", "last_activity", "external_ref", "source_repo",
            "ephemeral", "pinned", "is_template", "updated_at",
        ];

        for key in updates.keys() {
            if !ALLOWED.contains(&key.as_str()) {
                return Err(crate::error::BeadsError::user(format!(
                    "unknown issue field: {key}"
                ))
                .into());
            }
        }

        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        // A caller reconciling an imported peer's issue supplies its own
        // `updated_at` so the logical clock used for convergence isn't
        // clobbered with local wall-clock time.
        let effective_updated_at = match updates.remove("updated_at") {
            Some(v) => v.parse::<chrono::DateTime<Utc>>().unwrap_or(now),
            None => now,
        };

        // The closed-at invariant is enforced here, not trusted from the
        // caller: a transition into `closed` stamps closed_at (the caller's
        // value if it supplied one, e.g. a peer's original timestamp during
        // import, otherwise the effective update time); any other status
        // clears it.
        if let Some(status) = updates.get("status").cloned() {
            if status == Status::Closed.as_str() {
                let closed_at = updates.remove("closed_at").unwrap_or_else(|| effective_updated_at.to_rfc3339());
                conn.execute("UPDATE issues SET closed_at = ? WHERE id = ?", params![closed_at, id])?;
            } else {
                updates.remove("closed_at");
                conn.execute("UPDATE issues SET closed_at = NULL WHERE id = ?", params![id])?;
            }
        }

        for (key, value) in updates.iter() {
            let query = format!("UPDATE issues SET {} = ?, updated_at = ? WHERE id = ?", key);
            conn.execute(&query, params![value, effective_updated_at, id])?;

            self.record_event(&conn, id, EventType::Updated, actor, None, Some(value), None)?;
        }

        if let Some(status) = updates.get("status") {
            self.record_event(&conn, id, EventType::StatusChanged, actor, None, Some(status.as_str()), None)?;
        }

        conn.execute("UPDATE issues SET updated_at = ? WHERE id = ?", params![effective_updated_at, id])?;

        self.mark_dirty(&conn, id)?;
        Ok(())
    }

    fn close_issue(&self, id: &str, reason: &str, actor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let now = Utc::now();
        conn.execute(
            "UPDATE issues SET status = ?, closed_at = ?, updated_at = ? WHERE id = ?",
            params!["closed", now, now, id],
        )?;

        self.record_event(&conn, id, EventType::Closed, actor, None, None, Some(reason))?;
        self.mark_dirty(&conn, id)?;

        Ok(())
    }

    fn delete_issue(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let now = Utc::now();
        // A delete leaves a tombstone rather than removing the row, so peers
        // that import the next JSONL export see the deletion propagate.
        conn.execute(
            "UPDATE issues SET status = ?, updated_at = ? WHERE id = ?",
            params!["tombstone", now, id],
        )?;

        self.record_event(&conn, id, EventType::Deleted, "system", None, None, None)?;
        self.mark_dirty(&conn, id)?;

        Ok(())
    }

    fn search_issues(&self, query: &str, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().unwrap();

        let mut clauses: Vec<String> = Vec::new();
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !query.is_empty() {
            clauses.push("(title LIKE ? OR description LIKE ? OR notes LIKE ?)".to_string());
            let pat = format!("%{query}%");
            bind.push(Box::new(pat.clone()));
            bind.push(Box::new(pat.clone()));
            bind.push(Box::new(pat));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            bind.push(Box::new(status.as_str().to_string()));
        }
        if let Some(priority) = filter.priority {
            clauses.push("priority = ?".to_string());
            bind.push(Box::new(priority));
        }
        if let Some(ref issue_type) = filter.issue_type {
            clauses.push("issue_type = ?".to_string());
            bind.push(Box::new(issue_type.as_str().to_string()));
        }
        if let Some(ref assignee) = filter.assignee {
            clauses.push("assignee = ?".to_string());
            bind.push(Box::new(assignee.clone()));
        }
        if !filter.title_contains.is_empty() {
            clauses.push("title LIKE ?".to_string());
            bind.push(Box::new(format!("%{}%", filter.title_contains)));
        }
        if filter.no_assignee {
            clauses.push("assignee = ''".to_string());
        }
        if filter.empty_description {
            clauses.push("description = ''".to_string());
        }
        if let Some(min) = filter.priority_min {
            clauses.push("priority >= ?".to_string());
            bind.push(Box::new(min));
        }
        if let Some(max) = filter.priority_max {
            clauses.push("priority <= ?".to_string());
            bind.push(Box::new(max));
        }

        let mut sql = format!("SELECT {} FROM issues", Self::ISSUE_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let issues = stmt
            .query_map(params_refs.as_slice(), Self::row_to_issue)?
            .collect::<rusqlite::Result<Vec<Issue>>>()?;

        issues
            .into_iter()
            .map(|issue| self.hydrate(&conn, issue))
            .collect()
    }

    fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO dependencies (issue_id, depends_on_id, type, thread_id, metadata, created_at, created_by)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                dep.issue_id,
                dep.depends_on_id,
                dep.dep_type.as_str(),
                dep.thread_id,
                dep.metadata.as_ref().map(|m| m.to_string()),
                dep.created_at,
                dep.created_by,
            ],
        )?;

        self.record_event(&conn, &dep.issue_id, EventType::DependencyAdded, actor, None, Some(&dep.depends_on_id), None)?;
        self.mark_dirty(&conn, &dep.issue_id)?;

        Ok(())
    }

    fn remove_dependency(&self, issue_id: &str, depends_on_id: &str, actor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "DELETE FROM dependencies WHERE issue_id = ? AND depends_on_id = ?",
            params![issue_id, depends_on_id],
        )?;

        self.record_event(&conn, issue_id, EventType::DependencyRemoved, actor, Some(depends_on_id), None, None)?;
        self.mark_dirty(&conn, issue_id)?;

        Ok(())
    }

    fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT depends_on_id FROM dependencies WHERE issue_id = ?")?;
        let ids = stmt
            .query_map(params![issue_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(issue) = Self::fetch_issue(&conn, &id)? {
                out.push(self.hydrate(&conn, issue)?);
            }
        }
        Ok(out)
    }

    fn get_dependents(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT issue_id FROM dependencies WHERE depends_on_id = ?")?;
        let ids = stmt
            .query_map(params![issue_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(issue) = Self::fetch_issue(&conn, &id)? {
                out.push(self.hydrate(&conn, issue)?);
            }
        }
        Ok(out)
    }

    fn get_dependency_records(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT issue_id, depends_on_id, type, thread_id, metadata, created_at, created_by
             FROM dependencies WHERE issue_id = ?",
        )?;
        let deps = stmt
            .query_map(params![issue_id], |row| {
                let metadata: Option<String> = row.get(4)?;
                Ok(Dependency {
                    issue_id: row.get(0)?,
                    depends_on_id: row.get(1)?,
                    dep_type: DependencyType::from_str_opt(&row.get::<_, String>(2)?)
                        .unwrap_or(DependencyType::Related),
                    thread_id: row.get(3)?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    created_at: row.get(5)?,
                    created_by: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Dependency>>>()?;
        Ok(deps)
    }

    fn get_all_dependency_records(&self) -> Result<HashMap<String, Vec<Dependency>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT issue_id, depends_on_id, type, thread_id, metadata, created_at, created_by FROM dependencies",
        )?;
        let mut map: HashMap<String, Vec<Dependency>> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            let metadata: Option<String> = row.get(4)?;
            Ok(Dependency {
                issue_id: row.get(0)?,
                depends_on_id: row.get(1)?,
                dep_type: DependencyType::from_str_opt(&row.get::<_, String>(2)?)
                    .unwrap_or(DependencyType::Related),
                thread_id: row.get(3)?,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                created_at: row.get(5)?,
                created_by: row.get(6)?,
            })
        })?;
        for dep in rows {
            let dep = dep?;
            map.entry(dep.issue_id.clone()).or_default().push(dep);
        }
        Ok(map)
    }

    fn get_dependency_counts(&self, issue_ids: &[String]) -> Result<HashMap<String, DependencyCounts>> {
        let conn = self.conn.lock().unwrap();
        let mut out = HashMap::new();
        for id in issue_ids {
            let dependency_count: i32 = conn.query_row(
                "SELECT COUNT(*) FROM dependencies WHERE issue_id = ?",
                params![id],
                |row| row.get(0),
            )?;
            let dependent_count: i32 = conn.query_row(
                "SELECT COUNT(*) FROM dependencies WHERE depends_on_id = ?",
                params![id],
                |row| row.get(0),
            )?;
            out.insert(
                id.clone(),
                DependencyCounts {
                    dependency_count,
                    dependent_count,
                },
            );
        }
        Ok(out)
    }

    fn get_dependency_tree(
        &self,
        issue_id: &str,
        max_depth: i32,
        _show_all_paths: bool,
        reverse: bool,
    ) -> Result<Vec<TreeNode>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier = vec![(issue_id.to_string(), 0i32)];
        visited.insert(issue_id.to_string());

        while let Some((current, depth)) = frontier.pop() {
            if depth >= max_depth {
                continue;
            }
            let sql = if reverse {
                "SELECT issue_id FROM dependencies WHERE depends_on_id = ?"
            } else {
                "SELECT depends_on_id FROM dependencies WHERE issue_id = ?"
            };
            let mut stmt = conn.prepare(sql)?;
            let next_ids = stmt
                .query_map(params![current], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;

            for next_id in next_ids {
                let truncated = depth + 1 >= max_depth;
                if let Some(issue) = Self::fetch_issue(&conn, &next_id)? {
                    let issue = self.hydrate(&conn, issue)?;
                    out.push(TreeNode {
                        issue,
                        depth: depth + 1,
                        parent_id: current.clone(),
                        truncated,
                    });
                }
                if visited.insert(next_id.clone()) {
                    frontier.push((next_id, depth + 1));
                }
            }
        }

        Ok(out)
    }

    fn detect_cycles(&self) -> Result<Vec<Vec<Issue>>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT issue_id, depends_on_id FROM dependencies WHERE type = 'blocks'",
        )?;
        let edges: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &edges {
            adjacency.entry(from.clone()).or_default().push(to.clone());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();

        fn visit(
            node: &str,
            adjacency: &HashMap<String, Vec<String>>,
            marks: &mut HashMap<String, Mark>,
            stack: &mut Vec<String>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            if let Some(Mark::Done) = marks.get(node) {
                return;
            }
            if let Some(Mark::Visiting) = marks.get(node) {
                if let Some(pos) = stack.iter().position(|n| n == node) {
                    cycles.push(stack[pos..].to_vec());
                }
                return;
            }
            marks.insert(node.to_string(), Mark::Visiting);
            stack.push(node.to_string());
            if let Some(next) = adjacency.get(node) {
                for n in next {
                    visit(n, adjacency, marks, stack, cycles);
                }
            }
            stack.pop();
            marks.insert(node.to_string(), Mark::Done);
        }

        let nodes: HashSet<String> = adjacency.keys().cloned().collect();
        for node in nodes {
            let mut stack = Vec::new();
            visit(&node, &adjacency, &mut marks, &mut stack, &mut cycles);
        }

        let mut out = Vec::new();
        for cycle in cycles {
            let mut issues = Vec::new();
            for id in cycle {
                if let Some(issue) = Self::fetch_issue(&conn, &id)? {
                    issues.push(self.hydrate(&conn, issue)?);
                }
            }
            out.push(issues);
        }
        Ok(out)
    }

    fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
            params![issue_id, label],
        )?;

        self.record_event(&conn, issue_id, EventType::LabelAdded, actor, None, Some(label), None)?;
        self.mark_dirty(&conn, issue_id)?;

        Ok(())
    }

    fn remove_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "DELETE FROM labels WHERE issue_id = ? AND label = ?",
            params![issue_id, label],
        )?;

        self.record_event(&conn, issue_id, EventType::LabelRemoved, actor, Some(label), None, None)?;
        self.mark_dirty(&conn, issue_id)?;

        Ok(())
    }

    fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
        let labels = stmt
            .query_map(params![issue_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }

    fn get_issues_by_label(&self, label: &str) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT issue_id FROM labels WHERE label = ?")?;
        let ids = stmt
            .query_map(params![label], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(issue) = Self::fetch_issue(&conn, &id)? {
                out.push(self.hydrate(&conn, issue)?);
            }
        }
        Ok(out)
    }

    fn get_ready_work(&self, filter: &WorkFilter) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().unwrap();

        // Ready = status matches, and no unmet `blocks` dependency.
        let mut sql = format!(
            "SELECT {} FROM issues i WHERE i.status = ?
             AND NOT EXISTS (
                 SELECT 1 FROM dependencies d
                 JOIN issues blocker ON blocker.id = d.depends_on_id
                 WHERE d.issue_id = i.id AND d.type = 'blocks'
                   AND blocker.status NOT IN ('closed', 'tombstone')
             )",
            Self::ISSUE_COLUMNS
        );

        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(filter.status.as_str().to_string())];

        if let Some(priority) = filter.priority {
            sql.push_str(" AND i.priority = ?");
            bind.push(Box::new(priority));
        }
        if let Some(ref assignee) = filter.assignee {
            sql.push_str(" AND i.assignee = ?");
            bind.push(Box::new(assignee.clone()));
        }

        match filter.sort_policy {
            SortPolicy::Priority => sql.push_str(" ORDER BY i.priority ASC, i.created_at ASC"),
            SortPolicy::Oldest => sql.push_str(" ORDER BY i.created_at ASC"),
            SortPolicy::Hybrid => sql.push_str(
                " ORDER BY (julianday('now') - julianday(i.created_at)) * 24 < 48 DESC, i.priority ASC, i.created_at ASC",
            ),
        }

        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let mut issues = stmt
            .query_map(params_refs.as_slice(), Self::row_to_issue)?
            .collect::<rusqlite::Result<Vec<Issue>>>()?;

        if !filter.labels.is_empty() || !filter.labels_any.is_empty() {
            let mut filtered = Vec::new();
            for issue in issues.drain(..) {
                let labels: HashSet<String> = Self::fetch_labels(&conn, &issue.id)?.into_iter().collect();
                let and_ok = filter.labels.iter().all(|l| labels.contains(l));
                let or_ok = filter.labels_any.is_empty() || filter.labels_any.iter().any(|l| labels.contains(l));
                if and_ok && or_ok {
                    filtered.push(issue);
                }
            }
            issues = filtered;
        }

        issues
            .into_iter()
            .map(|issue| self.hydrate(&conn, issue))
            .collect()
    }

    fn get_blocked_issues(&self) -> Result<Vec<BlockedIssue>> {
        let conn = self.conn.lock().unwrap();

        let sql = format!(
            "SELECT {} FROM issues i WHERE EXISTS (
                 SELECT 1 FROM dependencies d
                 JOIN issues blocker ON blocker.id = d.depends_on_id
                 WHERE d.issue_id = i.id AND d.type = 'blocks'
                   AND blocker.status NOT IN ('closed', 'tombstone')
             ) ORDER BY i.id ASC",
            Self::ISSUE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let issues = stmt
            .query_map([], Self::row_to_issue)?
            .collect::<rusqlite::Result<Vec<Issue>>>()?;

        let mut out = Vec::with_capacity(issues.len());
        for issue in issues {
            let mut stmt = conn.prepare(
                "SELECT d.depends_on_id FROM dependencies d
                 JOIN issues blocker ON blocker.id = d.depends_on_id
                 WHERE d.issue_id = ? AND d.type = 'blocks' AND blocker.status NOT IN ('closed', 'tombstone')",
            )?;
            let blocked_by = stmt
                .query_map(params![issue.id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            let issue = self.hydrate(&conn, issue)?;
            out.push(BlockedIssue {
                blocked_by_count: blocked_by.len() as i32,
                blocked_by,
                issue,
            });
        }
        Ok(out)
    }

    fn get_epics_eligible_for_closure(&self) -> Result<Vec<EpicStatus>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM issues WHERE issue_type = 'epic' AND status NOT IN ('closed', 'tombstone')",
            Self::ISSUE_COLUMNS
        ))?;
        let epics = stmt
            .query_map([], Self::row_to_issue)?
            .collect::<rusqlite::Result<Vec<Issue>>>()?;

        let mut out = Vec::new();
        for epic in epics {
            let mut stmt = conn.prepare(
                "SELECT depends_on_id FROM dependencies WHERE issue_id = ? AND type = 'parent-child'",
            )?;
            let child_ids = stmt
                .query_map(params![epic.id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;

            let total_children = child_ids.len() as i32;
            let mut closed_children = 0i32;
            for id in &child_ids {
                if let Some(child) = Self::fetch_issue(&conn, id)? {
                    if child.status == Status::Closed {
                        closed_children += 1;
                    }
                }
            }

            let eligible_for_close = total_children > 0 && closed_children == total_children;
            let epic = self.hydrate(&conn, epic)?;
            out.push(EpicStatus {
                epic,
                total_children,
                closed_children,
                eligible_for_close,
            });
        }

        Ok(out.into_iter().filter(|e| e.eligible_for_close).collect())
    }

    fn get_stale_issues(&self, filter: &StaleFilter) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = format!(
            "SELECT {} FROM issues WHERE (julianday('now') - julianday(updated_at)) >= ?",
            Self::ISSUE_COLUMNS
        );
        if !filter.status.is_empty() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY updated_at ASC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let issues = if filter.status.is_empty() {
            stmt.query_map(params![filter.days], Self::row_to_issue)?
                .collect::<rusqlite::Result<Vec<Issue>>>()?
        } else {
            stmt.query_map(params![filter.days, filter.status], Self::row_to_issue)?
                .collect::<rusqlite::Result<Vec<Issue>>>()?
        };

        issues
            .into_iter()
            .map(|issue| self.hydrate(&conn, issue))
            .collect()
    }

    fn add_comment(&self, issue_id: &str, actor: &str, comment: &str) -> Result<()> {
        self.add_issue_comment(issue_id, actor, comment)?;
        Ok(())
    }

    fn get_events(&self, issue_id: &str, limit: i32) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = "SELECT id, issue_id, event_type, actor, old_value, new_value, comment, created_at
                        FROM events WHERE issue_id = ? ORDER BY id DESC"
            .to_string();
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![issue_id], |row| {
                let event_type: String = row.get(2)?;
                Ok(Event {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    event_type: serde_json::from_value(serde_json::Value::String(event_type))
                        .unwrap_or(EventType::Updated),
                    actor: row.get(3)?,
                    old_value: row.get(4)?,
                    new_value: row.get(5)?,
                    comment: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Event>>>()?;
        Ok(events)
    }

    fn add_issue_comment(&self, issue_id: &str, author: &str, text: &str) -> Result<Comment> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO comments (issue_id, author, text, created_at) VALUES (?, ?, ?, ?)",
            params![issue_id, author, text, now],
        )?;

        let id = conn.last_insert_rowid();

        self.record_event(&conn, issue_id, EventType::Commented, author, None, None, Some(text))?;
        self.mark_dirty(&conn, issue_id)?;

        Ok(Comment {
            id,
            issue_id: issue_id.to_string(),
            author: author.to_string(),
            text: text.to_string(),
            created_at: now,
        })
    }

    fn get_issue_comments(&self, issue_id: &str) -> Result<Vec<Comment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, issue_id, author, text, created_at FROM comments WHERE issue_id = ? ORDER BY id",
        )?;
        let comments = stmt
            .query_map(params![issue_id], |row| {
                Ok(Comment {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    author: row.get(2)?,
                    text: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Comment>>>()?;
        Ok(comments)
    }

    fn get_statistics(&self) -> Result<Statistics> {
        let conn = self.conn.lock().unwrap();

        let count = |status: &str| -> rusqlite::Result<i32> {
            conn.query_row(
                "SELECT COUNT(*) FROM issues WHERE status = ?",
                params![status],
                |row| row.get(0),
            )
        };

        let total_issues: i32 =
            conn.query_row("SELECT COUNT(*) FROM issues WHERE status != 'tombstone'", [], |row| row.get(0))?;
        let open_issues = count("open")?;
        let in_progress_issues = count("in_progress")?;
        let closed_issues = count("closed")?;
        let blocked_issues = count("blocked")?;

        let ready_issues: i32 = conn.query_row(
            "SELECT COUNT(*) FROM issues i WHERE i.status = 'open' AND NOT EXISTS (
                 SELECT 1 FROM dependencies d
                 JOIN issues blocker ON blocker.id = d.depends_on_id
                 WHERE d.issue_id = i.id AND d.type = 'blocks' AND blocker.status NOT IN ('closed', 'tombstone')
             )",
            [],
            |row| row.get(0),
        )?;

        let average_lead_time_hours: f64 = conn
            .query_row(
                "SELECT AVG((julianday(closed_at) - julianday(created_at)) * 24) FROM issues WHERE closed_at IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0.0);

        let epics_eligible_for_closure = self.get_epics_eligible_for_closure()?.len() as i32;

        Ok(Statistics {
            total_issues,
            open_issues,
            in_progress_issues,
            closed_issues,
            blocked_issues,
            ready_issues,
            epics_eligible_for_closure,
            average_lead_time_hours,
        })
    }

    fn get_dirty_issues(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT issue_id FROM dirty_issues ORDER BY marked_at")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn get_dirty_issue_hash(&self, issue_id: &str) -> Result<String> {
        match self.get_issue(issue_id)? {
            Some(issue) => Ok(issue.compute_content_hash()),
            None => Ok(String::new()),
        }
    }

    fn clear_dirty_issues(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM dirty_issues", [])?;
        Ok(())
    }

    fn clear_dirty_issues_by_id(&self, issue_ids: &[String]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for id in issue_ids {
            conn.execute("DELETE FROM dirty_issues WHERE issue_id = ?", params![id])?;
        }
        Ok(())
    }

    fn get_export_hash(&self, issue_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let hash = conn
            .query_row(
                "SELECT content_hash FROM export_hashes WHERE issue_id = ?",
                params![issue_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    fn set_export_hash(&self, issue_id: &str, content_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO export_hashes (issue_id, content_hash) VALUES (?, ?)",
            params![issue_id, content_hash],
        )?;
        Ok(())
    }

    fn clear_all_export_hashes(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM export_hashes", [])?;
        Ok(())
    }

    fn get_jsonl_file_hash(&self) -> Result<Option<String>> {
        self.get_metadata("jsonl_file_hash")
    }

    fn set_jsonl_file_hash(&self, file_hash: &str) -> Result<()> {
        self.set_metadata("jsonl_file_hash", file_hash)
    }

    fn get_next_child_id(&self, parent_id: &str) -> Result<String> {
        let conn = self.conn.lock().unwrap();

        let last_child: i32 = conn
            .query_row(
                "SELECT last_child FROM child_counters WHERE parent_id = ?",
                params![parent_id],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let next_child = last_child + 1;

        conn.execute(
            "INSERT OR REPLACE INTO child_counters (parent_id, last_child) VALUES (?, ?)",
            params![parent_id, next_child],
        )?;

        Ok(format!("{}.{}", parent_id, next_child))
    }

    fn generate_next_id(&self, prefix: &str) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let next: i32 = conn
            .query_row(
                "SELECT last_child FROM child_counters WHERE parent_id = ?",
                params![prefix],
                |row| row.get(0),
            )
            .unwrap_or(0)
            + 1;
        conn.execute(
            "INSERT OR REPLACE INTO child_counters (parent_id, last_child) VALUES (?, ?)",
            params![prefix, next],
        )?;
        Ok(format!("{prefix}-{next:x}"))
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM config WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn get_all_config(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM config")?;
        let config = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<HashMap<String, String>>>()?;
        Ok(config)
    }

    fn delete_config(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM config WHERE key = ?", params![key])?;
        Ok(())
    }

    fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM metadata WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn update_issue_id(&self, old_id: &str, new_id: &str, _issue: &Issue, actor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute("UPDATE issues SET id = ? WHERE id = ?", params![new_id, old_id])?;
        conn.execute(
            "UPDATE dependencies SET issue_id = ? WHERE issue_id = ?",
            params![new_id, old_id],
        )?;
        conn.execute(
            "UPDATE dependencies SET depends_on_id = ? WHERE depends_on_id = ?",
            params![new_id, old_id],
        )?;
        conn.execute("UPDATE labels SET issue_id = ? WHERE issue_id = ?", params![new_id, old_id])?;
        conn.execute("UPDATE comments SET issue_id = ? WHERE issue_id = ?", params![new_id, old_id])?;
        conn.execute("UPDATE events SET issue_id = ? WHERE issue_id = ?", params![new_id, old_id])?;
        conn.execute(
            "UPDATE dirty_issues SET issue_id = ? WHERE issue_id = ?",
            params![new_id, old_id],
        )?;
        conn.execute(
            "UPDATE export_hashes SET issue_id = ? WHERE issue_id = ?",
            params![new_id, old_id],
        )?;

        self.record_event(&conn, new_id, EventType::Updated, actor, Some(old_id), Some(new_id), Some("id remapped"))?;
        self.mark_dirty(&conn, new_id)?;

        Ok(())
    }

    fn rename_dependency_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let like = format!("{old_prefix}-%");

        let mut stmt = conn.prepare("SELECT issue_id, depends_on_id FROM dependencies WHERE issue_id LIKE ? OR depends_on_id LIKE ?")?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![like, like], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        for (issue_id, depends_on_id) in rows {
            let new_issue_id = rename_prefix(&issue_id, old_prefix, new_prefix);
            let new_depends_on_id = rename_prefix(&depends_on_id, old_prefix, new_prefix);
            conn.execute(
                "UPDATE dependencies SET issue_id = ?, depends_on_id = ? WHERE issue_id = ? AND depends_on_id = ?",
                params![new_issue_id, new_depends_on_id, issue_id, depends_on_id],
            )?;
        }
        Ok(())
    }

    fn rename_counter_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let like = format!("{old_prefix}-%");
        let mut stmt = conn.prepare("SELECT parent_id, last_child FROM child_counters WHERE parent_id LIKE ?")?;
        let rows: Vec<(String, i32)> = stmt
            .query_map(params![like], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        for (parent_id, last_child) in rows {
            let new_parent = rename_prefix(&parent_id, old_prefix, new_prefix);
            conn.execute("DELETE FROM child_counters WHERE parent_id = ?", params![parent_id])?;
            conn.execute(
                "INSERT OR REPLACE INTO child_counters (parent_id, last_child) VALUES (?, ?)",
                params![new_parent, last_child],
            )?;
        }
        Ok(())
    }

    fn reopen_if_stale(&self) -> Result<()> {
        let current_len = fs::metadata(&self.path).ok().map(|m| m.len());
        let mut opened_len = self.opened_len.lock().unwrap();
        if *opened_len != current_len {
            let new_conn = Connection::open(&self.path)
                .with_context(|| format!("failed to reopen database at {:?}", self.path))?;
            apply_schema(&new_conn)?;
            *self.conn.lock().unwrap() = new_conn;
            *opened_len = current_len;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // Connection will be closed when dropped
        Ok(())
    }

    fn path(&self) -> &str {
        self.path.to_str().unwrap_or("")
    }
}

impl SqliteStorage {
    fn fetch_labels(conn: &Connection, issue_id: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT label FROM labels WHERE issue_id = ?")?;
        stmt.query_map(params![issue_id], |row| row.get(0))?
            .collect()
    }
}

fn rename_prefix(id: &str, old_prefix: &str, new_prefix: &str) -> String {
    match id.strip_prefix(&format!("{old_prefix}-")) {
        Some(rest) => format!("{new_prefix}-{rest}"),
        None => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_issue(id: &str) -> Issue {
        let now = Utc::now();
        Issue {
            id: id.to_string(),
            content_hash: None,
            title: "Test issue".to_string(),
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
            ephemeral: false,
            pinned: false,
            is_template: false,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
        }
    }

    fn open_test_db() -> SqliteStorage {
        SqliteStorage::new(PathBuf::from(":memory:")).unwrap()
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = open_test_db();
        let issue = test_issue("bd-1");
        store.create_issue(&issue, "tester").unwrap();

        let fetched = store.get_issue("bd-1").unwrap().unwrap();
        assert_eq!(fetched.title, "Test issue");
        assert_eq!(store.get_dirty_issues().unwrap(), vec!["bd-1".to_string()]);
    }

    #[test]
    fn delete_writes_tombstone_not_removal() {
        let store = open_test_db();
        store.create_issue(&test_issue("bd-1"), "tester").unwrap();
        store.delete_issue("bd-1").unwrap();

        let fetched = store.get_issue("bd-1").unwrap().unwrap();
        assert_eq!(fetched.status, Status::Tombstone);
    }

    #[test]
    fn ready_work_excludes_blocked_issues() {
        let store = open_test_db();
        store.create_issue(&test_issue("bd-1"), "tester").unwrap();
        store.create_issue(&test_issue("bd-2"), "tester").unwrap();

        store
            .add_dependency(
                &Dependency {
                    issue_id: "bd-1".into(),
                    depends_on_id: "bd-2".into(),
                    dep_type: DependencyType::Blocks,
                    thread_id: None,
                    metadata: None,
                    created_at: Utc::now(),
                    created_by: "tester".into(),
                },
                "tester",
            )
            .unwrap();

        let ready = store.get_ready_work(&WorkFilter::default()).unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&"bd-2"));
        assert!(!ids.contains(&"bd-1"));
    }

    #[test]
    fn closing_blocker_unblocks_dependent() {
        let store = open_test_db();
        store.create_issue(&test_issue("bd-1"), "tester").unwrap();
        store.create_issue(&test_issue("bd-2"), "tester").unwrap();
        store
            .add_dependency(
                &Dependency {
                    issue_id: "bd-1".into(),
                    depends_on_id: "bd-2".into(),
                    dep_type: DependencyType::Blocks,
                    thread_id: None,
                    metadata: None,
                    created_at: Utc::now(),
                    created_by: "tester".into(),
                },
                "tester",
            )
            .unwrap();
        store.close_issue("bd-2", "done", "tester").unwrap();

        let ready = store.get_ready_work(&WorkFilter::default()).unwrap();
        assert!(ready.iter().any(|i| i.id == "bd-1"));
    }

    #[test]
    fn unknown_update_field_is_rejected() {
        let store = open_test_db();
        store.create_issue(&test_issue("bd-1"), "tester").unwrap();
        let mut updates = HashMap::new();
        updates.insert("id".to_string(), "bd-evil".to_string());
        assert!(store.update_issue("bd-1", updates, "tester").is_err());
    }
}
