use anyhow::{Context, Result};
use bd::config::Settings;
use bd::storage::sqlite::SqliteStorage;
use bd::storage::Storage;
use bd::sync::{export_full, export_incremental, import_jsonl};
use bd::types::{Issue, IssueType, Status};
use clap::{Parser, Subcommand};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "bd")]
#[command(about = "Beads - a dependency-aware issue tracker for AI coding agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Database path (default: auto-discover .beads/*.db)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Actor name for audit trail
    #[arg(long, global = true)]
    actor: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Skip the daemon entirely and operate on the store directly
    #[arg(long, global = true)]
    no_daemon: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new issue tracker in the current repository
    Init {
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Create a new issue
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short = 't', long, default_value = "task")]
        issue_type: String,
        #[arg(short, long, default_value = "2")]
        priority: i32,
    },

    /// List issues
    List {
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long)]
        limit: Option<i32>,
    },

    /// Show issue details
    Show { id: String },

    /// Update an issue
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Close an issue
    Close {
        id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Import issues from a JSONL file
    Import {
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Export issues to a JSONL file
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },

    /// Run one sync cycle (pull, auto-import, commit, push) without starting a daemon
    Sync {
        #[arg(long)]
        flush_only: bool,
        #[arg(long)]
        import_only: bool,
        #[arg(long)]
        from_main: bool,
    },

    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Run a git hook handler
    Hook {
        #[command(subcommand)]
        hook: HookKind,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    Start {
        #[arg(long)]
        foreground: bool,
        #[arg(long)]
        local: bool,
    },
    Stop,
    Status,
    Restart,
    Logs,
    Killall,
}

#[derive(Subcommand)]
enum HookKind {
    PreCommit,
    PostMerge,
    PostCheckout,
}

fn discover_beads_dir() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    bd::vcs::find_beads_dir(&cwd).context("no .beads directory found; run `bd init` first")
}

fn db_path(beads_dir: &Path) -> PathBuf {
    beads_dir.join("bd.db")
}

fn jsonl_path(beads_dir: &Path) -> PathBuf {
    beads_dir.join("issues.jsonl")
}

fn open_storage(cli: &Cli) -> Result<(SqliteStorage, PathBuf)> {
    let beads_dir = match &cli.db {
        Some(path) => PathBuf::from(path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
        None => discover_beads_dir()?,
    };
    let path = cli.db.as_ref().map(PathBuf::from).unwrap_or_else(|| db_path(&beads_dir));
    let storage = SqliteStorage::new(path)?;
    Ok((storage, beads_dir))
}

fn actor_name(cli: &Cli) -> String {
    cli.actor.clone().unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "bd".to_string()))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Some(Commands::Init { prefix }) => cmd_init(&cli, prefix.as_deref()),
        Some(Commands::Create { title, description, issue_type, priority }) => {
            cmd_create(&cli, title, description, issue_type, *priority)
        }
        Some(Commands::List { status, limit }) => cmd_list(&cli, status.as_deref(), *limit),
        Some(Commands::Show { id }) => cmd_show(&cli, id),
        Some(Commands::Update { id, title, description, status, priority }) => {
            cmd_update(&cli, id, title.as_deref(), description.as_deref(), status.as_deref(), *priority)
        }
        Some(Commands::Close { id, reason }) => cmd_close(&cli, id, reason.as_deref()),
        Some(Commands::Import { input }) => cmd_import(&cli, input),
        Some(Commands::Export { output, force }) => cmd_export(&cli, output.as_deref(), *force),
        Some(Commands::Sync { flush_only, import_only, from_main }) => {
            cmd_sync(&cli, *flush_only, *import_only, *from_main)
        }
        Some(Commands::Daemon { action }) => cmd_daemon(&cli, action),
        Some(Commands::Hook { hook }) => cmd_hook(&cli, hook),
        None => {
            println!("No command specified. Use --help for usage information.");
            Ok(())
        }
    };

    if let Err(e) = &result {
        if cli.json {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        } else {
            eprintln!("error: {e:#}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_init(_cli: &Cli, prefix: Option<&str>) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let repo_root = bd::vcs::repo_root(&cwd).unwrap_or(cwd);
    let beads_dir = repo_root.join(".beads");
    std::fs::create_dir_all(&beads_dir)?;

    let storage = SqliteStorage::new(db_path(&beads_dir))?;
    let prefix = prefix.unwrap_or("bd");
    storage.set_config("issue_prefix", prefix)?;

    println!("Initialized bd in {} with prefix `{prefix}`", beads_dir.display());
    Ok(())
}

fn cmd_create(cli: &Cli, title: &str, description: &str, issue_type: &str, priority: i32) -> Result<()> {
    let (storage, _beads_dir) = open_storage(cli)?;
    let prefix = storage.get_config("issue_prefix")?.unwrap_or_else(|| "bd".to_string());
    let id = storage.generate_next_id(&prefix)?;
    let now = Utc::now();

    let issue_type = match issue_type {
        "bug" => IssueType::Bug,
        "feature" => IssueType::Feature,
        "epic" => IssueType::Epic,
        "chore" => IssueType::Chore,
        "task" => IssueType::Task,
        other => IssueType::Custom(other.to_string()),
    };

    let issue = Issue {
        id: id.clone(),
        content_hash: None,
        title: title.to_string(),
        description: description.to_string(),
        design: String::new(),
        acceptance_criteria: String::new(),
        notes: String::new(),
        status: Status::Open,
        priority,
        issue_type,
        assignee: String::new(),
        sender: String::new(),
        estimated_minutes: None,
        created_at: now,
        updated_at: now,
        closed_at: None,
        due_at: None,
        defer_until: None,
        last_activity: Some(now),
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
    };

    storage.create_issue(&issue, &actor_name(cli))?;

    if cli.json {
        println!("{}", serde_json::to_string(&issue)?);
    } else {
        println!("Created {id}: {title}");
    }
    Ok(())
}

fn cmd_list(cli: &Cli, status: Option<&str>, limit: Option<i32>) -> Result<()> {
    let (storage, _) = open_storage(cli)?;
    let mut filter = bd::types::IssueFilter::default();
    filter.status = status.and_then(Status::from_str_opt);
    filter.limit = limit.unwrap_or(0);

    let issues = storage.search_issues("", &filter)?;
    if cli.json {
        println!("{}", serde_json::to_string(&issues)?);
    } else {
        for issue in &issues {
            println!("{}\t[{}]\t{}", issue.id, issue.status.as_str(), issue.title);
        }
    }
    Ok(())
}

fn cmd_show(cli: &Cli, id: &str) -> Result<()> {
    let (storage, _) = open_storage(cli)?;
    let issue = storage.get_issue(id)?.context(format!("issue {id} not found"))?;
    if cli.json {
        println!("{}", serde_json::to_string(&issue)?);
    } else {
        println!("{} [{}] {}", issue.id, issue.status.as_str(), issue.title);
        if !issue.description.is_empty() {
            println!("\n{}", issue.description);
        }
    }
    Ok(())
}

fn cmd_update(
    cli: &Cli,
    id: &str,
    title: Option<&str>,
    description: Option<&str>,
    status: Option<&str>,
    priority: Option<i32>,
) -> Result<()> {
    let (storage, _) = open_storage(cli)?;
    let mut updates = HashMap::new();
    if let Some(t) = title {
        updates.insert("title".to_string(), t.to_string());
    }
    if let Some(d) = description {
        updates.insert("description".to_string(), d.to_string());
    }
    if let Some(s) = status {
        updates.insert("status".to_string(), s.to_string());
    }
    if let Some(p) = priority {
        updates.insert("priority".to_string(), p.to_string());
    }
    storage.update_issue(id, updates, &actor_name(cli))?;
    println!("Updated {id}");
    Ok(())
}

fn cmd_close(cli: &Cli, id: &str, reason: Option<&str>) -> Result<()> {
    let (storage, _) = open_storage(cli)?;
    storage.close_issue(id, reason.unwrap_or(""), &actor_name(cli))?;
    println!("Closed {id}");
    Ok(())
}

fn cmd_import(cli: &Cli, input: &Path) -> Result<()> {
    let (storage, _) = open_storage(cli)?;
    let contents = std::fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let prefix = storage.get_config("issue_prefix")?.unwrap_or_else(|| "bd".to_string());
    let report = import_jsonl(&storage, &contents, &prefix, false, &actor_name(cli))?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "created": report.created,
                "updated": report.updated,
                "unchanged": report.unchanged,
                "skipped": report.skipped,
                "remapped": report.remapped,
            })
        );
    } else {
        println!(
            "Imported: {} created, {} updated, {} unchanged, {} skipped",
            report.created, report.updated, report.unchanged, report.skipped
        );
    }
    Ok(())
}

fn cmd_export(cli: &Cli, output: Option<&Path>, force: bool) -> Result<()> {
    let (storage, beads_dir) = open_storage(cli)?;
    let path = output.map(Path::to_path_buf).unwrap_or_else(|| jsonl_path(&beads_dir));

    let report = if force { export_full(&storage, &path)? } else { export_incremental(&storage, &path)? };

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "written": report.written,
                "removed": report.removed,
                "skipped_ephemeral": report.skipped_ephemeral,
                "skipped_foreign": report.skipped_foreign,
            })
        );
    } else {
        println!("Exported to {}: {} written, {} removed", path.display(), report.written, report.removed);
    }
    Ok(())
}

fn cmd_sync(cli: &Cli, flush_only: bool, import_only: bool, _from_main: bool) -> Result<()> {
    let (storage, beads_dir) = open_storage(cli)?;
    let settings = Settings::load(&storage)?;
    let path = jsonl_path(&beads_dir);

    if !flush_only {
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let prefix = settings.issue_prefix().unwrap_or_else(|| "bd".to_string());
            import_jsonl(&storage, &contents, &prefix, false, &actor_name(cli))?;
        }
    }

    if !import_only {
        export_incremental(&storage, &path)?;
    }

    println!("Sync complete");
    Ok(())
}

fn cmd_daemon(cli: &Cli, action: &DaemonAction) -> Result<()> {
    let (storage, beads_dir) = open_storage(cli)?;

    match action {
        DaemonAction::Start { foreground, local } => {
            let repo_root = bd::vcs::repo_root(&beads_dir).unwrap_or_else(|_| beads_dir.clone());
            let opts = bd::daemon::DaemonOptions {
                repo_root,
                beads_dir: beads_dir.clone(),
                jsonl_path: jsonl_path(&beads_dir),
                local_only: *local,
                actor: actor_name(cli),
            };
            if !foreground {
                eprintln!("note: --foreground omitted; running in this process anyway");
            }
            let storage: std::sync::Arc<dyn Storage> = std::sync::Arc::new(storage);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(bd::daemon::run(storage, opts))?;
            Ok(())
        }
        DaemonAction::Stop => {
            let paths = bd::daemon::lifecycle::WorkspacePaths::resolve(&beads_dir);
            if paths.pid_path.exists() {
                let pid: i32 = std::fs::read_to_string(&paths.pid_path)?.trim().parse()?;
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)?;
                println!("Sent SIGTERM to daemon (pid {pid})");
            } else {
                println!("No daemon running for this workspace");
            }
            Ok(())
        }
        DaemonAction::Status => {
            let daemons = bd::daemon::registry::list()?;
            if cli.json {
                println!("{}", serde_json::to_string(&daemons)?);
            } else {
                for d in &daemons {
                    println!("{}\tpid={}\t{}", d.workspace.display(), d.pid, d.version);
                }
            }
            Ok(())
        }
        DaemonAction::Restart => {
            println!("Restart by running `bd daemon stop` followed by `bd daemon start`");
            Ok(())
        }
        DaemonAction::Logs => {
            println!("Daemon logs are written to the process's stderr (see env_logger configuration)");
            Ok(())
        }
        DaemonAction::Killall => {
            for d in bd::daemon::registry::list()? {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(d.pid as i32), nix::sys::signal::Signal::SIGTERM);
            }
            println!("Sent SIGTERM to all registered daemons");
            Ok(())
        }
    }
}

fn cmd_hook(cli: &Cli, hook: &HookKind) -> Result<()> {
    let (storage, beads_dir) = open_storage(cli)?;
    let path = jsonl_path(&beads_dir);

    match hook {
        HookKind::PreCommit => {
            export_incremental(&storage, &path)?;
        }
        HookKind::PostMerge | HookKind::PostCheckout => {
            if path.exists() {
                let contents = std::fs::read_to_string(&path)?;
                let prefix = storage.get_config("issue_prefix")?.unwrap_or_else(|| "bd".to_string());
                import_jsonl(&storage, &contents, &prefix, false, &actor_name(cli))?;
            }
        }
    }
    Ok(())
}
