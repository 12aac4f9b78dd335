//! Git plumbing: the workspace root, the default remote/branch, commits,
//! pushes, and the dedicated sync-branch worktree. Shells out to the `git`
//! binary rather than linking a git library, matching the rest of this
//! ecosystem's preference for invoking the real tool over reimplementing it.

use crate::error::{BeadsError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| BeadsError::environment(format!("failed to spawn git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BeadsError::environment(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Finds the repository root from a starting directory, resilient to being
/// invoked from a worktree or a subdirectory.
pub fn repo_root(start: &Path) -> Result<PathBuf> {
    let out = run_git(start, &["rev-parse", "--show-toplevel"])?;
    Ok(PathBuf::from(out))
}

/// The `.git` common directory, shared across all worktrees of a repository.
pub fn common_dir(start: &Path) -> Result<PathBuf> {
    let out = run_git(start, &["rev-parse", "--path-format=absolute", "--git-common-dir"])?;
    Ok(PathBuf::from(out))
}

/// Finds the `.beads/` directory by walking up from `start`, ignoring any
/// nested `.beads/.beads/` (a symptom of running init twice).
pub fn find_beads_dir(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    while let Some(d) = dir {
        let candidate = d.join(".beads");
        if candidate.is_dir() && !candidate.join(".beads").is_dir() {
            return Some(candidate);
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    None
}

pub fn current_branch(repo: &Path) -> Result<String> {
    run_git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// The default branch of `remote`, resolved via the remote's `HEAD` symref,
/// falling back to `main` if the remote hasn't been asked about it yet.
pub fn default_branch(repo: &Path, remote: &str) -> Result<String> {
    let refname = format!("refs/remotes/{remote}/HEAD");
    match run_git(repo, &["symbolic-ref", "--short", &refname]) {
        Ok(full) => Ok(full
            .strip_prefix(&format!("{remote}/"))
            .unwrap_or(&full)
            .to_string()),
        Err(_) => Ok("main".to_string()),
    }
}

pub fn has_remote(repo: &Path, remote: &str) -> bool {
    run_git(repo, &["remote", "get-url", remote]).is_ok()
}

#[derive(Debug, Clone)]
pub struct CommitOptions<'a> {
    pub author: Option<&'a str>,
    pub no_gpg_sign: bool,
}

/// Stages `paths` and commits with `message`, honoring the configured author
/// and GPG-signing override. A no-op (returns `Ok(())`) if there is nothing
/// staged to commit.
pub fn commit(repo: &Path, paths: &[&Path], message: &str, opts: &CommitOptions) -> Result<()> {
    let mut add_args = vec!["add".to_string()];
    add_args.extend(paths.iter().map(|p| p.to_string_lossy().to_string()));
    run_git(repo, &add_args.iter().map(String::as_str).collect::<Vec<_>>())?;

    let status = run_git(repo, &["status", "--porcelain", "--untracked-files=no"])?;
    if status.trim().is_empty() {
        return Ok(());
    }

    let mut commit_args = vec!["commit", "-m", message];
    if opts.no_gpg_sign {
        commit_args.push("--no-gpg-sign");
    }
    if let Some(author) = opts.author {
        commit_args.push("--author");
        commit_args.push(author);
    }
    run_git(repo, &commit_args)?;
    Ok(())
}

/// Pushes `branch` to `remote`, retrying once with a rebase on a
/// non-fast-forward rejection. On a rebase conflict, aborts the rebase so
/// the worktree is left clean and surfaces the original conflict error.
pub fn push_with_retry(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    match run_git(repo, &["push", remote, branch]) {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("non-fast-forward") || e.to_string().contains("fetch first") => {
            if let Err(rebase_err) = run_git(repo, &["pull", "--rebase", remote, branch]) {
                if let Err(abort_err) = run_git(repo, &["rebase", "--abort"]) {
                    log::warn!("rebase --abort after conflict also failed: {abort_err}");
                }
                return Err(rebase_err);
            }
            run_git(repo, &["push", remote, branch])?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub fn pull(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    run_git(repo, &["pull", "--ff-only", remote, branch]).map(|_| ())
}

/// Path of the dedicated worktree used for the sync branch, nested under the
/// repo's common git directory so it survives regardless of which worktree
/// the daemon was started from.
pub fn sync_worktree_path(common_dir: &Path, branch: &str) -> PathBuf {
    common_dir.join("beads-worktrees").join(branch)
}

/// Ensures a worktree for `branch` exists at [`sync_worktree_path`], creating
/// it (and the branch, if it doesn't exist yet) on demand.
pub fn ensure_sync_worktree(repo: &Path, common_dir: &Path, branch: &str) -> Result<PathBuf> {
    let path = sync_worktree_path(common_dir, branch);
    if path.is_dir() {
        return Ok(path);
    }

    let path_str = path.to_string_lossy().to_string();
    let branch_exists = run_git(repo, &["rev-parse", "--verify", branch]).is_ok();
    if branch_exists {
        run_git(repo, &["worktree", "add", &path_str, branch])?;
    } else {
        run_git(repo, &["worktree", "add", "-b", branch, &path_str])?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) {
        Command::new("git").args(["init", "-q"]).current_dir(dir).status().unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .status()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir)
            .status()
            .unwrap();
    }

    #[test]
    fn repo_root_resolves_from_subdirectory() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        fs::create_dir(dir.path().join("sub")).unwrap();

        let root = repo_root(&dir.path().join("sub")).unwrap();
        assert_eq!(fs::canonicalize(root).unwrap(), fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn find_beads_dir_walks_up_and_skips_nested() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".beads")).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let found = find_beads_dir(&dir.path().join("sub")).unwrap();
        assert_eq!(fs::canonicalize(found).unwrap(), fs::canonicalize(dir.path().join(".beads")).unwrap());
    }

    #[test]
    fn commit_is_noop_with_nothing_staged() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let opts = CommitOptions { author: None, no_gpg_sign: true };
        commit(dir.path(), &[], "empty", &opts).unwrap();
    }

    #[test]
    fn push_conflict_during_rebase_aborts_and_leaves_worktree_clean() {
        let bare = tempdir().unwrap();
        Command::new("git").args(["init", "-q", "--bare"]).current_dir(bare.path()).status().unwrap();
        let bare_path = bare.path().to_str().unwrap();

        let work_a = tempdir().unwrap();
        Command::new("git").args(["clone", "-q", bare_path, "."]).current_dir(work_a.path()).status().unwrap();
        init_repo(work_a.path());
        Command::new("git")
            .args(["symbolic-ref", "HEAD", "refs/heads/main"])
            .current_dir(work_a.path())
            .status()
            .unwrap();
        fs::write(work_a.path().join("f.txt"), "line1\n").unwrap();
        Command::new("git").args(["add", "f.txt"]).current_dir(work_a.path()).status().unwrap();
        Command::new("git").args(["commit", "-q", "-m", "base"]).current_dir(work_a.path()).status().unwrap();
        Command::new("git").args(["push", "-q", "origin", "main"]).current_dir(work_a.path()).status().unwrap();

        let work_b = tempdir().unwrap();
        Command::new("git")
            .args(["clone", "-q", "-b", "main", bare_path, "."])
            .current_dir(work_b.path())
            .status()
            .unwrap();
        init_repo(work_b.path());

        // A and B each edit the same line of the same file differently, so
        // B's rebase onto A's push is guaranteed to conflict.
        fs::write(work_a.path().join("f.txt"), "line1-A\n").unwrap();
        Command::new("git").args(["commit", "-q", "-am", "from A"]).current_dir(work_a.path()).status().unwrap();
        Command::new("git").args(["push", "-q", "origin", "main"]).current_dir(work_a.path()).status().unwrap();

        fs::write(work_b.path().join("f.txt"), "line1-B\n").unwrap();
        Command::new("git").args(["commit", "-q", "-am", "from B"]).current_dir(work_b.path()).status().unwrap();

        let result = push_with_retry(work_b.path(), "origin", "main");
        assert!(result.is_err());

        let status = run_git(work_b.path(), &["status", "--porcelain"]).unwrap();
        assert!(status.trim().is_empty(), "worktree should be clean after rebase abort, got: {status}");
    }
}
