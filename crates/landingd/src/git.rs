//! Git operations for the landing daemon.
//!
//! Per-task worktrees, target-branch sync and diff statistics, all driven
//! through the `git` binary.

use async_trait::async_trait;
use landing_core::{Config, Id, Task};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict in {}: {message}", files.join(", "))]
    MergeConflict { files: Vec<String>, message: String },
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run git in `dir` and return trimmed stdout.
async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().to_string())
}

/// Whether `git rev-parse --verify` resolves `reference`.
async fn ref_exists(dir: &Path, reference: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", reference])
        .current_dir(dir)
        .output()
        .await?;
    Ok(output.status.success())
}

/// Check if a branch exists locally.
pub async fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    ref_exists(dir, &format!("refs/heads/{branch}")).await
}

/// Create a new branch from base without checking it out.
pub async fn create_branch(dir: &Path, branch: &str, base: &str) -> Result<()> {
    git(dir, &["branch", branch, base]).await.map(|_| ())
}

/// Create a worktree at `worktree_path` for `branch`, creating the branch
/// from `base` when it doesn't exist.
pub async fn create_worktree(
    repo: &Path,
    worktree_path: &Path,
    branch: &str,
    base: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GitError::CommandFailed(format!("failed to create parent directory: {e}"))
        })?;
    }

    if !branch_exists(repo, branch).await? {
        create_branch(repo, branch, base).await?;
    }

    let path = worktree_path.to_string_lossy();
    git(repo, &["worktree", "add", path.as_ref(), branch]).await?;
    Ok(())
}

/// Force remove a worktree (even with local changes).
pub async fn remove_worktree_force(repo: &Path, worktree_path: &Path) -> Result<()> {
    let path = worktree_path.to_string_lossy();
    git(repo, &["worktree", "remove", "--force", path.as_ref()]).await?;
    Ok(())
}

pub async fn prune_worktrees(repo: &Path) -> Result<()> {
    git(repo, &["worktree", "prune"]).await.map(|_| ())
}

pub async fn head_sha(dir: &Path) -> Result<String> {
    git(dir, &["rev-parse", "HEAD"]).await
}

/// Bring the target branch up to date and return the ref to merge from.
///
/// Prefers `origin/<target>`; falls back to the local branch when there is
/// no remote or the fetch fails.
pub async fn fetch_target(dir: &Path, target: &str) -> Result<String> {
    match git(dir, &["fetch", "origin", target]).await {
        Ok(_) => {
            let remote_ref = format!("origin/{target}");
            if ref_exists(dir, &remote_ref).await? {
                return Ok(remote_ref);
            }
        }
        Err(e) => debug!(target, error = %e, "fetch failed, using local branch"),
    }

    if ref_exists(dir, &format!("refs/heads/{target}")).await? {
        Ok(target.to_string())
    } else {
        Err(GitError::CommandFailed(format!(
            "target branch not found: {target}"
        )))
    }
}

/// Number of commits reachable from `to` but not from `from`.
pub async fn commits_between(dir: &Path, from: &str, to: &str) -> Result<u32> {
    let out = git(dir, &["rev-list", "--count", &format!("{from}..{to}")]).await?;
    out.parse()
        .map_err(|_| GitError::CommandFailed(format!("unexpected rev-list output: {out}")))
}

/// Merge `source` into the checked-out branch.
///
/// On conflict the merge is aborted and the conflicting paths are returned
/// in the error.
pub async fn merge_branch(dir: &Path, source: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["merge", source, "--no-edit"])
        .current_dir(dir)
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stdout.contains("CONFLICT")
        || stderr.contains("CONFLICT")
        || stdout.contains("Automatic merge failed")
        || stderr.contains("Automatic merge failed")
    {
        let files = git(dir, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|out| out.lines().map(str::to_string).collect())
            .unwrap_or_default();
        if let Err(e) = git(dir, &["merge", "--abort"]).await {
            warn!(error = %e, "merge --abort failed");
        }
        return Err(GitError::MergeConflict {
            files,
            message: format!("merge from {source} failed"),
        });
    }

    Err(GitError::CommandFailed(format!(
        "git merge {source}: {}",
        stderr.trim()
    )))
}

/// Size of a diff as reported by `git diff --numstat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStat {
    pub files: u32,
    pub lines: u32,
}

/// Parse `--numstat` output. Binary files count as changed with no lines.
pub fn parse_numstat(output: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for line in output.lines() {
        let mut parts = line.split('\t');
        let (Some(added), Some(deleted), Some(_path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        stat.files += 1;
        stat.lines += added.parse::<u32>().unwrap_or(0) + deleted.parse::<u32>().unwrap_or(0);
    }
    stat
}

/// Changes on HEAD relative to its merge base with `base`.
pub async fn diff_stat(dir: &Path, base: &str) -> Result<DiffStat> {
    let out = git(dir, &["diff", "--numstat", &format!("{base}...HEAD")]).await?;
    Ok(parse_numstat(&out))
}

// --- Git service ---

/// A task's isolated working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Working-tree setup and teardown for a task's branch.
#[async_trait]
pub trait GitService: Send + Sync {
    async fn prepare(&self, work_dir: &Path, task: &Task) -> Result<Worktree>;
    async fn cleanup(&self, work_dir: &Path, task_id: &Id) -> Result<()>;
}

/// `git worktree` backed service: `<worktree_dir>/<task_id>` on
/// `<branch_prefix>/<task_id>`.
#[derive(Debug, Clone)]
pub struct CommandGit {
    worktree_dir: PathBuf,
    branch_prefix: String,
    target_branch: String,
}

impl CommandGit {
    pub fn new(config: &Config) -> Self {
        Self {
            worktree_dir: config.worktree_dir.clone(),
            branch_prefix: config.branch_prefix.clone(),
            target_branch: config.target_branch.clone(),
        }
    }

    fn worktree_path(&self, work_dir: &Path, task_id: &Id) -> PathBuf {
        let root = if self.worktree_dir.is_relative() {
            work_dir.join(&self.worktree_dir)
        } else {
            self.worktree_dir.clone()
        };
        root.join(task_id.as_ref())
    }

    fn branch(&self, task_id: &Id) -> String {
        format!("{}/{}", self.branch_prefix, task_id)
    }
}

#[async_trait]
impl GitService for CommandGit {
    async fn prepare(&self, work_dir: &Path, task: &Task) -> Result<Worktree> {
        if !work_dir.join(".git").exists() {
            return Err(GitError::NotARepo(work_dir.display().to_string()));
        }

        let path = self.worktree_path(work_dir, &task.id);
        let branch = self.branch(&task.id);

        if path.join(".git").exists() {
            debug!(task_id = %task.id, path = %path.display(), "reusing worktree");
            return Ok(Worktree { path, branch });
        }

        let target = task
            .pr
            .as_ref()
            .and_then(|pr| pr.target_branch.clone())
            .unwrap_or_else(|| self.target_branch.clone());
        let remote_target = format!("origin/{target}");
        let base = if ref_exists(work_dir, &remote_target).await? {
            remote_target
        } else {
            target
        };

        create_worktree(work_dir, &path, &branch, &base).await?;
        info!(task_id = %task.id, path = %path.display(), branch = %branch, "worktree created");
        Ok(Worktree { path, branch })
    }

    async fn cleanup(&self, work_dir: &Path, task_id: &Id) -> Result<()> {
        let path = self.worktree_path(work_dir, task_id);
        if path.exists() {
            remove_worktree_force(work_dir, &path).await?;
            info!(task_id = %task_id, path = %path.display(), "worktree removed");
        }
        prune_worktrees(work_dir).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{commit_file, run, setup_test_repo};
    use super::*;
    use landing_core::TaskWeight;

    #[test]
    fn parse_numstat_counts_files_and_lines() {
        let out = "10\t2\tsrc/lib.rs\n-\t-\tassets/logo.png\n3\t0\tREADME.md\n";
        assert_eq!(parse_numstat(out), DiffStat { files: 3, lines: 15 });
        assert_eq!(parse_numstat(""), DiffStat::default());
    }

    #[tokio::test]
    async fn fetch_target_falls_back_to_local_branch() {
        let dir = setup_test_repo();
        let reference = fetch_target(dir.path(), "main").await.unwrap();
        assert_eq!(reference, "main");

        assert!(fetch_target(dir.path(), "does-not-exist").await.is_err());
    }

    #[tokio::test]
    async fn merge_branch_no_conflict() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", "HEAD").await.unwrap();
        commit_file(dir.path(), "main.txt", "main\n", "main change");
        run(dir.path(), &["checkout", "feature"]);

        assert_eq!(commits_between(dir.path(), "feature", "main").await.unwrap(), 1);
        merge_branch(dir.path(), "main").await.unwrap();
        assert!(dir.path().join("main.txt").exists());
    }

    #[tokio::test]
    async fn merge_branch_conflict_aborts_and_lists_files() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", "HEAD").await.unwrap();
        commit_file(dir.path(), "README.md", "# Main\n", "main edit");
        run(dir.path(), &["checkout", "feature"]);
        commit_file(dir.path(), "README.md", "# Feature\n", "feature edit");

        let err = merge_branch(dir.path(), "main").await.unwrap_err();
        match err {
            GitError::MergeConflict { files, .. } => assert_eq!(files, vec!["README.md"]),
            other => panic!("expected conflict, got {other:?}"),
        }
        // Aborted merge leaves no MERGE_HEAD.
        assert!(!dir.path().join(".git/MERGE_HEAD").exists());
    }

    #[tokio::test]
    async fn command_git_prepares_and_cleans_worktree() {
        let dir = setup_test_repo();
        let worktrees = tempfile::TempDir::new().unwrap();
        let config = Config {
            worktree_dir: worktrees.path().to_path_buf(),
            ..Config::default()
        };
        let service = CommandGit::new(&config);
        let task = Task::new(Id::from_string("TASK-9"), "t", TaskWeight::Small);

        let wt = service.prepare(dir.path(), &task).await.unwrap();
        assert_eq!(wt.branch, "landing/TASK-9");
        assert_eq!(wt.path, worktrees.path().join("TASK-9"));
        assert!(wt.path.join("README.md").exists());
        assert!(branch_exists(dir.path(), "landing/TASK-9").await.unwrap());

        // Second prepare reuses the existing worktree.
        let again = service.prepare(dir.path(), &task).await.unwrap();
        assert_eq!(again, wt);

        service.cleanup(dir.path(), &task.id).await.unwrap();
        assert!(!wt.path.exists());
        // Cleanup of a missing worktree is fine.
        service.cleanup(dir.path(), &task.id).await.unwrap();
    }

    #[tokio::test]
    async fn prepare_outside_repo_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = CommandGit::new(&Config::default());
        let task = Task::new(Id::new(), "t", TaskWeight::Small);
        assert!(matches!(
            service.prepare(dir.path(), &task).await,
            Err(GitError::NotARepo(_))
        ));
    }
}
