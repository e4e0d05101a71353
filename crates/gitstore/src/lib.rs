//! Katafygio git store: keeps the dump directory committed, and optionally
//! pulled from / pushed to a remote.
//!
//! Everything shells out to the `git` binary; pure implementations still
//! mishandle enough edge cases (shallow clones, merge strategies) to not be
//! worth the trade.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pattern excluded from git status so in-flight recorder temp files are
/// never committed.
const TEMP_EXCLUDE_PATTERN: &str = ".temp-katafygio-*";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} timed out after {timeout:?}")]
    Timeout { args: String, timeout: Duration },
    #[error("git {args} failed: {output}")]
    Failed { args: String, output: String },
    #[error("running git: {0}")]
    Io(#[from] std::io::Error),
}

/// Git store configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Remote URL; empty/None keeps the repository local-only.
    pub url: Option<String>,
    pub local_dir: PathBuf,
    pub author: String,
    pub email: String,
    pub message: String,
    /// Per-command timeout.
    pub timeout: Duration,
    /// Commit-and-push cadence.
    pub check_interval: Duration,
    pub dry_run: bool,
}

/// A git repository scoped to the dump directory.
pub struct Store {
    opts: Options,
    root: PathBuf,
}

impl Store {
    pub fn new(opts: Options) -> Result<Self, GitError> {
        let root = std::path::absolute(&opts.local_dir)?;
        Ok(Self { opts, root })
    }

    /// Prepare the repository: clone (shallow) when a URL is configured and
    /// nothing is checked out yet, plain init otherwise. Always (re)applies
    /// the committer identity and the temp-file exclusion.
    pub async fn clone_or_init(&self) -> Result<(), GitError> {
        if self.opts.dry_run {
            info!(dir = %self.root.display(), "dry-run: not initializing git repository");
            return Ok(());
        }

        std::fs::create_dir_all(&self.root)?;

        if self.root.join(".git").join("index").exists() {
            info!(dir = %self.root.display(), "using pre-existing git repository");
        } else {
            match &self.opts.url {
                Some(url) if !url.is_empty() => {
                    info!(url = %url, dir = %self.root.display(), "cloning repository");
                    let root = self.root.to_string_lossy().into_owned();
                    self.git_setup(&["clone", "--depth=1", url, &root]).await?;
                }
                _ => {
                    info!(dir = %self.root.display(), "initializing local repository");
                    self.git_setup(&["init"]).await?;
                }
            }
        }

        self.git_setup(&["config", "user.name", &self.opts.author]).await?;
        self.git_setup(&["config", "user.email", &self.opts.email]).await?;

        let info_dir = self.root.join(".git").join("info");
        std::fs::create_dir_all(&info_dir)?;
        std::fs::write(info_dir.join("exclude"), format!("{}\n", TEMP_EXCLUDE_PATTERN))?;

        Ok(())
    }

    /// Start the periodic commit loop in the background.
    pub fn spawn(self) -> GitSync {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(self, stop_rx));
        GitSync { stop_tx, task }
    }

    async fn commit_and_push(&self) {
        if self.opts.dry_run {
            debug!("dry-run: skipping git commit");
            return;
        }

        match self.status_dirty().await {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                warn!(error = %e, "git status failed");
                return;
            }
        }

        if let Err(e) = self.commit().await {
            warn!(error = %e, "git commit failed");
            return;
        }
        counter!("git_commits_total", 1u64);

        let Some(url) = self.opts.url.as_deref().filter(|u| !u.is_empty()) else {
            return;
        };
        debug!(url = %url, "syncing with remote");
        // favor local content on conflicts: the cluster is the source of truth
        if let Err(e) = self.git(&["pull", "-s", "recursive", "-X", "ours", "--no-edit"]).await {
            warn!(error = %e, "git pull failed");
            return;
        }
        if let Err(e) = self.git(&["push"]).await {
            warn!(error = %e, "git push failed");
            counter!("git_push_errors_total", 1u64);
        }
    }

    async fn commit(&self) -> Result<(), GitError> {
        info!("committing local changes");
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", &self.opts.message]).await?;
        Ok(())
    }

    async fn status_dirty(&self) -> Result<bool, GitError> {
        let out = self.git(&["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    /// Run a git command against the repository, GIT_DIR pinned so the call
    /// works whatever the process cwd is.
    async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        self.run(args, true).await
    }

    /// Setup commands (clone, init, config) must not inherit GIT_DIR: clone
    /// creates the directory itself.
    async fn git_setup(&self, args: &[&str]) -> Result<String, GitError> {
        self.run(args, false).await
    }

    async fn run(&self, args: &[&str], with_git_dir: bool) -> Result<String, GitError> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if with_git_dir {
            cmd.env("GIT_DIR", self.root.join(".git"));
            cmd.env("GIT_WORK_TREE", &self.root);
        }

        let joined = args.join(" ");
        debug!(args = %joined, "running git");

        let output = match tokio::time::timeout(self.opts.timeout, cmd.output()).await {
            Err(_) => {
                return Err(GitError::Timeout { args: joined, timeout: self.opts.timeout });
            }
            Ok(res) => res?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(GitError::Failed { args: joined, output: combined.trim().to_string() });
        }
        Ok(combined)
    }
}

/// Handle on the periodic commit loop.
pub struct GitSync {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl GitSync {
    pub async fn stop(self) {
        info!("stopping git synchronizer");
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

async fn run(store: Store, mut stop_rx: watch::Receiver<bool>) {
    info!(dir = %store.root.display(), "starting git synchronizer");
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow_and_update() {
                    // last snapshot, so a short dump-only run still lands in
                    // the repository before the process exits
                    store.commit_and_push().await;
                    return;
                }
            }
            _ = tokio::time::sleep(store.opts.check_interval) => {
                store.commit_and_push().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("katafygio-git-{}-{}", tag, nanos))
    }

    fn options(dir: &PathBuf) -> Options {
        Options {
            url: None,
            local_dir: dir.clone(),
            author: "Katafygio".into(),
            email: "katafygio@localhost".into(),
            message: "Kubernetes cluster change".into(),
            timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(10),
            dry_run: false,
        }
    }

    async fn have_git() -> bool {
        tokio::process::Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn init_creates_repo_and_exclusions() {
        if !have_git().await {
            return;
        }
        let root = temp_root("init");
        let store = Store::new(options(&root)).unwrap();
        store.clone_or_init().await.unwrap();

        assert!(root.join(".git").exists());
        let exclude = std::fs::read_to_string(root.join(".git/info/exclude")).unwrap();
        assert!(exclude.contains(TEMP_EXCLUDE_PATTERN));

        // idempotent on a pre-existing repository
        store.clone_or_init().await.unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn commit_cycle_leaves_clean_status() {
        if !have_git().await {
            return;
        }
        let root = temp_root("commit");
        let store = Store::new(options(&root)).unwrap();
        store.clone_or_init().await.unwrap();
        // init made no commit yet, index appears once something is added
        std::fs::write(root.join("namespace-kf.yaml"), "kind: Namespace\n").unwrap();

        assert!(store.status_dirty().await.unwrap());
        store.commit_and_push().await;
        assert!(!store.status_dirty().await.unwrap());
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn failures_are_not_timeouts() {
        if !have_git().await {
            return;
        }
        let root = temp_root("fail");
        let store = Store::new(options(&root)).unwrap();
        store.clone_or_init().await.unwrap();

        let err = store.git(&["no-such-subcommand"]).await.unwrap_err();
        assert!(matches!(err, GitError::Failed { .. }), "got: {:?}", err);
        std::fs::remove_dir_all(&root).ok();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_commands_are_classified_as_timeouts() {
        use std::os::unix::fs::PermissionsExt;

        if !have_git().await {
            return;
        }
        let root = temp_root("timeout");
        let store = Store::new(options(&root)).unwrap();
        store.clone_or_init().await.unwrap();

        // a hook that outlives the per-command timeout stalls the commit
        let hooks = root.join(".git").join("hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        let hook = hooks.join("pre-commit");
        std::fs::write(&hook, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(root.join("namespace-kf.yaml"), "kind: Namespace\n").unwrap();

        let mut opts = options(&root);
        opts.timeout = Duration::from_millis(200);
        let quick = Store::new(opts).unwrap();
        quick.git(&["add", "-A"]).await.unwrap();
        let err = quick.git(&["commit", "-m", "stalled"]).await.unwrap_err();
        assert!(matches!(err, GitError::Timeout { .. }), "got: {:?}", err);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn dry_run_does_nothing() {
        let root = temp_root("dry");
        let mut opts = options(&root);
        opts.dry_run = true;
        let store = Store::new(opts).unwrap();
        store.clone_or_init().await.unwrap();
        assert!(!root.exists());
    }
}
