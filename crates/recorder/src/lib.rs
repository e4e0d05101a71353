//! Katafygio recorder: listens for controller notifications and persists
//! their content as one YAML file per object, garbage-collecting files whose
//! objects left the cluster.

#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use crc::{Crc, CRC_64_ECMA_182};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use katafygio_core::{key_namespace, Action, Notification, NotifyReceiver};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Prefix for in-flight temp files; matched by the git exclude pattern so a
/// repository status never sees a half-written object.
pub const TEMP_PREFIX: &str = ".temp-katafygio-";

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub local_dir: PathBuf,
    pub dry_run: bool,
    /// Stale-file sweep period (normally 2 × the resync interval).
    pub gc_interval: Duration,
}

/// Handle on the running recorder task.
pub struct Recorder {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Recorder {
    /// Create the output directory and start consuming notifications.
    pub fn spawn(opts: Options, rx: NotifyReceiver) -> Result<Self> {
        info!(dir = %opts.local_dir.display(), "starting event recorder");
        let root = std::path::absolute(&opts.local_dir)
            .with_context(|| format!("resolving {}", opts.local_dir.display()))?;
        if !opts.dry_run {
            fs::create_dir_all(&root)
                .with_context(|| format!("creating directory {}", root.display()))?;
        }

        let writer = DiskWriter { root, dry_run: opts.dry_run, actives: FxHashMap::default() };
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(writer, rx, stop_rx, opts.gc_interval));
        Ok(Self { stop_tx, task })
    }

    pub async fn stop(self) {
        info!("stopping event recorder");
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

async fn run(
    mut writer: DiskWriter,
    mut rx: NotifyReceiver,
    mut stop_rx: watch::Receiver<bool>,
    gc_interval: Duration,
) {
    let start = tokio::time::Instant::now() + gc_interval;
    let mut gc_tick = tokio::time::interval_at(start, gc_interval);
    gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut open = true;

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow_and_update() {
                    return;
                }
            }
            maybe = rx.recv(), if open => match maybe {
                Some(ev) => writer.process(&ev),
                None => open = false, // producers gone; keep sweeping until stopped
            },
            _ = gc_tick.tick() => writer.delete_obsolete_files(),
        }
    }
}

/// Disk side of the recorder. Owned by the recorder task: file writes and the
/// GC walk never run concurrently, so the GC always sees a settled active set.
struct DiskWriter {
    root: PathBuf,
    dry_run: bool,
    /// Relative path → content checksum for every file written this run.
    /// GC only ever deletes paths absent from this map.
    actives: FxHashMap<String, u64>,
}

impl DiskWriter {
    fn process(&mut self, ev: &Notification) {
        let path = self.file_path(ev);
        let res = match ev.action {
            Action::Upsert => self.save(&path, &ev.bytes),
            Action::Delete => self.remove(&path),
        };
        if let Err(e) = res {
            error!(key = %ev.key, error = %e, "failed to save or delete object");
        }
    }

    /// `<root>/<namespace>/<kind>-<name>.yaml`, or directly under the root
    /// for cluster-scoped objects.
    fn file_path(&self, ev: &Notification) -> PathBuf {
        let name = katafygio_core::key_basename(&ev.key);
        let mut dir = self.root.clone();
        if let Some(ns) = key_namespace(&ev.key) {
            dir.push(ns);
        }
        dir.join(format!("{}-{}.yaml", ev.kind, name))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn save(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        debug!(file = %path.display(), "saving object");
        if self.dry_run {
            return Ok(());
        }

        let rel = self.relative(path);
        let csum = CRC64.checksum(data);
        if self.actives.get(&rel) == Some(&csum) {
            return Ok(());
        }

        let dir = path.parent().context("object path has no parent")?;
        fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;

        // temp file in the target directory, so the rename stays on one
        // filesystem and lands atomically
        let file_name = path.file_name().context("object path has no file name")?;
        let tmp = dir.join(format!("{}{}", TEMP_PREFIX, file_name.to_string_lossy()));
        fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

        self.actives.insert(rel, csum);
        counter!("recorder_writes_total", 1u64);
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        debug!(file = %path.display(), "removing file");
        if self.dry_run {
            return Ok(());
        }

        self.actives.remove(&self.relative(path));
        match fs::remove_file(path) {
            Ok(()) => {
                counter!("recorder_deletes_total", 1u64);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Remove yaml files whose object was not seen this run — leftovers from
    /// a previous run, or objects filtered out since.
    fn delete_obsolete_files(&mut self) {
        debug!(dir = %self.root.display(), "garbage collecting stale files");
        let mut stale = Vec::new();
        if let Err(e) = self.walk(&self.root, &mut stale) {
            warn!(error = %e, "failed to gc some files");
        }
        for path in stale {
            debug!(file = %path.display(), "removing stale file");
            if self.dry_run {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => counter!("recorder_gc_removed_total", 1u64),
                Err(e) => warn!(file = %path.display(), error = %e, "failed to gc file"),
            }
        }
    }

    fn walk(&self, dir: &Path, stale: &mut Vec<PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                // leave the repository metadata alone
                if path.file_name().is_some_and(|n| n == ".git") {
                    continue;
                }
                self.walk(&path, stale)?;
                continue;
            }
            if path.extension().is_some_and(|e| e == "yaml")
                && !self.actives.contains_key(&self.relative(&path))
            {
                stale.push(path);
            }
        }
        Ok(())
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
        std::env::temp_dir().join(format!("katafygio-test-{}-{}", tag, nanos))
    }

    fn writer(root: &Path, dry_run: bool) -> DiskWriter {
        fs::create_dir_all(root).unwrap();
        DiskWriter { root: root.to_path_buf(), dry_run, actives: FxHashMap::default() }
    }

    #[test]
    fn path_layout() {
        let root = temp_root("layout");
        let w = writer(&root, false);
        let clustered = w.file_path(&Notification::upsert("namespace", "kf-e2e-1", b"x".to_vec()));
        assert_eq!(clustered, root.join("namespace-kf-e2e-1.yaml"));
        let namespaced = w.file_path(&Notification::upsert("deployment", "default/kf-e2e-2", b"x".to_vec()));
        assert_eq!(namespaced, root.join("default").join("deployment-kf-e2e-2.yaml"));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn save_roundtrips_bytes() {
        let root = temp_root("roundtrip");
        let mut w = writer(&root, false);
        let ev = Notification::upsert("configmap", "default/kf", b"kind: ConfigMap\n".to_vec());
        let path = w.file_path(&ev);
        w.save(&path, &ev.bytes).unwrap();
        assert_eq!(fs::read(&path).unwrap(), ev.bytes);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn identical_save_touches_nothing() {
        let root = temp_root("dedup");
        let mut w = writer(&root, false);
        let ev = Notification::upsert("configmap", "default/kf", b"kind: ConfigMap\n".to_vec());
        let path = w.file_path(&ev);
        w.save(&path, &ev.bytes).unwrap();
        let before = fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        w.save(&path, &ev.bytes).unwrap();
        let after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn upsert_then_delete_removes_file() {
        let root = temp_root("updel");
        let mut w = writer(&root, false);
        let ev = Notification::upsert("service", "default/kf", b"kind: Service\n".to_vec());
        let path = w.file_path(&ev);
        w.save(&path, &ev.bytes).unwrap();
        assert!(path.exists());
        w.remove(&path).unwrap();
        assert!(!path.exists());
        assert!(w.actives.is_empty());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn delete_of_missing_file_is_ok() {
        let root = temp_root("delmissing");
        let mut w = writer(&root, false);
        let path = root.join("namespace-gone.yaml");
        assert!(w.remove(&path).is_ok());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn gc_removes_only_stale_yaml() {
        let root = temp_root("gc");
        let mut w = writer(&root, false);

        let ev = Notification::upsert("configmap", "default/live", b"live\n".to_vec());
        let live = w.file_path(&ev);
        w.save(&live, &ev.bytes).unwrap();

        let stale = root.join("default").join("configmap-stale.yaml");
        fs::write(&stale, b"stale\n").unwrap();
        let unrelated = root.join("README.md");
        fs::write(&unrelated, b"not yaml\n").unwrap();

        w.delete_obsolete_files();
        assert!(live.exists());
        assert!(!stale.exists());
        assert!(unrelated.exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn dry_run_writes_and_deletes_nothing() {
        let root = temp_root("dryrun");
        let mut w = writer(&root, true);
        let ev = Notification::upsert("configmap", "default/kf", b"x\n".to_vec());
        let path = w.file_path(&ev);
        w.save(&path, &ev.bytes).unwrap();
        assert!(!path.exists());
        assert!(w.actives.is_empty());

        let stale = root.join("configmap-stale.yaml");
        fs::write(&stale, b"stale\n").unwrap();
        w.delete_obsolete_files();
        assert!(stale.exists());
        fs::remove_dir_all(&root).ok();
    }

}
