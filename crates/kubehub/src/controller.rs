//! Per-kind watch controller: one list+watch stream, a coalescing queue, and
//! normalized notifications towards the recorder.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use katafygio_core::{object_key, Notification, NotifySender};

use crate::queue::KeyQueue;
use crate::ResourceEntry;

/// Watch stream restart backoff cap, seconds.
const BACKOFF_MAX_SECS: u64 = 30;
/// Pending-queue drain cadence; also the coalescing window.
const DRAIN_INTERVAL: Duration = Duration::from_millis(200);
/// Stand-in relist period when resync is disabled (the timer must still exist
/// for the select loop, it just never realistically fires).
const RELIST_DISABLED_SECS: u64 = 86_400 * 365;

/// Metadata attributes that churn on every write and ruin diffs.
const UNEXPORTED: &[&str] = &["selfLink", "uid", "resourceVersion", "generation", "managedFields"];

/// Knobs shared by every controller.
#[derive(Debug, Clone, Default)]
pub struct WatchParams {
    /// Restrict watches to a single namespace.
    pub namespace: Option<String>,
    /// Kubernetes label selector.
    pub label_selector: Option<String>,
    /// Periodic full relist; `None` disables it.
    pub resync: Option<Duration>,
    /// `<kind>:<key>` entries to skip, matched case-insensitively.
    pub exclude_object: Vec<String>,
}

/// Handle on a running per-kind controller task.
pub struct Controller {
    name: String,
    stop_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Controller {
    /// Start watching a kind in the background.
    pub fn spawn(
        client: Client,
        entry: ResourceEntry,
        params: Arc<WatchParams>,
        notify: NotifySender,
    ) -> Self {
        let name = entry.ar.kind.to_lowercase();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (synced_tx, synced_rx) = watch::channel(false);
        let task = tokio::spawn(run(client, entry, params, notify, stop_rx, synced_tx, name.clone()));
        Self { name, stop_tx, synced_rx, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal flipped to true once the initial list has been fully forwarded.
    pub fn synced_signal(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// Stop the controller. Waits for the initial sync first: tearing the
    /// watch down earlier would swallow the upserts of every pre-existing
    /// object and leave the recorder's active set incomplete.
    pub async fn stop(self) {
        let mut synced = self.synced_rx.clone();
        while !*synced.borrow() {
            if synced.changed().await.is_err() {
                break; // task already gone
            }
        }
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
        info!(kind = %self.name, "controller stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    client: Client,
    entry: ResourceEntry,
    params: Arc<WatchParams>,
    notify: NotifySender,
    mut stop_rx: watch::Receiver<bool>,
    synced_tx: watch::Sender<bool>,
    name: String,
) {
    let api: Api<DynamicObject> = match (&entry.namespaced, &params.namespace) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &entry.ar),
        _ => Api::all_with(client.clone(), &entry.ar),
    };

    let mut cache: FxHashMap<String, DynamicObject> = FxHashMap::default();
    let mut queue = KeyQueue::new();
    let mut listed = false;
    let mut backoff: u64 = 1;

    info!(kind = %name, ns = ?params.namespace, "controller starting");

    loop {
        let mut cfg = watcher::Config::default();
        if let Some(labels) = &params.label_selector {
            cfg = cfg.labels(labels);
        }
        let stream = watcher::watcher(api.clone(), cfg);
        futures::pin_mut!(stream);

        let relist = tokio::time::sleep(jittered(
            params.resync.unwrap_or(Duration::from_secs(RELIST_DISABLED_SECS)),
        ));
        tokio::pin!(relist);

        let mut drain = tokio::time::interval(DRAIN_INTERVAL);
        drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Read the stream until it ends, errors, or the relist timer fires.
        let ended = loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow_and_update() {
                        info!(kind = %name, "controller stopping");
                        return;
                    }
                }
                maybe = stream.try_next() => match maybe {
                    Ok(Some(Event::Applied(obj))) => {
                        let key = cache_key(&obj);
                        cache.insert(key.clone(), obj);
                        queue.add(key);
                        counter!("watch_events_total", 1u64);
                    }
                    Ok(Some(Event::Deleted(obj))) => {
                        let key = cache_key(&obj);
                        cache.remove(&key);
                        queue.add(key);
                        counter!("watch_events_total", 1u64);
                    }
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(kind = %name, count = list.len(), "full list received");
                        let mut fresh: FxHashMap<String, DynamicObject> = FxHashMap::default();
                        for obj in list {
                            fresh.insert(cache_key(&obj), obj);
                        }
                        // objects that vanished while we were not watching
                        for key in cache.keys().filter(|k| !fresh.contains_key(*k)) {
                            queue.add(key.clone());
                        }
                        for key in fresh.keys() {
                            queue.add(key.clone());
                        }
                        cache = fresh;
                        listed = true;
                        backoff = 1;
                    }
                    Ok(None) => break true,
                    Err(e) => {
                        warn!(kind = %name, error = %e, "watch stream error; will backoff and restart");
                        counter!("watch_errors_total", 1u64);
                        break true;
                    }
                },
                _ = drain.tick() => {
                    if !drain_pending(&mut queue, &cache, &params, &notify, &name).await {
                        info!(kind = %name, "notifier closed; stopping watcher");
                        return;
                    }
                    if listed && queue.is_empty() && !*synced_tx.borrow() {
                        let _ = synced_tx.send(true);
                        info!(kind = %name, "initial sync completed");
                    }
                }
                _ = &mut relist => {
                    debug!(kind = %name, "periodic relist; restarting watch");
                    counter!("relist_total", 1u64);
                    break false;
                }
            }
        };

        if ended {
            tokio::time::sleep(Duration::from_secs(backoff.min(BACKOFF_MAX_SECS))).await;
            backoff = (backoff * 2).min(BACKOFF_MAX_SECS).max(1);
        }
        counter!("watch_restarts_total", 1u64);
    }
}

/// Process every due key. Returns false when the notifier is closed.
async fn drain_pending(
    queue: &mut KeyQueue,
    cache: &FxHashMap<String, DynamicObject>,
    params: &WatchParams,
    notify: &NotifySender,
    name: &str,
) -> bool {
    while let Some(key) = queue.pop_ready() {
        match process_key(cache, params, name, &key) {
            Ok(Some(notif)) => {
                if notify.send(notif).await.is_err() {
                    return false;
                }
                queue.forget(&key);
                counter!("notifications_sent_total", 1u64);
            }
            Ok(None) => queue.forget(&key),
            Err(e) => {
                if queue.retry(&key) {
                    warn!(kind = %name, key = %key, error = %e, "error processing object (will retry)");
                } else {
                    error!(kind = %name, key = %key, error = %e, "error processing object (giving up)");
                }
            }
        }
    }
    true
}

/// Turn one queued key into a notification, or nothing when filtered out.
fn process_key(
    cache: &FxHashMap<String, DynamicObject>,
    params: &WatchParams,
    name: &str,
    key: &str,
) -> Result<Option<Notification>> {
    let tag = format!("{}:{}", name, key);
    if params.exclude_object.iter().any(|x| x.eq_ignore_ascii_case(&tag)) {
        return Ok(None);
    }

    match cache.get(key) {
        None => Ok(Some(Notification::delete(name, key))),
        Some(obj) => {
            let bytes = strip_and_serialize(obj)?;
            Ok(Some(Notification::upsert(name, key, bytes)))
        }
    }
}

/// Serialize an object to YAML, without the attributes that churn on every
/// write (whole `status`, bookkeeping `metadata` fields).
fn strip_and_serialize(obj: &DynamicObject) -> Result<Vec<u8>> {
    let mut val = serde_yaml::to_value(obj).context("serializing object")?;
    if let Some(root) = val.as_mapping_mut() {
        root.remove("status");
        if let Some(meta) = root.get_mut("metadata").and_then(serde_yaml::Value::as_mapping_mut) {
            for attr in UNEXPORTED {
                meta.remove(*attr);
            }
        }
    }
    let text = serde_yaml::to_string(&val).context("marshaling to yaml")?;
    Ok(text.into_bytes())
}

fn cache_key(obj: &DynamicObject) -> String {
    object_key(obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref().unwrap_or_default())
}

/// ±10% jitter so dozens of controllers don't relist in lockstep.
fn jittered(d: Duration) -> Duration {
    let jitter = d.as_secs() / 10;
    if jitter == 0 {
        return d;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_secs(d.as_secs() - jitter + nanos % (2 * jitter + 1))
}
