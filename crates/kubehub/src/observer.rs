//! Discovery loop: polls the api-server for served kinds (CRDs appear at any
//! time) and keeps one controller running per kind.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use kube::Client;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info};

use katafygio_core::NotifySender;

use crate::controller::{Controller, WatchParams};
use crate::{discover, DiscoveryFilter};

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

type ControllerRegistry = Arc<RwLock<FxHashMap<String, Controller>>>;

/// Observer configuration.
#[derive(Debug, Clone)]
pub struct ObserverParams {
    pub discovery_interval: Duration,
    pub filter: DiscoveryFilter,
    pub watch: Arc<WatchParams>,
}

impl Default for ObserverParams {
    fn default() -> Self {
        Self {
            discovery_interval: DISCOVERY_INTERVAL,
            filter: DiscoveryFilter::default(),
            watch: Arc::new(WatchParams::default()),
        }
    }
}

/// Handle on the discovery loop and the controllers it spawned.
pub struct Observer {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    ctrls: ControllerRegistry,
    refreshed_rx: watch::Receiver<bool>,
}

impl Observer {
    /// Start the discovery loop in the background.
    pub fn spawn(client: Client, notify: NotifySender, params: ObserverParams) -> Self {
        info!("starting all kubernetes controllers");
        let ctrls: ControllerRegistry = Arc::new(RwLock::new(FxHashMap::default()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (refreshed_tx, refreshed_rx) = watch::channel(false);
        let task = tokio::spawn(run(client, notify, params, Arc::clone(&ctrls), stop_rx, refreshed_tx));
        Self { stop_tx, task, ctrls, refreshed_rx }
    }

    /// Wait until the first successful discovery pass and then until every
    /// controller it spawned has completed its initial sync. This is what
    /// dump-only mode blocks on before shutting the process down.
    pub async fn wait_initial_sync(&self) {
        let mut refreshed = self.refreshed_rx.clone();
        while !*refreshed.borrow() {
            if refreshed.changed().await.is_err() {
                return;
            }
        }
        let signals: Vec<(String, watch::Receiver<bool>)> = {
            let ctrls = self.ctrls.read().expect("controller registry poisoned");
            ctrls.values().map(|c| (c.name().to_string(), c.synced_signal())).collect()
        };
        for (name, mut synced) in signals {
            while !*synced.borrow() {
                if synced.changed().await.is_err() {
                    break;
                }
            }
            debug!(kind = %name, "initial sync observed");
        }
    }

    /// Stop the discovery loop, then every controller (any order).
    pub async fn stop(self) {
        info!("stopping all kubernetes controllers");
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;

        let ctrls: Vec<Controller> = {
            let mut map = self.ctrls.write().expect("controller registry poisoned");
            map.drain().map(|(_, c)| c).collect()
        };
        for ctrl in ctrls {
            ctrl.stop().await;
        }
    }
}

async fn run(
    client: Client,
    notify: NotifySender,
    params: ObserverParams,
    ctrls: ControllerRegistry,
    mut stop_rx: watch::Receiver<bool>,
    refreshed_tx: watch::Sender<bool>,
) {
    loop {
        match refresh(&client, &notify, &params, &ctrls).await {
            Ok(started) => {
                if started > 0 {
                    info!(started, "discovery refresh spawned new controllers");
                }
                let _ = refreshed_tx.send(true);
            }
            // partial or failed discovery is not fatal: retry on next tick
            Err(e) => error!(error = %e, "discovery refresh failed"),
        }

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow_and_update() {
                    return;
                }
            }
            _ = tokio::time::sleep(params.discovery_interval) => {}
        }
    }
}

async fn refresh(
    client: &Client,
    notify: &NotifySender,
    params: &ObserverParams,
    ctrls: &ControllerRegistry,
) -> Result<usize> {
    let found = discover(client, &params.filter).await?;

    let mut registry = ctrls.write().expect("controller registry poisoned");
    let mut started = 0;
    for (key, entry) in found {
        if registry.contains_key(&key) {
            continue;
        }
        debug!(key = %key, "spawning controller");
        let ctrl = Controller::spawn(client.clone(), entry, Arc::clone(&params.watch), notify.clone());
        registry.insert(key, ctrl);
        started += 1;
    }
    Ok(started)
}
