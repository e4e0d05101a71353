//! Lifecycle coordination: wires git, recorder, observer and healthcheck,
//! then runs until a signal (or until the initial dump, in dump-only mode).

use std::sync::Arc;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::info;

use katafygio_core::notifier;
use katafygio_gitstore as gitstore;
use katafygio_health::Health;
use katafygio_kubehub::observer::DISCOVERY_INTERVAL;
use katafygio_kubehub::{DiscoveryFilter, Observer, ObserverParams, WatchParams};
use katafygio_recorder::{Options as RecorderOptions, Recorder};

use crate::config::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let client = build_client(&settings).await.context("initializing the Kubernetes client")?;
    let server = client.apiserver_version().await.context("contacting the api-server")?;
    info!(version = %format!("{}.{}", server.major, server.minor), "connected to the api-server");

    // git comes first: a repository that cannot be set up must abort the
    // process before anything gets written
    let store = if settings.no_git {
        None
    } else {
        let store = gitstore::Store::new(gitstore::Options {
            url: settings.git_url.clone(),
            local_dir: settings.local_dir.clone(),
            author: settings.git_author.clone(),
            email: settings.git_email.clone(),
            message: settings.git_message.clone(),
            timeout: settings.git_timeout,
            check_interval: settings.check_interval,
            dry_run: settings.dry_run,
        })
        .context("resolving the dump directory")?;
        store.clone_or_init().await.context("initializing the git repository")?;
        Some(store)
    };

    let (notify_tx, notify_rx) = notifier();

    let recorder = Recorder::spawn(
        RecorderOptions {
            local_dir: settings.local_dir.clone(),
            dry_run: settings.dry_run,
            gc_interval: settings.gc_interval,
        },
        notify_rx,
    )
    .context("starting the recorder")?;

    let observer = Observer::spawn(
        client,
        notify_tx,
        ObserverParams {
            discovery_interval: DISCOVERY_INTERVAL,
            filter: DiscoveryFilter {
                exclude_kind: settings.exclude_kind.clone(),
                namespaced_only: settings.namespace.is_some(),
            },
            watch: Arc::new(WatchParams {
                namespace: settings.namespace.clone(),
                label_selector: settings.filter.clone(),
                resync: settings.resync,
                exclude_object: settings.exclude_object.clone(),
            }),
        },
    );

    let health = Health::spawn(settings.healthcheck_port).await;
    let sync = store.map(gitstore::Store::spawn);

    if settings.dump_only {
        tokio::select! {
            _ = observer.wait_initial_sync() => info!("initial dump completed"),
            _ = shutdown_signal() => info!("signal received during dump"),
        }
    } else {
        shutdown_signal().await;
        info!("signal received, shutting down");
    }

    observer.stop().await;
    recorder.stop().await;
    if let Some(sync) = sync {
        sync.stop().await;
    }
    health.stop().await;
    info!("katafygio stopped");
    Ok(())
}

/// Resolve cluster credentials: explicit kubeconfig path, then context
/// override, then the usual ladder ($KUBECONFIG, ~/.kube/config, in-cluster).
async fn build_client(settings: &Settings) -> Result<Client> {
    let options = KubeConfigOptions {
        context: settings.context.clone(),
        ..KubeConfigOptions::default()
    };

    let mut config = match &settings.kube_config {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None if settings.context.is_some() => kube::Config::from_kubeconfig(&options).await?,
        None => kube::Config::infer().await?,
    };

    if let Some(url) = &settings.api_server {
        config.cluster_url = url.parse().context("parsing the api-server url")?;
    }

    Ok(Client::try_from(config)?)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
