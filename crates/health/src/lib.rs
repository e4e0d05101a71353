//! Katafygio health endpoint: answers `GET /health` with `ok`.

#![forbid(unsafe_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 3\r\nConnection: close\r\n\r\nok\n";

/// Handle on the healthcheck listener. Port 0 disables the endpoint and turns
/// this into a no-op.
pub struct Health {
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Health {
    /// Bind and serve in the background. A busy port is logged, not fatal:
    /// the mirroring pipeline is worth running without its healthcheck.
    pub async fn spawn(port: u16) -> Health {
        if port == 0 {
            return Health { stop_tx: None, task: None };
        }

        info!(port, "starting http healthcheck handler");
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(port, error = %e, "healthcheck server failed to bind");
                return Health { stop_tx: None, task: None };
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, stop_rx));
        Health { stop_tx: Some(stop_tx), task: Some(task) }
    }

    pub async fn stop(self) {
        let Some(stop_tx) = self.stop_tx else { return };
        info!("stopping http healthcheck handler");
        let _ = stop_tx.send(true);
        if let Some(task) = self.task {
            let _ = task.await;
        }
    }
}

async fn serve(listener: TcpListener, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow_and_update() {
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "healthcheck request");
                    tokio::spawn(reply(stream));
                }
                Err(e) => warn!(error = %e, "healthcheck accept failed"),
            },
        }
    }
}

async fn reply(mut stream: tokio::net::TcpStream) {
    // drain whatever request line came in; the answer is always the same
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await;
    if let Err(e) = stream.write_all(RESPONSE).await {
        warn!(error = %e, "failed to reply to http healthcheck");
    }
    let _ = stream.shutdown().await;
}
