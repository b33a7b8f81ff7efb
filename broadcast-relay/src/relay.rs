use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::{RelayConfig, SessionOptions},
    hub::{Hub, HubHandle},
    session,
};

/// Accepts TCP connections and hands each one to a client session.
pub struct Relay {
    listener: TcpListener,
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    session_options: Arc<SessionOptions>,
}

impl Relay {
    /// Starts the hub. Connections are only accepted once `run_until` runs.
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let (hub, hub_task) = Hub::spawn(config.hub);
        Self {
            listener,
            hub,
            hub_task,
            session_options: Arc::new(config.session),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            hub,
            hub_task,
            session_options,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub, &session_options);
                }
            }
        }

        info!("relay shutting down");
        if let Err(error) = hub.shutdown().await {
            debug!(?error, "hub already stopped");
        }
        if let Err(error) = hub_task.await {
            warn!(?error, "hub task failed");
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &HubHandle,
    options: &Arc<SessionOptions>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, hub, options),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &HubHandle,
    options: &Arc<SessionOptions>,
) {
    debug!(%peer, "connection accepted");
    let hub = hub.clone();
    let options = Arc::clone(options);
    tokio::spawn(async move {
        if let Err(err) = session::run(stream, peer.to_string(), hub, options).await {
            debug!(%peer, error = ?err, "session ended with error");
        }
    });
}
