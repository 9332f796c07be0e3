//! Node context: owns the socket selected by the configuration and keeps
//! it running until shutdown.

use std::future::Future;
use std::time::Duration;

use javelin_protocol::JsonEvent;
use javelin_socket::{
    ClientSocket, NoopSocket, ServerSocket, Socket, SocketError, SocketExt, Status,
};
use javelin_users::UserStore;
use tracing::{debug, info, warn};

use crate::config::{Mode, NodeConfig};

pub struct Node {
    socket: Box<dyn Socket>,
    /// Set for clients that reconnect after losing the server.
    restart_interval: Option<Duration>,
}

impl Node {
    pub fn from_config(config: &NodeConfig) -> anyhow::Result<Self> {
        let (socket, restart_interval): (Box<dyn Socket>, _) = match config.mode {
            Mode::None => (Box::new(NoopSocket::new()), None),
            Mode::Server => {
                let users = UserStore::open(&config.server.users_file)?;
                (
                    Box::new(ServerSocket::new(config.server_config(), users)),
                    None,
                )
            }
            Mode::Client => {
                let restart = config
                    .client
                    .auto_restart
                    .then(|| config.restart_interval());
                (Box::new(ClientSocket::new(config.client_config()?)), restart)
            }
        };

        socket.subscribe(|event: &JsonEvent| {
            debug!(name = %event.name, "received JSON event");
        });

        Ok(Self {
            socket,
            restart_interval,
        })
    }

    pub fn socket(&self) -> &dyn Socket {
        self.socket.as_ref()
    }

    /// Starts the socket, supervises it until `shutdown` completes, then
    /// closes it.
    ///
    /// A client that fails its first connection keeps retrying when auto
    /// restart is on; otherwise the start error is returned.
    pub async fn run_until<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.socket.start().await {
            if self.restart_interval.is_none() {
                return Err(e.into());
            }
            warn!("initial connection failed, will retry: {e}");
        } else {
            info!(status = %self.socket.status(), "node started");
        }

        tokio::select! {
            () = shutdown => info!("shutting down"),
            () = self.supervise() => {}
        }

        match self.socket.close().await {
            Ok(()) => info!("node stopped"),
            Err(SocketError::IllegalState(reason)) => debug!("nothing to close: {reason}"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Polls the socket status and restarts it when it fell back to
    /// `CLOSED`. Never returns when supervision is off.
    async fn supervise(&self) {
        let Some(period) = self.restart_interval else {
            return std::future::pending::<()>().await;
        };

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            if self.socket.status() != Status::Closed {
                continue;
            }
            info!("connection closed, restarting");
            match self.socket.restart().await {
                Ok(()) => info!("reconnected"),
                Err(e) => warn!("restart failed: {e}"),
            }
        }
    }
}
