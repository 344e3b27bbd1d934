//! TCP listener front end.
//!
//! Accepts station sockets, assigns monotonically increasing socket ids,
//! and spawns one [`run_connection`] task per socket. A background task
//! runs the heartbeat sweep on the configured interval. `run` returns
//! after a shutdown signal, once every connection has been drained.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::dispatcher::run_connection;
use crate::engine::Engine;
use crate::error::EngineError;

pub struct StationServer {
    engine: Arc<Engine>,
    next_socket_id: AtomicU64,
}

impl StationServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            next_socket_id: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Bind and serve until interrupted.
    pub async fn run(&self) -> Result<(), EngineError> {
        let listener = TcpListener::bind(self.engine.config().bind_addr).await?;
        info!(addr = %listener.local_addr()?, "station server listening");

        let sweeper = {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(engine.config().sweep_interval);
                interval.tick().await; // immediate first tick
                loop {
                    interval.tick().await;
                    engine.sweep().await;
                }
            })
        };

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
                        let engine = self.engine.clone();
                        tokio::spawn(async move {
                            run_connection(engine, stream, socket_id, remote_addr).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        sweeper.abort();
        self.engine.shutdown().await;
        Ok(())
    }
}
