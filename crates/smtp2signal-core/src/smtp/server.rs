//! SMTP server implementation

use super::{SessionHandler, SmtpSession};
use smtp2signal_common::config::SmtpConfig;
use smtp2signal_common::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// SMTP listener
pub struct SmtpServer {
    config: SmtpConfig,
    listener: TcpListener,
    connection_semaphore: Arc<Semaphore>,
}

impl SmtpServer {
    /// Bind the listener on the configured host and port
    pub async fn bind(config: SmtpConfig) -> Result<Self> {
        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr).await?;
        info!("Going to listen on {}", addr);

        Ok(Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
        })
    }

    /// Address the listener is actually bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run(self, handler: Arc<dyn SessionHandler>, shutdown: CancellationToken) {
        let local_addr = self.local_addr().ok();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Acquire semaphore permit
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max connections reached, rejecting {}", peer_addr);
                            continue;
                        }
                    };

                    let session = SmtpSession::new(self.config.clone(), handler.clone(), peer_addr);

                    tokio::spawn(async move {
                        if let Err(e) = session.handle(stream).await {
                            error!("SMTP session error from {}: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        if let Some(addr) = local_addr {
            info!("SMTP listener on {} stopped accepting connections", addr);
        }
    }
}
