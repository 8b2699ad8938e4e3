//! The running gateway: SMTP in, Signal out

use crate::credentials::CredentialStore;
use crate::dispatch::DispatchGateway;
use crate::message::MessageBuilder;
use crate::smtp::{AuthOutcome, Credentials, SessionAuthenticator, SessionHandler, SmtpReply, SmtpServer};
use crate::tasks::{ShutdownReport, TaskRegistry};
use async_trait::async_trait;
use smtp2signal_common::types::Envelope;
use smtp2signal_common::{Config, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Turns completed SMTP transactions into Signal dispatches
pub struct GatewayHandler {
    authenticator: SessionAuthenticator,
    builder: MessageBuilder,
    dispatcher: DispatchGateway,
}

impl GatewayHandler {
    pub fn new(
        authenticator: SessionAuthenticator,
        builder: MessageBuilder,
        dispatcher: DispatchGateway,
    ) -> Self {
        Self {
            authenticator,
            builder,
            dispatcher,
        }
    }
}

#[async_trait]
impl SessionHandler for GatewayHandler {
    fn authenticate(
        &self,
        peer: SocketAddr,
        mechanism: &str,
        credentials: &Credentials,
    ) -> AuthOutcome {
        self.authenticator.authenticate(peer, mechanism, credentials)
    }

    async fn handle_data(&self, envelope: Envelope) -> SmtpReply {
        match self.builder.build(&envelope.rcpt_to, &envelope.data) {
            Ok(request) => {
                let task = self.dispatcher.dispatch(request);
                debug!("Dispatch task {} scheduled for {}", task.id(), envelope.peer);
                SmtpReply::ok()
            }
            Err(e) => {
                warn!(
                    "Rejecting message from {} ({}): {}",
                    envelope.peer,
                    e.code(),
                    e
                );
                SmtpReply::transient(e.to_string())
            }
        }
    }
}

/// Owns the SMTP listener, the dispatcher and their shutdown
pub struct GatewayServer {
    config: Config,
    local_addr: SocketAddr,
    server: Option<SmtpServer>,
    handler: Arc<GatewayHandler>,
    dispatcher: DispatchGateway,
    tasks: TaskRegistry,
    stop: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl GatewayServer {
    /// Bind the SMTP listener and prepare the dispatcher
    pub async fn bind(config: Config, store: CredentialStore) -> Result<Self> {
        let tasks = TaskRegistry::new();
        let dispatcher = DispatchGateway::new(&config.signal, tasks.clone())?;
        let handler = Arc::new(GatewayHandler::new(
            SessionAuthenticator::new(store),
            MessageBuilder::new(),
            dispatcher.clone(),
        ));

        let server = SmtpServer::bind(config.smtp.clone()).await?;
        let local_addr = server.local_addr()?;

        Ok(Self {
            config,
            local_addr,
            server: Some(server),
            handler,
            dispatcher,
            tasks,
            stop: CancellationToken::new(),
            listener: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of dispatches still in flight
    pub fn pending_dispatches(&self) -> usize {
        self.tasks.len()
    }

    /// Start accepting connections in the background
    pub fn start(&mut self) {
        let Some(server) = self.server.take() else {
            warn!("SMTP listener on {} already started", self.local_addr);
            return;
        };

        info!(
            "Forwarding mail received on {} to {}",
            self.local_addr,
            self.dispatcher.send_url()
        );

        let handler: Arc<dyn SessionHandler> = self.handler.clone();
        self.listener = Some(tokio::spawn(server.run(handler, self.stop.clone())));
    }

    /// Stop accepting mail, then drain outstanding dispatches
    ///
    /// Dispatches get the configured shutdown timeout to finish; whatever is
    /// still running after that is cancelled.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("Stopping SMTP listener on {}", self.local_addr);
        self.stop.cancel();
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                error!("SMTP listener task failed: {}", e);
            }
        }

        self.dispatcher.close();
        self.tasks.shutdown(self.config.shutdown.timeout()).await
    }
}
