//! Delivery through the signal-cli REST API
//!
//! Sends are fire-and-forget: [`DispatchGateway::dispatch`] schedules the HTTP
//! call on the task registry and returns at once. The outcome is only ever
//! logged; it never reaches the SMTP transaction that produced the message.

use crate::tasks::{DispatchTask, TaskRegistry};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde::Serialize;
use smtp2signal_common::config::SignalConfig;
use smtp2signal_common::types::SignalRequest;
use smtp2signal_common::{Error, Result};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure of a single send
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("signal api failed: {status} - {reason} - {details}")]
    Status {
        status: u16,
        reason: String,
        details: String,
    },

    #[error("signal api request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signal api client is closed")]
    ClientClosed,
}

/// JSON body of `POST /v2/send`
#[derive(Debug, Serialize)]
pub struct SendMessagePayload<'a> {
    pub message: &'a str,
    pub number: &'a str,
    pub recipients: &'a [String],
    pub base64_attachments: Vec<String>,
}

impl<'a> From<&'a SignalRequest> for SendMessagePayload<'a> {
    fn from(request: &'a SignalRequest) -> Self {
        Self {
            message: &request.text,
            number: &request.from_number,
            recipients: &request.to,
            base64_attachments: request
                .binary_attachment
                .iter()
                .map(|attachment| BASE64.encode(attachment))
                .collect(),
        }
    }
}

/// Sends [`SignalRequest`]s with one shared HTTP client
#[derive(Clone)]
pub struct DispatchGateway {
    client: Client,
    send_url: Arc<str>,
    closed: CancellationToken,
    tasks: TaskRegistry,
}

impl DispatchGateway {
    /// Create a gateway whose dispatches are tracked in `tasks`
    pub fn new(config: &SignalConfig, tasks: TaskRegistry) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            send_url: Arc::from(config.send_url()),
            closed: CancellationToken::new(),
            tasks,
        })
    }

    pub fn send_url(&self) -> &str {
        &self.send_url
    }

    /// Schedule `request` and return without waiting for the network
    pub fn dispatch(&self, request: SignalRequest) -> DispatchTask {
        let gateway = self.clone();
        self.tasks.spawn(async move {
            match gateway.send(&request).await {
                Ok(()) => info!(
                    "Signal sent from {} to {:?}",
                    request.from_number, request.to
                ),
                Err(e) => warn!("Signal api failed: {}", e),
            }
        })
    }

    /// Send `request` and wait for the API's answer
    pub async fn send(&self, request: &SignalRequest) -> std::result::Result<(), DispatchError> {
        if self.closed.is_cancelled() {
            return Err(DispatchError::ClientClosed);
        }

        let payload = SendMessagePayload::from(request);
        debug!(
            "Posting message to {} for {} recipient(s), {} attachment(s)",
            self.send_url,
            payload.recipients.len(),
            payload.base64_attachments.len()
        );

        let response = self
            .client
            .post(&*self.send_url)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = match response.text().await {
                Ok(details) => details,
                Err(e) => {
                    warn!("failed to retrieve api error details: {}", e);
                    "n/a".to_string()
                }
            };

            return Err(DispatchError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                details,
            });
        }

        Ok(())
    }

    /// Refuse further sends; requests already in flight may still finish
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ShutdownReport;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(attachment: Option<Vec<u8>>) -> SignalRequest {
        SignalRequest {
            from_number: "+15559876543".to_string(),
            to: vec!["+15551234567".to_string(), "+15550000000".to_string()],
            text: "Hello\nWorld".to_string(),
            binary_attachment: attachment,
        }
    }

    fn gateway(server: &MockServer, tasks: TaskRegistry) -> DispatchGateway {
        let config = SignalConfig {
            base_url: format!("{}/", server.uri()),
            ..SignalConfig::default()
        };
        DispatchGateway::new(&config, tasks).unwrap()
    }

    async fn wait_until_idle(tasks: &TaskRegistry) {
        for _ in 0..200 {
            if tasks.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatch tasks did not finish");
    }

    async fn wait_for_request(server: &MockServer) {
        for _ in 0..200 {
            if !server.received_requests().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("signal api received no request");
    }

    #[test]
    fn test_payload_shape() {
        let with_attachment = request(Some(vec![0, 1, 2, 3]));
        let payload = serde_json::to_value(SendMessagePayload::from(&with_attachment)).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "message": "Hello\nWorld",
                "number": "+15559876543",
                "recipients": ["+15551234567", "+15550000000"],
                "base64_attachments": ["AAECAw=="],
            })
        );

        let without_attachment = request(None);
        let payload = serde_json::to_value(SendMessagePayload::from(&without_attachment)).unwrap();
        assert_eq!(payload["base64_attachments"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_send_posts_to_v2_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/send"))
            .and(body_json(serde_json::json!({
                "message": "Hello\nWorld",
                "number": "+15559876543",
                "recipients": ["+15551234567", "+15550000000"],
                "base64_attachments": [],
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = gateway(&server, TaskRegistry::new());
        assert_eq!(gateway.send_url(), format!("{}/v2/send", server.uri()));
        gateway.send(&request(None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reports_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/send"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid number"))
            .mount(&server)
            .await;

        let err = gateway(&server, TaskRegistry::new())
            .send(&request(None))
            .await
            .unwrap_err();

        match &err {
            DispatchError::Status {
                status,
                reason,
                details,
            } => {
                assert_eq!(*status, 400);
                assert_eq!(reason, "Bad Request");
                assert_eq!(details, "invalid number");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(
            err.to_string(),
            "signal api failed: 400 - Bad Request - invalid number"
        );
    }

    #[tokio::test]
    async fn test_closed_gateway_refuses_to_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let gateway = gateway(&server, TaskRegistry::new());
        gateway.close();
        assert!(gateway.is_closed());

        let err = gateway.send(&request(None)).await.unwrap_err();
        assert!(matches!(err, DispatchError::ClientClosed));
    }

    #[tokio::test]
    async fn test_dispatch_is_fire_and_forget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/send"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let tasks = TaskRegistry::new();
        let gateway = gateway(&server, tasks.clone());

        let started = std::time::Instant::now();
        let task = gateway.dispatch(request(Some(b"attachment".to_vec())));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!task.is_finished());
        assert_eq!(tasks.len(), 1);

        wait_until_idle(&tasks).await;
        assert!(task.is_finished());

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(
            body["base64_attachments"],
            serde_json::json!([BASE64.encode(b"attachment")])
        );
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_only_logged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let tasks = TaskRegistry::new();
        gateway(&server, tasks.clone()).dispatch(request(None));
        wait_until_idle(&tasks).await;
    }

    #[tokio::test]
    async fn test_dispatch_after_close_completes_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let tasks = TaskRegistry::new();
        let gateway = gateway(&server, tasks.clone());
        gateway.close();
        gateway.dispatch(request(None));

        let report = tasks.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.cancelled, 0);
    }

    #[tokio::test]
    async fn test_pending_dispatch_cancelled_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let tasks = TaskRegistry::new();
        let gateway = gateway(&server, tasks.clone());
        let task = gateway.dispatch(request(None));

        // The request must be in flight before the client closes
        wait_for_request(&server).await;
        gateway.close();
        let report = tasks.shutdown(Duration::from_millis(200)).await;

        assert_eq!(
            report,
            ShutdownReport {
                completed: 0,
                cancelled: 1
            }
        );
        assert!(task.is_finished());
        assert!(tasks.is_empty());
    }
}
