//! HTTP bridge transport (fallback, spec §4.4): the worker (or a sidecar)
//! exposes `POST /api/workers/inference` on a known local port.
//! Concurrency is naturally multiplexed by the HTTP client — no
//! single-slot lock is needed here, unlike the stdio transport.

use super::{classify, transport_failure, CallDeadlines, CallOutcome, RequestEnvelope, WorkerIpc};
use crate::{OrchestratorError, Result};
use std::time::Duration;

const INFERENCE_PATH: &str = "/api/workers/inference";

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn post(
        &self,
        request: &RequestEnvelope,
        deadlines: CallDeadlines,
    ) -> Result<super::ResponseEnvelope> {
        let url = format!("{}{INFERENCE_PATH}", self.base_url);

        let send = || {
            self.client
                .post(&url)
                .timeout(deadlines.hard)
                .json(request)
                .send()
        };

        // §7 Recovery: a connect failure to the bridge triggers one
        // re-probe; non-2xx application responses are not retried here.
        let response = match send().await {
            Ok(resp) => resp,
            Err(first_err) if first_err.is_connect() => {
                tracing::warn!("HTTP bridge connect failed, re-probing once: {first_err}");
                tokio::time::sleep(Duration::from_millis(200)).await;
                send()
                    .await
                    .map_err(|e| transport_failure("http connect (retry)", e))?
            }
            Err(e) => return Err(transport_failure("http send", e)),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(transport_failure(
                "http status",
                format!("non-2xx status {}", status.as_u16()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| transport_failure("http decode", e))
    }
}

#[async_trait::async_trait]
impl WorkerIpc for HttpTransport {
    async fn initialize(&self) -> Result<()> {
        let request = RequestEnvelope::new(super::message_type::INITIALIZE, "");
        let deadlines = CallDeadlines::control(60, 30);
        let response = self.post(&request, deadlines).await?;
        if response.success {
            Ok(())
        } else {
            Err(OrchestratorError::ApplicationFailure(
                response
                    .error
                    .unwrap_or_else(|| "worker failed to initialize".to_string()),
            ))
        }
    }

    #[tracing::instrument(skip(self, request, deadlines), fields(message_type = %request.message_type))]
    async fn call(
        &self,
        request: RequestEnvelope,
        deadlines: CallDeadlines,
    ) -> Result<CallOutcome> {
        let response = self.post(&request, deadlines).await?;
        Ok(classify(response))
    }

    async fn dispose(&self) -> Result<()> {
        // The HTTP bridge's process lifecycle is not owned by this
        // transport (it may be a sidecar managed outside the orchestrator).
        Ok(())
    }
}
