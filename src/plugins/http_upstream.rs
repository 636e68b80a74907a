//! HTTP upstream: each call is one POST to the selected target.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Middleware, Next};
use crate::rpc::envelope::decode_response;
use crate::rpc::{RequestSession, RpcResponse};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpUpstreamOptions {
    pub default_target: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpUpstreamOptions {
    fn default() -> Self {
        Self {
            default_target: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Terminal plugin forwarding calls over HTTP.
#[derive(Debug)]
pub struct HttpUpstreamMiddleware {
    options: HttpUpstreamOptions,
    client: reqwest::Client,
}

impl HttpUpstreamMiddleware {
    pub fn new(options: HttpUpstreamOptions) -> ProxyResult<Self> {
        let client = reqwest::Client::builder().timeout(options.timeout).build()?;
        Ok(Self { options, client })
    }

    fn target_for(&self, session: &RequestSession) -> ProxyResult<String> {
        let conn = session.connection()?;
        if let Some(target) = conn.selected_target() {
            return Ok(target.to_string());
        }
        let target = self
            .options
            .default_target
            .clone()
            .ok_or(ProxyError::NoUpstreamTarget)?;
        conn.select_target_once(target.clone());
        Ok(target)
    }
}

async fn post(client: reqwest::Client, target: String, body: Vec<u8>) -> ProxyResult<RpcResponse> {
    let bytes = client
        .post(&target)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    decode_response(&bytes).map_err(|e| {
        tracing::warn!(upstream = %target, error = %e, "Malformed upstream envelope");
        ProxyError::MalformedEnvelope(e.to_string())
    })
}

#[async_trait]
impl Middleware for HttpUpstreamMiddleware {
    fn name(&self) -> &'static str {
        "http_upstream"
    }

    async fn on_rpc_request(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        if !session.has_response() {
            let target = self.target_for(session)?;
            let request = session.request()?;
            let id = request.id;
            let body = serde_json::to_vec(request)?;

            let (tx, rx) = oneshot::channel();
            session.attach_reply(0, rx);

            let client = self.client.clone();
            let connection_id = session.connection_id();
            tokio::spawn(async move {
                let response = match post(client, target, body).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(connection_id = %connection_id, request_id = id, error = %e, "Http upstream call failed");
                        RpcResponse::failure(id, e.to_rpc_error())
                    }
                };
                let _ = tx.send(response);
            });
        }
        next.on_rpc_request(session).await
    }

    async fn process_rpc_request(
        &self,
        session: &mut RequestSession,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        if !session.has_response() {
            let id = session.request()?.id;
            let response = match session.wait_for_reply(self.options.timeout).await {
                Ok(response) => response.with_id(id),
                Err(e) => RpcResponse::failure(id, e.to_rpc_error()),
            };
            session.fill_response(response)?;
        }
        next.process_rpc_request(session).await
    }
}
