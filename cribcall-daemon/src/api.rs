//! HTTPS side-channel routes
//!
//! Pairing endpoints are reachable by anonymous (not-yet-paired) callers;
//! the subscription endpoints require a pinned caller identity — the
//! fingerprint derived from the TLS peer certificate, never from the
//! request body.

use async_trait::async_trait;
use cribcall_protocol::pairing::{
    ConfirmResult, PairConfirmRequest, PairInitRequest, PairOutcome, PairTokenRequest,
};
use serde_json::json;
use tracing::{info, warn};

use crate::events::DaemonEvent;
use crate::http::{HttpHandler, HttpRequest, HttpResponse};
use crate::server::MonitorServer;
use crate::subscription::{SubscribeRequest, UnsubscribeRequest};

pub struct ApiService {
    server: MonitorServer,
}

impl ApiService {
    pub fn new(server: MonitorServer) -> Self {
        Self { server }
    }

    async fn pair_init(&self, request: &HttpRequest) -> HttpResponse {
        let body: PairInitRequest = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(e) => return HttpResponse::bad_request(format!("invalid pair init: {e}")),
        };

        let inner = self.server.inner();
        match inner.engine.lock().await.init(&body) {
            Ok((response, code)) => {
                info!(
                    session_id = %response.pairing_session_id,
                    remote = %body.device_name,
                    "pairing session opened, code ready for display"
                );
                let _ = inner.events.send(DaemonEvent::PairingCode {
                    session_id: response.pairing_session_id.clone(),
                    device_name: body.device_name.clone(),
                    code,
                });
                HttpResponse::ok(serde_json::to_value(response).expect("serializable response"))
            }
            Err(e) => HttpResponse::bad_request(e.to_string()),
        }
    }

    async fn pair_confirm(&self, request: &HttpRequest) -> HttpResponse {
        let body: PairConfirmRequest = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(e) => return HttpResponse::bad_request(format!("invalid pair confirm: {e}")),
        };

        let inner = self.server.inner();
        let result = inner.engine.lock().await.confirm(&body);
        if let ConfirmResult::Accepted(accepted) = &result {
            inner.apply_pairing(accepted).await;
        }
        let outcome = result.to_outcome();
        HttpResponse::ok(serde_json::to_value(outcome).expect("serializable outcome"))
    }

    async fn pair_token(&self, request: &HttpRequest) -> HttpResponse {
        let body: PairTokenRequest = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(e) => return HttpResponse::bad_request(format!("invalid token request: {e}")),
        };

        let inner = self.server.inner();
        let result = inner.engine.lock().await.redeem_token(&body);
        let outcome = match &result {
            Ok(accepted) => {
                inner.apply_pairing(accepted).await;
                PairOutcome::accepted(accepted.monitor.clone())
            }
            Err(failure) => {
                warn!(reason = failure.code(), "token pairing rejected");
                PairOutcome::rejected(failure.describe())
            }
        };
        HttpResponse::ok(serde_json::to_value(outcome).expect("serializable outcome"))
    }

    /// Resolve the caller to a trusted fingerprint, or an error response.
    fn authenticated_peer(&self, request: &HttpRequest) -> Result<String, HttpResponse> {
        let fingerprint = request
            .peer_fingerprint
            .clone()
            .ok_or_else(|| HttpResponse::unauthorized("client certificate required"))?;
        if !self.server.inner().trust.is_trusted(&fingerprint) {
            return Err(HttpResponse::forbidden("untrusted fingerprint"));
        }
        Ok(fingerprint)
    }

    async fn noise_subscribe(&self, request: &HttpRequest) -> HttpResponse {
        let fingerprint = match self.authenticated_peer(request) {
            Ok(fingerprint) => fingerprint,
            Err(response) => return response,
        };
        let body: SubscribeRequest = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(e) => return HttpResponse::bad_request(format!("invalid subscribe: {e}")),
        };
        if body.token.is_empty() {
            return HttpResponse::bad_request("token must not be empty");
        }

        let inner = self.server.inner();
        let ack = inner.subscriptions.upsert(&fingerprint, &body);
        // Keep the stored peer token in sync for push fallback cleanup.
        if crate::subscription::DeliveryMode::from_token(&body.token, &body.platform)
            .push_token()
            .is_some()
        {
            inner.trust.set_push_token(&fingerprint, Some(body.token.clone()));
        }
        HttpResponse::ok(serde_json::to_value(ack).expect("serializable ack"))
    }

    async fn noise_unsubscribe(&self, request: &HttpRequest) -> HttpResponse {
        let fingerprint = match self.authenticated_peer(request) {
            Ok(fingerprint) => fingerprint,
            Err(response) => return response,
        };
        let body: UnsubscribeRequest = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(e) => return HttpResponse::bad_request(format!("invalid unsubscribe: {e}")),
        };

        let removed = self
            .server
            .inner()
            .subscriptions
            .unsubscribe(&fingerprint, &body);
        HttpResponse::ok(json!({ "removed": removed }))
    }
}

#[async_trait]
impl HttpHandler for ApiService {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/pair/init") => self.pair_init(&request).await,
            ("POST", "/pair/confirm") => self.pair_confirm(&request).await,
            ("POST", "/pair/token") => self.pair_token(&request).await,
            ("GET", "/health") => HttpResponse::ok(self.server.inner().health()),
            ("POST", "/noise/subscribe") => self.noise_subscribe(&request).await,
            ("POST", "/noise/unsubscribe") => self.noise_unsubscribe(&request).await,
            _ => HttpResponse::not_found(),
        }
    }
}
