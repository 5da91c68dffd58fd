//! Request handlers for sync endpoints.
//!
//! Transport layers hand a route, an optional session id and a JSON body to
//! [`RequestHandler::handle`] and get back a status code and a JSON body.

use crate::error::{SyncError, SyncResult};
use crate::manager::SyncManager;
use crate::stream::SyncStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;
use ticksync_protocol::{
    CompletePushRequest, EndSessionRequest, PageRequest, PullRequest, PushRequest, SyncRequest,
    SyncRoute,
};
use tracing::{debug, warn};

/// Status code and JSON body of a handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

impl HandlerResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// Builds the error response clients see for `error`.
    pub fn from_error(error: &SyncError) -> Self {
        Self {
            status: error.status_code(),
            body: json!({
                "error": {
                    "message": error.to_string(),
                    "retryable": error.is_retryable(),
                }
            }),
        }
    }

    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Handler for sync requests.
#[derive(Clone)]
pub struct RequestHandler {
    manager: SyncManager,
}

impl RequestHandler {
    /// Creates a handler.
    pub fn new(manager: SyncManager) -> Self {
        Self { manager }
    }

    /// The manager requests are dispatched to.
    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    /// Handles one request.
    pub async fn handle(&self, route: SyncRoute, session_id: Option<&str>, body: Value) -> HandlerResponse {
        let started = Instant::now();
        let result = self.dispatch(route, session_id, body).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(session_id) = session_id {
            // Timings are best effort; the session may already be gone.
            let key = format!("{route}Timing");
            let _ = self
                .manager
                .sessions()
                .add_debug_info(session_id, json!({ key: { "durationMs": duration_ms } }));
        }

        match result {
            Ok(body) => {
                debug!(%route, duration_ms, "request handled");
                HandlerResponse::ok(body)
            }
            Err(e) => {
                if e.is_server_error() {
                    warn!(%route, error = %e, "request failed");
                } else {
                    debug!(%route, error = %e, "request rejected");
                }
                HandlerResponse::from_error(&e)
            }
        }
    }

    async fn dispatch(&self, route: SyncRoute, session_id: Option<&str>, body: Value) -> SyncResult<Value> {
        let session_id = match (route.requires_session(), session_id) {
            (true, Some(id)) => id,
            (true, None) => {
                return Err(SyncError::InvalidRequest(format!("{route} requires a session id")))
            }
            (false, _) => "",
        };
        let manager = &self.manager;
        match route {
            SyncRoute::CheckSyncRequest => {
                let request: SyncRequest = parse(body)?;
                to_json(&manager.check_sync_request(request).await?)
            }
            SyncRoute::SessionReady => Ok(json!(manager.check_session_ready(session_id)?)),
            SyncRoute::InitiatePull => {
                manager.initiate_pull(session_id, parse::<PullRequest>(body)?)?;
                Ok(json!({}))
            }
            SyncRoute::PullReady => Ok(json!(manager.check_pull_ready(session_id)?)),
            SyncRoute::PullMetadata => to_json(&manager.fetch_pull_metadata(session_id)?),
            SyncRoute::OutgoingChanges => {
                let page: PageRequest = parse_or_default(body)?;
                to_json(&manager.get_outgoing_changes(session_id, page)?)
            }
            SyncRoute::Push => {
                let request: PushRequest = parse(body)?;
                let count = manager.add_incoming_changes(session_id, request)?;
                Ok(json!({ "accepted": count }))
            }
            SyncRoute::CompletePush => {
                manager.complete_push(session_id, parse::<CompletePushRequest>(body)?)?;
                Ok(json!({}))
            }
            SyncRoute::PushComplete => Ok(json!(manager.check_push_complete(session_id)?)),
            SyncRoute::EndSession => {
                let request: EndSessionRequest = parse_or_default(body)?;
                manager.end_session(session_id, request)?;
                Ok(json!({}))
            }
        }
    }

    /// Opens a streamed response for the routes that support one.
    pub fn open_stream(&self, route: SyncRoute, session_id: &str) -> SyncResult<SyncStream> {
        match route {
            SyncRoute::SessionReady => Ok(self.manager.stream_session_ready(session_id)),
            SyncRoute::OutgoingChanges => Ok(self.manager.stream_outgoing_changes(session_id)),
            other => Err(SyncError::InvalidRequest(format!("{other} cannot be streamed"))),
        }
    }
}

fn parse<T: DeserializeOwned>(body: Value) -> SyncResult<T> {
    serde_json::from_value(body).map_err(|e| SyncError::InvalidRequest(e.to_string()))
}

fn parse_or_default<T: DeserializeOwned + Default>(body: Value) -> SyncResult<T> {
    if body.is_null() {
        return Ok(T::default());
    }
    parse(body)
}

fn to_json<T: Serialize>(value: &T) -> SyncResult<Value> {
    serde_json::to_value(value).map_err(|e| SyncError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::models::{ModelRegistry, SimpleModel};
    use ticksync_protocol::SyncDirection;
    use ticksync_store::Database;

    fn create_handler() -> RequestHandler {
        let models = ModelRegistry::new()
            .register(SimpleModel::new("reference_data", SyncDirection::PullFromCentral));
        let manager = SyncManager::new(
            Database::new(),
            SyncConfig::new().with_await_preparation(true),
            models,
        )
        .unwrap();
        RequestHandler::new(manager)
    }

    async fn start(handler: &RequestHandler) -> String {
        let response = handler
            .handle(
                SyncRoute::CheckSyncRequest,
                None,
                json!({"deviceId": "dev-1", "lastSyncedTick": 0, "facilityIds": ["f1"]}),
            )
            .await;
        assert!(response.is_success(), "{response:?}");
        assert_eq!(response.body["status"], "goodToGo");
        response.body["sessionId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn check_sync_request_starts_session() {
        let handler = create_handler();
        let session_id = start(&handler).await;
        let ready = handler
            .handle(SyncRoute::SessionReady, Some(&session_id), Value::Null)
            .await;
        assert_eq!(ready.body, json!(true));

        let session = handler.manager().sessions().get(&session_id).unwrap();
        assert!(session.debug_info.contains_key("sessionReadyTiming"));
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let handler = create_handler();
        let response = handler
            .handle(SyncRoute::PullReady, Some("missing"), Value::Null)
            .await;
        assert_eq!(response.status, 404);
        assert_eq!(
            response.body["error"]["message"],
            "Sync session 'missing' not found"
        );
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let handler = create_handler();
        let response = handler
            .handle(SyncRoute::CheckSyncRequest, None, json!({"lastSyncedTick": "x"}))
            .await;
        assert_eq!(response.status, 400);

        let response = handler.handle(SyncRoute::PullReady, None, Value::Null).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn security_violation_is_forbidden() {
        let handler = create_handler();
        let session_id = start(&handler).await;
        let response = handler
            .handle(
                SyncRoute::Push,
                Some(&session_id),
                json!({"changes": [{"recordType": "reference_data", "recordId": "r1"}]}),
            )
            .await;
        assert_eq!(response.status, 403);

        let ended = handler
            .handle(SyncRoute::EndSession, Some(&session_id), Value::Null)
            .await;
        assert!(!ended.is_success());
    }

    #[tokio::test]
    async fn only_some_routes_stream() {
        let handler = create_handler();
        assert!(handler.open_stream(SyncRoute::Push, "s").is_err());
        assert!(handler.open_stream(SyncRoute::OutgoingChanges, "s").is_ok());
    }
}
