//! HTTP control surface
//!
//! Serves the JSON data a dashboard polls and accepts runtime commands.
//! Hand-rolled http1 service; commands are acknowledged immediately and
//! complete asynchronously in the tracker, so a slow external operation
//! never stalls this surface.

use crate::correlator::{CorrelatorStats, GateCell};
use crate::tracker::{ConnectionTracker, TrackerError};
use crosswire_core::gate::LogicGate;
use crosswire_core::history::HistoryBuffer;
use crosswire_core::types::{ChannelId, Transport};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type BoxBody = Full<Bytes>;

/// Read-only view of one channel for status reporting
#[derive(Clone)]
pub struct ChannelView {
    pub id: ChannelId,
    pub name: Arc<str>,
    pub transport: Transport,
    pub history: Arc<RwLock<HistoryBuffer>>,
}

/// Everything the control surface reads or mutates
pub struct ControlState {
    pub channels: Vec<ChannelView>,
    pub gate: Arc<GateCell>,
    pub tracker: Arc<ConnectionTracker>,
    pub stats: Arc<CorrelatorStats>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<BoxBody> {
    let body_str = serde_json::to_string(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body_str)))
        .expect("static response parts are valid")
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    json_response(
        status,
        serde_json::json!({ "status": "error", "message": message }),
    )
}

/// Run the control server until shutdown.
pub async fn run_control_server(
    listen: SocketAddr,
    state: Arc<ControlState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listen, "control surface listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(req, &state).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        // Clients hanging up mid-request are routine.
                        if !e.is_incomplete_message() {
                            warn!(peer = %peer, error = %e, "control connection error");
                        }
                    }
                });
            }
            _ = shutdown.recv() => {
                debug!("control surface shutting down");
                return Ok(());
            }
        }
    }
}

/// Route an incoming request.
async fn handle_request(
    req: Request<Incoming>,
    state: &ControlState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/status") => json_response(StatusCode::OK, status_snapshot(state)),
        (Method::POST, "/command") => {
            let body = req.into_body().collect().await?.to_bytes();
            let (status, value) = apply_command(state, &body);
            json_response(status, value)
        }
        (Method::POST, "/set_logic_gate") => {
            let body = req.into_body().collect().await?.to_bytes();
            let (status, value) = apply_set_gate(state, &body);
            json_response(status, value)
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    };

    Ok(response)
}

/// Current snapshot: per-channel state and history, the active gate,
/// and correlator counters. No side effects.
fn status_snapshot(state: &ControlState) -> serde_json::Value {
    let connection_states = state.tracker.states();
    let channels: Vec<serde_json::Value> = state
        .channels
        .iter()
        .map(|ch| {
            let history: Vec<serde_json::Value> = ch
                .history
                .read()
                .entries()
                .map(|e| serde_json::to_value(e).unwrap_or_default())
                .collect();
            serde_json::json!({
                "name": &*ch.name,
                "id": ch.id.0,
                "transport": ch.transport,
                "connection_state": connection_states
                    .get(&*ch.name)
                    .copied()
                    .unwrap_or_default(),
                "history": history,
            })
        })
        .collect();

    serde_json::json!({
        "logic_gate": state.gate.get(),
        "pending_entries": state.stats.pending_entries(),
        "satisfied_total": state.stats.satisfied_total(),
        "channels": channels,
    })
}

/// `POST /command {"channel": NAME, "action": "connect"|"disconnect"}`.
/// Acknowledges once the tracker has taken the request; the final state
/// shows up in `/status`.
fn apply_command(state: &ControlState, body: &[u8]) -> (StatusCode, serde_json::Value) {
    let parsed: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "status": "error", "message": "malformed JSON body" }),
            )
        }
    };

    let channel = parsed.get("channel").and_then(|v| v.as_str());
    let action = parsed.get("action").and_then(|v| v.as_str());

    let result = match (channel, action) {
        (Some(channel), Some("connect")) => state.tracker.request_connect(channel),
        (Some(channel), Some("disconnect")) => state.tracker.request_disconnect(channel),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "status": "error",
                    "message": "expected {\"channel\": NAME, \"action\": \"connect\"|\"disconnect\"}"
                }),
            )
        }
    };

    match result {
        Ok(_started) => (StatusCode::OK, serde_json::json!({ "status": "ok" })),
        Err(e @ TrackerError::UnknownChannel(_)) | Err(e @ TrackerError::NoTunnel(_)) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "message": e.to_string() }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "status": "error", "message": e.to_string() }),
        ),
    }
}

/// `POST /set_logic_gate {"logic_gate": NAME}`. Case-insensitive; an
/// unrecognized name is rejected with no state change.
fn apply_set_gate(state: &ControlState, body: &[u8]) -> (StatusCode, serde_json::Value) {
    let parsed: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "status": "error", "message": "malformed JSON body" }),
            )
        }
    };

    let Some(name) = parsed.get("logic_gate").and_then(|v| v.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "message": "missing logic_gate" }),
        );
    };

    match name.parse::<LogicGate>() {
        Ok(gate) => {
            let previous = state.gate.set(gate);
            info!(%gate, %previous, "logic gate set");
            (StatusCode::OK, serde_json::json!({ "status": "ok" }))
        }
        Err(_) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "message": "Invalid logic gate" }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::NoTunnelControl;
    use crosswire_core::history::HistoryEntry;
    use std::time::SystemTime;

    fn test_state() -> ControlState {
        let tracker = Arc::new(ConnectionTracker::new(Arc::new(NoTunnelControl)));
        tracker.register("usb", ChannelId(0), Some("VPN-USB".to_string()));
        tracker.register("wifi", ChannelId(1), None);

        let history = Arc::new(RwLock::new(HistoryBuffer::new(50)));
        history
            .write()
            .push(HistoryEntry::new(SystemTime::now(), "hello".to_string()));

        ControlState {
            channels: vec![
                ChannelView {
                    id: ChannelId(0),
                    name: Arc::from("usb"),
                    transport: Transport::Datagram,
                    history,
                },
                ChannelView {
                    id: ChannelId(1),
                    name: Arc::from("wifi"),
                    transport: Transport::Stream,
                    history: Arc::new(RwLock::new(HistoryBuffer::new(50))),
                },
            ],
            gate: Arc::new(GateCell::new(LogicGate::And)),
            tracker,
            stats: Arc::new(CorrelatorStats::default()),
        }
    }

    #[tokio::test]
    async fn status_reports_channels_gate_and_history() {
        let state = test_state();
        let snapshot = status_snapshot(&state);

        assert_eq!(snapshot["logic_gate"], "AND");
        assert_eq!(snapshot["channels"].as_array().unwrap().len(), 2);
        assert_eq!(snapshot["channels"][0]["connection_state"], "disconnected");
        assert_eq!(snapshot["channels"][0]["history"][0]["summary"], "hello");
        assert_eq!(snapshot["channels"][1]["history"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn invalid_gate_is_rejected_without_state_change() {
        let state = test_state();
        let (status, body) = apply_set_gate(&state, br#"{"logic_gate": "MAYBE"}"#);

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        // Prior value intact and still reported.
        assert_eq!(state.gate.get(), LogicGate::And);
        assert_eq!(status_snapshot(&state)["logic_gate"], "AND");
    }

    #[tokio::test]
    async fn valid_gate_swaps_case_insensitively() {
        let state = test_state();
        let (status, body) = apply_set_gate(&state, br#"{"logic_gate": "xnor"}"#);

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(state.gate.get(), LogicGate::Xnor);
    }

    #[tokio::test]
    async fn command_acks_immediately() {
        let state = test_state();
        let (status, body) =
            apply_command(&state, br#"{"channel": "usb", "action": "connect"}"#);

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn command_rejects_unknown_channel_and_action() {
        let state = test_state();

        let (status, _) =
            apply_command(&state, br#"{"channel": "nope", "action": "connect"}"#);
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            apply_command(&state, br#"{"channel": "usb", "action": "reboot"}"#);
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = apply_command(&state, b"not json");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn command_rejects_channel_without_tunnel() {
        let state = test_state();
        let (status, body) =
            apply_command(&state, br#"{"channel": "wifi", "action": "connect"}"#);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }
}
