//! WebSocket subscriber sessions.
//!
//! Each socket is one notifier session. Clients send JSON requests tagged by
//! `action`; confirmations and errors go straight back, track updates and
//! area batches are forwarded from the session queue. Closing the socket
//! drops every subscription it held.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use track_core::subscription::Confirmation;
use track_core::types::Result;

use crate::notifier::GeoNotifier;
use crate::web::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    SubscribeEntity {
        entity_id: String,
    },
    SubscribeArea {
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    },
    UnsubscribeEntity {
        entity_id: String,
    },
    UnsubscribeArea {
        area_key: String,
    },
}

pub fn handle_request(notifier: &GeoNotifier, session: &str, request: ClientRequest) -> Result<Confirmation> {
    match request {
        ClientRequest::SubscribeEntity { entity_id } => notifier.subscribe_entity(session, &entity_id),
        ClientRequest::SubscribeArea {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        } => notifier.subscribe_area(session, min_lat, max_lat, min_lon, max_lon),
        ClientRequest::UnsubscribeEntity { entity_id } => Ok(notifier.unsubscribe_entity(session, &entity_id)),
        ClientRequest::UnsubscribeArea { area_key } => notifier.unsubscribe_area(session, &area_key),
    }
}

fn reply(text: &str, notifier: &GeoNotifier, session: &str) -> String {
    let outcome = serde_json::from_str::<ClientRequest>(text)
        .map_err(|e| e.to_string())
        .and_then(|req| handle_request(notifier, session, req).map_err(|e| e.to_string()));
    match outcome {
        Ok(confirmation) => serde_json::to_string(&confirmation).unwrap_or_default(),
        Err(message) => json!({ "type": "error", "message": message }).to_string(),
    }
}

pub async fn api_stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let notifier = state.notifier.clone();
    ws.on_upgrade(move |socket| session_loop(socket, notifier))
}

async fn session_loop(socket: WebSocket, notifier: Arc<GeoNotifier>) {
    let mut session = notifier.connect();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let answer = reply(&text, &notifier, &session.id);
                    if sink.send(Message::Text(answer)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = session.rx.recv() => match outgoing {
                Some(message) => {
                    let Ok(text) = serde_json::to_string(message.as_ref()) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let removed = notifier.disconnect(&session.id);
    debug!(session = %session.id, subscriptions = removed.len(), "socket closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::Value;
    use tokio_tungstenite::tungstenite;

    use track_core::config::Config;
    use track_core::gate::StateStore;
    use track_core::types::{EntityClass, FusedTrackRecord, RawTrackRecord, TrackFields};

    use super::*;
    use crate::pipeline::PipelineStats;
    use crate::web::build_router;

    fn notifier() -> Arc<GeoNotifier> {
        let state = Arc::new(StateStore::new());
        Arc::new(GeoNotifier::new(
            Config::default().notifier,
            state,
            Arc::new(PipelineStats::default()),
        ))
    }

    #[test]
    fn test_reply_confirmation_and_error() {
        let n = notifier();
        let ok: Value = serde_json::from_str(&reply(
            r#"{"action":"subscribe_entity","entity_id":"7c1b72"}"#,
            &n,
            "s1",
        ))
        .unwrap();
        assert_eq!(ok["type"], "entity");
        assert_eq!(ok["key"], "entity_7C1B72");

        let bad: Value = serde_json::from_str(&reply(
            r#"{"action":"subscribe_area","min_lat":23.5,"max_lat":8.5,"min_lon":102,"max_lon":109.5}"#,
            &n,
            "s1",
        ))
        .unwrap();
        assert_eq!(bad["type"], "error");

        let unknown: Value = serde_json::from_str(&reply(r#"{"action":"dance"}"#, &n, "s1")).unwrap();
        assert_eq!(unknown["type"], "error");
    }

    #[test]
    fn test_unsubscribe_area_by_key() {
        let n = notifier();
        let c = handle_request(
            &n,
            "s1",
            ClientRequest::SubscribeArea {
                min_lat: 8.5,
                max_lat: 23.5,
                min_lon: 102.0,
                max_lon: 109.5,
            },
        )
        .unwrap();
        let u = handle_request(&n, "s1", ClientRequest::UnsubscribeArea { area_key: c.key.clone() }).unwrap();
        assert_eq!(u.key, c.key);
        assert_eq!(n.area_count(), 0);
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let tungstenite::Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_socket_session_receives_updates() {
        let n = notifier();
        let state = Arc::new(AppState {
            adapters: Vec::new(),
            aggregators: Vec::new(),
            stats: Arc::new(PipelineStats::default()),
            notifier: n.clone(),
            state: Arc::new(StateStore::new()),
            started_at: Instant::now(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/stream"))
            .await
            .unwrap();
        ws.send(tungstenite::Message::Text(
            r#"{"action":"subscribe_entity","entity_id":"ABC123"}"#.into(),
        ))
        .await
        .unwrap();
        let confirmation = next_json(&mut ws).await;
        assert_eq!(confirmation["status"], "subscribed");
        assert_eq!(n.session_count(), 1);

        let raw = RawTrackRecord::new(
            "ABC123",
            EntityClass::Aircraft,
            "adsbexchange",
            TrackFields {
                lat: Some(10.0),
                lon: Some(106.0),
                status: Some("7700".into()),
                ..Default::default()
            },
            0.95,
            0.0,
        )
        .unwrap();
        assert_eq!(n.publish(&FusedTrackRecord::from_raw(&raw, 0.0)), 1);

        let update = next_json(&mut ws).await;
        assert_eq!(update["type"], "track_update");
        assert_eq!(update["record"]["fields"]["status"], "7700");

        ws.close(None).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while n.session_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(n.session_count(), 0);
    }
}
