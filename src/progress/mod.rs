//! Progress Stream Hub (§4.5): one long-lived channel per refresh session,
//! heartbeats, and back-pressure-safe delivery to a possibly slow or
//! already-gone subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

const SINK_QUEUE_CAPACITY: usize = 256;
const HEARTBEAT_TICK: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const VISIBLE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(180);
const TIMEOUT_WARNING_THRESHOLD: Duration = Duration::from_secs(55);

/// A single wire frame: either a real event or an SSE comment keep-alive.
#[derive(Debug, Clone)]
pub enum Frame {
    Event(Value),
    KeepAlive,
}

struct Session {
    tx: mpsc::Sender<Frame>,
    last_write: Arc<Mutex<Instant>>,
    heartbeat_handle: tokio::task::JoinHandle<()>,
}

/// Registry of active session sinks (§4.5). One instance per process;
/// tests construct dedicated instances (§9).
pub struct ProgressHub {
    sessions: Mutex<HashMap<String, Session>>,
}

impl ProgressHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe a new sink for `session_id`, returning the receiver side
    /// the HTTP layer turns into an SSE stream. Emits the initial
    /// `connected` event synchronously.
    pub fn subscribe(self: &Arc<Self>, session_id: String) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(SINK_QUEUE_CAPACITY);
        let last_write = Arc::new(Mutex::new(Instant::now()));

        let heartbeat_handle = {
            let hub = self.clone();
            let session_id = session_id.clone();
            let tx = tx.clone();
            let last_write = last_write.clone();
            tokio::spawn(async move {
                hub.run_heartbeat(session_id, tx, last_write).await;
            })
        };

        self.sessions.lock().insert(
            session_id.clone(),
            Session {
                tx: tx.clone(),
                last_write,
                heartbeat_handle,
            },
        );

        self.emit(&session_id, event("connected", &session_id, json!({})));
        rx
    }

    /// Remove a session and cancel its heartbeat (explicit close,
    /// transport error, or write failure - §4.5).
    pub fn unsubscribe(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().remove(session_id) {
            session.heartbeat_handle.abort();
            debug!(session_id, "progress sink removed");
        }
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn emit_progress(&self, session_id: &str, message: &str, progress: u8, processed: u64, total: u64, current: Option<&str>) {
        let mut fields = json!({
            "message": message,
            "progress": progress,
            "processed": processed,
            "total": total,
        });
        if let Some(current) = current {
            fields["current"] = json!(current);
        }
        self.emit(session_id, event("progress", session_id, fields));
    }

    pub fn emit_completed(&self, session_id: &str, summary: Value) {
        self.emit(session_id, event("completed", session_id, summary));
        self.unsubscribe(session_id);
    }

    pub fn emit_error(&self, session_id: &str, message: &str) {
        self.emit(session_id, event("error", session_id, json!({ "message": message })));
        self.unsubscribe(session_id);
    }

    pub fn emit_cancelled(&self, session_id: &str) {
        self.emit(session_id, event("cancelled", session_id, json!({})));
        self.unsubscribe(session_id);
    }

    #[cfg(test)]
    pub fn emit_test(&self, session_id: &str) {
        self.emit(session_id, event("test", session_id, json!({})));
    }

    /// Write one frame to a session's sink. A full queue or closed
    /// receiver is treated as a disconnected subscriber: the sink is
    /// dropped and its heartbeat cancelled (§4.5, §5 timeouts).
    fn emit(&self, session_id: &str, value: Value) {
        let (tx, last_write) = {
            let sessions = self.sessions.lock();
            let Some(session) = sessions.get(session_id) else {
                return;
            };
            (session.tx.clone(), session.last_write.clone())
        };

        match tx.try_send(Frame::Event(value)) {
            Ok(()) => *last_write.lock() = Instant::now(),
            Err(_) => self.unsubscribe(session_id),
        }
    }

    async fn run_heartbeat(self: Arc<Self>, session_id: String, tx: mpsc::Sender<Frame>, last_write: Arc<Mutex<Instant>>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_TICK);
        let mut last_keepalive = Instant::now();
        let mut last_visible_heartbeat = Instant::now();

        loop {
            ticker.tick().await;
            if !self.is_subscribed(&session_id) {
                return;
            }

            let now = Instant::now();
            let since_write = now.duration_since(*last_write.lock());

            if since_write >= TIMEOUT_WARNING_THRESHOLD {
                if tx.try_send(Frame::Event(event("timeout_warning", &session_id, json!({})))).is_err() {
                    self.unsubscribe(&session_id);
                    return;
                }
                *last_write.lock() = now;
                continue;
            }

            if now.duration_since(last_keepalive) >= KEEPALIVE_INTERVAL {
                let frame = if now.duration_since(last_visible_heartbeat) >= VISIBLE_HEARTBEAT_INTERVAL {
                    last_visible_heartbeat = now;
                    Frame::Event(event("heartbeat", &session_id, json!({})))
                } else {
                    Frame::KeepAlive
                };
                if tx.try_send(frame).is_err() {
                    self.unsubscribe(&session_id);
                    return;
                }
                last_keepalive = now;
                *last_write.lock() = now;
            }
        }
    }
}

fn event(kind: &str, session_id: &str, mut fields: Value) -> Value {
    let obj = fields.as_object_mut().expect("event fields are always a JSON object");
    obj.insert("type".to_string(), json!(kind));
    obj.insert("sessionId".to_string(), json!(session_id));
    obj.insert("timestamp".to_string(), json!(Utc::now().timestamp_millis()));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_emits_connected_first() {
        let hub = ProgressHub::new();
        let mut rx = hub.subscribe("s1".to_string());
        let frame = rx.recv().await.unwrap();
        match frame {
            Frame::Event(v) => assert_eq!(v["type"], "connected"),
            Frame::KeepAlive => panic!("expected connected event"),
        }
    }

    #[tokio::test]
    async fn progress_events_preserve_emission_order() {
        let hub = ProgressHub::new();
        let mut rx = hub.subscribe("s1".to_string());
        rx.recv().await.unwrap(); // connected

        hub.emit_progress("s1", "batch 1", 10, 100, 1000, None);
        hub.emit_progress("s1", "batch 2", 20, 200, 1000, Some("BTC-USDT"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let Frame::Event(first) = first else { panic!() };
        let Frame::Event(second) = second else { panic!() };
        assert_eq!(first["progress"], 10);
        assert_eq!(second["progress"], 20);
    }

    #[tokio::test]
    async fn completed_event_removes_session() {
        let hub = ProgressHub::new();
        let mut rx = hub.subscribe("s1".to_string());
        rx.recv().await.unwrap();
        hub.emit_completed("s1", json!({ "created": 5 }));
        rx.recv().await.unwrap();
        assert!(!hub.is_subscribed("s1"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_drops_silently_emitted_events() {
        let hub = ProgressHub::new();
        hub.subscribe("s1".to_string());
        hub.unsubscribe("s1");
        hub.unsubscribe("s1");
        hub.emit_progress("s1", "ignored", 50, 1, 2, None);
    }
}
