/// Push channel connector: one WebSocket per authenticated session
use crate::error::{ChatError, Result};
use crate::transport::protocol::{
    Envelope, JoinPayload, EVENT_CONNECT, EVENT_CONNECT_ERROR, EVENT_DISCONNECT, EVENT_JOIN,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// Callback for one named inbound event
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum Link {
    Idle,
    Connecting,
    Connected {
        generation: u64,
        outbound: mpsc::UnboundedSender<WsMessage>,
        reader: JoinHandle<()>,
    },
}

struct Inner {
    url: String,
    connect_timeout: Duration,
    link: Mutex<Link>,
    generation: Mutex<u64>,
    handlers: RwLock<HashMap<String, EventHandler>>,
}

/// Push channel handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                connect_timeout,
                link: Mutex::new(Link::Idle),
                generation: Mutex::new(0),
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Open the channel and announce presence with `join{sessionId}`.
    ///
    /// No-op while already connected or connecting. Failures are logged,
    /// dispatched as `connect_error` and returned; nothing is retried.
    /// A `disconnect` racing the handshake makes this return an error.
    pub async fn connect(&self, session_id: &str) -> Result<()> {
        {
            let mut link = self.inner.lock_link();
            match *link {
                Link::Idle => *link = Link::Connecting,
                Link::Connecting | Link::Connected { .. } => {
                    debug!("Push channel already up, ignoring connect");
                    return Ok(());
                }
            }
        }

        let ws = match timeout(self.inner.connect_timeout, connect_async(self.inner.url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string())),
            Err(_) => return Err(self.connect_failed("connection timed out".to_string())),
        };

        let generation = {
            let mut g = self
                .inner
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *g += 1;
            *g
        };

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("Push channel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        {
            let mut link = self.inner.lock_link();
            if !matches!(*link, Link::Connecting) {
                warn!("Push channel torn down during connect, dropping socket");
                let _ = outbound.send(WsMessage::Close(None));
                return Err(ChatError::Transport(
                    "disconnected during connect".to_string(),
                ));
            }

            // Spawned under the link lock: a remote close cannot be handled
            // before the link records this generation as connected.
            let inner = self.inner.clone();
            let reader = tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => inner.dispatch_frame(&text),
                        Ok(WsMessage::Close(_)) => {
                            debug!("Push channel closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Push channel read failed: {}", e);
                            break;
                        }
                    }
                }
                inner.on_remote_closed(generation);
            });
            *link = Link::Connected {
                generation,
                outbound,
                reader,
            };
        }

        info!("Push channel connected to {}", self.inner.url);
        self.inner.dispatch(EVENT_CONNECT, Value::Null);

        let join = JoinPayload {
            session_id: session_id.to_string(),
        };
        self.send(EVENT_JOIN, serde_json::to_value(&join)?);
        Ok(())
    }

    fn connect_failed(&self, reason: String) -> ChatError {
        *self.inner.lock_link() = Link::Idle;
        error!("Push channel connection to {} failed: {}", self.inner.url, reason);
        self.inner
            .dispatch(EVENT_CONNECT_ERROR, Value::String(reason.clone()));
        ChatError::Transport(reason)
    }

    /// Close the channel and reset so `connect` can run again.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_link(), Link::Idle);
        match previous {
            Link::Connected {
                outbound, reader, ..
            } => {
                let _ = outbound.send(WsMessage::Close(None));
                reader.abort();
                info!("Push channel disconnected");
                self.inner.dispatch(EVENT_DISCONNECT, Value::Null);
            }
            Link::Connecting => debug!("Push channel connect abandoned"),
            Link::Idle => {}
        }
    }

    /// Emit an event. Returns false (and drops the event) when not connected.
    pub fn send(&self, event: &str, data: Value) -> bool {
        let text = match Envelope::new(event, data).to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} event: {}", event, e);
                return false;
            }
        };

        let link = self.inner.lock_link();
        match &*link {
            Link::Connected { outbound, .. } => {
                if outbound.send(WsMessage::Text(text.into())).is_ok() {
                    true
                } else {
                    warn!("Push channel writer gone, dropping {} event", event);
                    false
                }
            }
            _ => {
                warn!("Push channel not connected, dropping {} event", event);
                false
            }
        }
    }

    /// Register the handler for `event`, replacing any previous one.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let previous = self
            .inner
            .write_handlers()
            .insert(event.to_string(), Arc::new(handler));
        if previous.is_some() {
            debug!("Replaced handler for {}", event);
        }
    }

    pub fn unsubscribe(&self, event: &str) {
        self.inner.write_handlers().remove(event);
    }

    pub fn unsubscribe_all(&self) {
        self.inner.write_handlers().clear();
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(event)
    }

    pub fn state(&self) -> ConnectionState {
        match *self.inner.lock_link() {
            Link::Idle => ConnectionState::Disconnected,
            Link::Connecting => ConnectionState::Connecting,
            Link::Connected { .. } => ConnectionState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl Inner {
    fn lock_link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, EventHandler>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_frame(&self, text: &str) {
        match Envelope::from_text(text) {
            Ok(envelope) => self.dispatch(&envelope.event, envelope.data),
            Err(e) => warn!("Ignoring malformed push frame: {}", e),
        }
    }

    fn dispatch(&self, event: &str, data: Value) {
        // Clone out so a handler may (un)subscribe without deadlocking
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned();
        match handler {
            Some(handler) => handler(data),
            None => debug!("No handler for {} event", event),
        }
    }

    /// Reader ended on its own. Only the current connection may reset state.
    fn on_remote_closed(&self, generation: u64) {
        {
            let mut link = self.lock_link();
            let current =
                matches!(&*link, Link::Connected { generation: g, .. } if *g == generation);
            if !current {
                return;
            }
            *link = Link::Idle;
        }
        warn!("Push channel lost; live updates paused until reconnect");
        self.dispatch(EVENT_DISCONNECT, Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let transport = Transport::new("ws://127.0.0.1:1", Duration::from_millis(100));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!transport.send("typing", Value::Null));
    }

    #[test]
    fn test_subscribe_replaces_handler() {
        let transport = Transport::new("ws://127.0.0.1:1", Duration::from_millis(100));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        transport.subscribe("userOnline", move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        transport.subscribe("userOnline", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        transport
            .inner
            .dispatch_frame(r#"{"event":"userOnline","data":["u1"]}"#);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        transport.unsubscribe("userOnline");
        assert!(!transport.is_subscribed("userOnline"));
        transport
            .inner
            .dispatch_frame(r#"{"event":"userOnline","data":["u1"]}"#);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let transport = Transport::new("ws://127.0.0.1:1", Duration::from_millis(500));
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        transport.subscribe(EVENT_CONNECT_ERROR, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let result = transport.connect("u1").await;
        assert!(matches!(result, Err(ChatError::Transport(_))));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
