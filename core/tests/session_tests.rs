/// Session wiring: push channel events flowing through the sync loop
use async_trait::async_trait;
use chatsync_core::api::ChatApi;
use chatsync_core::config::ClientConfig;
use chatsync_core::error::{ChatError, Result};
use chatsync_core::messenger_types::{
    Ack, AuthResponse, ChatEvent, Conversation, HistoryPage, LoginRequest, Message, NewMessage,
    RegisterRequest, User,
};
use chatsync_core::sync::ChatState;
use chatsync_core::Session;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Default)]
struct QuietApi {
    unauthorized: AtomicBool,
    logouts: AtomicUsize,
}

impl QuietApi {
    fn check(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::SeqCst) {
            Err(ChatError::Session)
        } else {
            Ok(())
        }
    }
}

fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        username: id.to_string(),
        email: String::new(),
        avatar: None,
        is_online: true,
        last_seen: None,
    }
}

#[async_trait]
impl ChatApi for QuietApi {
    async fn login(&self, _req: &LoginRequest) -> Result<AuthResponse> {
        Err(ChatError::Closed)
    }

    async fn register(&self, _req: &RegisterRequest) -> Result<AuthResponse> {
        Err(ChatError::Closed)
    }

    async fn logout(&self) -> Result<Ack> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(Ack {
            message: "Logged out".to_string(),
        })
    }

    async fn current_user(&self) -> Result<User> {
        Ok(user("me"))
    }

    async fn users(&self) -> Result<Vec<User>> {
        Ok(vec![user("u2")])
    }

    async fn send_message(&self, _msg: &NewMessage) -> Result<Message> {
        Err(ChatError::Closed)
    }

    async fn conversation(&self, _peer_id: &str, page: u32, _limit: u32) -> Result<HistoryPage> {
        self.check()?;
        Ok(HistoryPage {
            messages: Vec::new(),
            page,
            has_more: false,
        })
    }

    async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn mark_read(&self, _peer_id: &str) -> Result<Ack> {
        self.check()?;
        Ok(Ack {
            message: "ok".to_string(),
        })
    }
}

/// Accepts one client, reports its frames and pushes `outbound` to it
async fn push_server() -> (
    String,
    mpsc::UnboundedReceiver<Value>,
    mpsc::UnboundedSender<Value>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let (outbound, mut out_rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut sink, mut stream) = accept_async(stream).await.unwrap().split();
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = seen_tx.send(serde_json::from_str::<Value>(text.as_str()).unwrap());
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                out = out_rx.recv() => match out {
                    Some(envelope) => {
                        if sink.send(WsMessage::Text(envelope.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    (format!("ws://{}", addr), seen, outbound)
}

fn config(socket_url: &str) -> ClientConfig {
    ClientConfig {
        socket_url: Some(socket_url.to_string()),
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

async fn wait_until<F>(session: &Session, check: F) -> ChatState
where
    F: Fn(&ChatState) -> bool,
{
    let mut state = session.sync().state();
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let current = state.borrow_and_update();
                if check(&current) {
                    return current.clone();
                }
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("state never reached the expected shape")
}

#[tokio::test]
async fn test_live_message_reaches_active_conversation() {
    let (url, mut seen, outbound) = push_server().await;
    let api = Arc::new(QuietApi::default());
    let session = Session::start(&config(&url), api.clone(), user("me"))
        .await
        .unwrap();

    let join = timeout(Duration::from_secs(2), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(join, json!({"event": "join", "data": {"sessionId": "me"}}));

    let mut events = session.sync().subscribe();
    session
        .sync()
        .set_active_conversation(Some("u2".to_string()))
        .unwrap();
    session.sync().snapshot().await.unwrap();

    outbound
        .send(json!({
            "event": "receiveMessage",
            "data": {"_id": "m1", "sender": "u2", "recipient": "me", "content": "hi"}
        }))
        .unwrap();
    outbound
        .send(json!({"event": "userOnline", "data": ["u2"]}))
        .unwrap();

    let state = wait_until(&session, |s| !s.messages.is_empty() && s.is_online("u2")).await;
    assert!(state.connected);
    assert_eq!(state.messages[0].content, "hi");
    assert!(matches!(
        events.recv().await.unwrap(),
        ChatEvent::NewMessage { .. }
    ));

    let transport = session.transport().clone();
    session.logout().await.unwrap();
    assert_eq!(api.logouts.load(Ordering::SeqCst), 1);
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_typing_from_peer_is_visible_then_expires() {
    let (url, _seen, outbound) = push_server().await;
    let api = Arc::new(QuietApi::default());
    let mut cfg = config(&url);
    cfg.typing_timeout = Duration::from_millis(200);
    let session = Session::start(&cfg, api, user("me")).await.unwrap();

    outbound
        .send(json!({"event": "userTyping", "data": {"sender": "u2", "isTyping": true}}))
        .unwrap();
    wait_until(&session, |s| s.is_typing("u2")).await;
    wait_until(&session, |s| !s.is_typing("u2")).await;
}

#[tokio::test]
async fn test_session_without_push_channel_still_starts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = Arc::new(QuietApi::default());
    let session = Session::start(&config(&format!("ws://{}", addr)), api, user("me"))
        .await
        .unwrap();
    assert!(!session.transport().is_connected());
    let state = session.sync().snapshot().await.unwrap();
    assert!(!state.connected);
}

#[tokio::test]
async fn test_expired_token_closes_session() {
    let (url, _seen, _outbound) = push_server().await;
    let api = Arc::new(QuietApi::default());
    api.unauthorized.store(true, Ordering::SeqCst);

    let mut session = Session::start(&config(&url), api, user("me")).await.unwrap();
    let transport = session.transport().clone();
    timeout(Duration::from_secs(2), session.closed())
        .await
        .expect("session did not close");
    assert!(session.sync().is_closed());
    assert!(!transport.is_connected());
}
