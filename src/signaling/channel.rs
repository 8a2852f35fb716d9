use super::messages::SignalingMessage;
use crate::events::{EventBus, SessionEvent};
use crate::utils::{Error, Result, RetryPolicy, RetryState};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<SignalingMessage>>>>>;

enum PumpExit {
    Shutdown,
    Disconnected,
}

/// Persistent bidirectional transport to the signaling server.
///
/// Outgoing messages go through an unbounded queue drained by the connection
/// task; round trips are matched to acks by request id. While the socket is
/// down every send fails immediately and the task reconnects with a bounded
/// backoff, so callers never wait on a severed channel.
pub struct SignalingChannel {
    outbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    request_timeout: Duration,
}

impl SignalingChannel {
    /// Connect to the signaling server. Incoming server-pushed messages are
    /// forwarded to `inbound` in arrival order.
    pub async fn connect(
        url: String,
        inbound: mpsc::UnboundedSender<SignalingMessage>,
        events: EventBus,
        retry_policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self> {
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| Error::Channel(format!("connect to {} failed: {}", url, e)))?;
        info!("signaling channel connected to {}", url);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::run(
            ws,
            url,
            outbound_rx,
            inbound,
            pending.clone(),
            connected.clone(),
            events,
            retry_policy,
            shutdown_rx,
        ));

        Ok(Self {
            outbound_tx,
            pending,
            connected,
            shutdown_tx,
            request_timeout,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fire-and-forget send. Fails immediately while the channel is down.
    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Channel("signaling channel is disconnected".to_string()));
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| Error::Channel("signaling channel is closed".to_string()))
    }

    /// Send a message that expects a server acknowledgement and wait for it,
    /// bounded by the configured request timeout.
    pub async fn request(&self, message: SignalingMessage) -> Result<SignalingMessage> {
        let request_id = message
            .request_id()
            .ok_or_else(|| Error::Channel("message carries no request id".to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send(message) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Channel(
                "signaling channel dropped before acknowledgement".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(Error::Timeout(format!(
                    "no acknowledgement for request {} within {:?}",
                    request_id, self.request_timeout
                )))
            }
        }
    }

    /// Stop the connection task. Pending round trips are failed, not leaked.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        mut ws: WsStream,
        url: String,
        mut outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
        inbound: mpsc::UnboundedSender<SignalingMessage>,
        pending: PendingMap,
        connected: Arc<AtomicBool>,
        events: EventBus,
        retry_policy: RetryPolicy,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            connected.store(true, Ordering::SeqCst);
            events.publish(SessionEvent::ChannelUp);

            let exit = Self::pump(&mut ws, &mut outbound_rx, &inbound, &pending, &mut shutdown_rx)
                .await;

            connected.store(false, Ordering::SeqCst);
            Self::fail_pending(&pending, "signaling channel disconnected");

            match exit {
                PumpExit::Shutdown => {
                    debug!("signaling channel shut down");
                    let _ = ws.close(None).await;
                    return;
                }
                PumpExit::Disconnected => {
                    warn!("signaling channel to {} lost, reconnecting", url);
                    events.publish(SessionEvent::ChannelDown);
                }
            }

            let mut retry = RetryState::new();
            ws = loop {
                let delay = match retry.next_delay(&retry_policy) {
                    Some(delay) => delay,
                    None => {
                        error!(
                            "giving up on signaling channel to {} after {} attempts",
                            url,
                            retry.attempts()
                        );
                        return;
                    }
                };
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
                match connect_async(&url).await {
                    Ok((ws, _)) => {
                        info!("signaling channel reconnected to {}", url);
                        break ws;
                    }
                    Err(e) => warn!(
                        "signaling reconnect attempt {} failed: {}",
                        retry.attempts(),
                        e
                    ),
                }
            };
        }
    }

    /// Drive one live socket until it drops or shutdown is requested.
    async fn pump(
        ws: &mut WsStream,
        outbound_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
        inbound: &mpsc::UnboundedSender<SignalingMessage>,
        pending: &PendingMap,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => {
                    let Some(message) = outgoing else {
                        return PumpExit::Shutdown;
                    };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to serialize signaling message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws.send(Message::Text(json)).await {
                        warn!("signaling send failed: {}", e);
                        return PumpExit::Disconnected;
                    }
                }
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_incoming(&text, inbound, pending);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws.send(Message::Pong(payload)).await.is_err() {
                                return PumpExit::Disconnected;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return PumpExit::Disconnected;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("signaling receive failed: {}", e);
                            return PumpExit::Disconnected;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return PumpExit::Shutdown;
                    }
                }
            }
        }
    }

    fn handle_incoming(
        text: &str,
        inbound: &mpsc::UnboundedSender<SignalingMessage>,
        pending: &PendingMap,
    ) {
        let message: SignalingMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping malformed signaling message: {}", e);
                return;
            }
        };

        if let Some(request_id) = message.completes_request() {
            let waiter = pending.lock().remove(&request_id);
            match waiter {
                Some(tx) => {
                    let result = match &message {
                        SignalingMessage::Error { message, .. } => {
                            Err(Error::Channel(message.clone()))
                        }
                        _ => Ok(message),
                    };
                    let _ = tx.send(result);
                }
                None => debug!("acknowledgement for unknown request {}", request_id),
            }
            return;
        }

        if inbound.send(message).is_err() {
            debug!("inbound dispatch queue closed, dropping message");
        }
    }

    fn fail_pending(pending: &PendingMap, reason: &str) {
        let waiters: Vec<_> = pending.lock().drain().collect();
        for (request_id, tx) in waiters {
            debug!("failing pending request {}: {}", request_id, reason);
            let _ = tx.send(Err(Error::Channel(reason.to_string())));
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{Participant, Room};
    use crate::types::{ParticipantRole, SessionType};
    use chrono::Utc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn test_room() -> Room {
        Room {
            id: "room-1".to_string(),
            name: "session".to_string(),
            session_type: SessionType::Individual,
            max_participants: 2,
            recording_enabled: false,
            started_at: Utc::now(),
            ended_at: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Minimal signaling server: acks join requests, then pushes one
    /// user-joined event.
    async fn spawn_ack_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let msg: SignalingMessage = serde_json::from_str(&text).unwrap();
                if let SignalingMessage::JoinRoom { request_id, .. } = msg {
                    let ack = SignalingMessage::Ack {
                        request_id,
                        room: Some(test_room()),
                        participants: vec![],
                        timestamp: Utc::now(),
                    };
                    ws.send(Message::Text(serde_json::to_string(&ack).unwrap()))
                        .await
                        .unwrap();

                    let pushed = SignalingMessage::UserJoined {
                        room_id: "room-1".to_string(),
                        participant: Participant::new(
                            "remote".to_string(),
                            "Remote".to_string(),
                            ParticipantRole::Client,
                        ),
                        timestamp: Utc::now(),
                    };
                    ws.send(Message::Text(serde_json::to_string(&pushed).unwrap()))
                        .await
                        .unwrap();
                }
            }
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn join_request_resolves_on_ack_and_events_are_forwarded() {
        let _ = env_logger::builder().is_test(true).try_init();
        let url = spawn_ack_server().await;
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(
            url,
            inbound_tx,
            EventBus::new(),
            RetryPolicy::exponential(2, Duration::from_millis(50)),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let join = SignalingMessage::JoinRoom {
            request_id: Uuid::new_v4(),
            room_id: "room-1".to_string(),
            user_id: "me".to_string(),
            participant: Participant::new(
                "me".to_string(),
                "Me".to_string(),
                ParticipantRole::Therapist,
            ),
            timestamp: Utc::now(),
        };

        match channel.request(join).await.unwrap() {
            SignalingMessage::Ack { room, .. } => {
                assert_eq!(room.unwrap().id, "room-1");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match inbound_rx.recv().await.unwrap() {
            SignalingMessage::UserJoined { participant, .. } => {
                assert_eq!(participant.id, "remote");
            }
            other => panic!("unexpected inbound message: {:?}", other),
        }

        channel.close();
    }

    #[tokio::test]
    async fn request_times_out_without_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Swallow everything, never ack.
            while ws.next().await.is_some() {}
        });

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(
            format!("ws://{}", addr),
            inbound_tx,
            EventBus::new(),
            RetryPolicy::exponential(1, Duration::from_millis(50)),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        let join = SignalingMessage::LeaveRoom {
            request_id: Uuid::new_v4(),
            room_id: "room-1".to_string(),
            user_id: "me".to_string(),
            timestamp: Utc::now(),
        };
        match channel.request(join).await {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
        channel.close();
    }
}
