use crate::config::SessionConfig;
use crate::events::{EventBus, SessionEvent};
use crate::peer::{LocalMedia, PeerOrchestrator};
use crate::quality::{AdaptiveQualityController, CallQualityMetrics, NetworkQualityMonitor};
use crate::room::{Participant, Room, RoomRegistry, RoomService, RoomSpec};
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::types::{ParticipantId, PeerState, RoomId};
use crate::utils::{Error, Result, RetryPolicy};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use uuid::Uuid;

/// One live room session: the explicit context object that owns the
/// signaling channel, registry, orchestrator and quality loop. Constructed
/// once at session start and dropped when the room is left; there is no
/// process-global state.
pub struct RtcSession {
    local: Participant,
    room_id: RoomId,
    registry: Arc<RoomRegistry>,
    channel: Arc<SignalingChannel>,
    orchestrator: Arc<PeerOrchestrator>,
    controller: Arc<AdaptiveQualityController>,
    events: EventBus,
    service: Arc<dyn RoomService>,
    shutdown_tx: watch::Sender<bool>,
    left: AtomicBool,
}

impl RtcSession {
    /// Create a room through the application's room service, then join it.
    pub async fn create(
        config: SessionConfig,
        local: Participant,
        spec: RoomSpec,
        service: Arc<dyn RoomService>,
    ) -> Result<Self> {
        let room = service.create_room(&spec).await?;
        info!("created room {} ({})", room.id, room.name);
        Self::start(config, local, room.id, service).await
    }

    /// Join an existing room.
    pub async fn join(
        config: SessionConfig,
        local: Participant,
        room_id: RoomId,
        service: Arc<dyn RoomService>,
    ) -> Result<Self> {
        let room = service.join_room(&room_id, &local.id).await?;
        Self::start(config, local, room.id, service).await
    }

    async fn start(
        config: SessionConfig,
        local: Participant,
        room_id: RoomId,
        service: Arc<dyn RoomService>,
    ) -> Result<Self> {
        let events = EventBus::new();
        let registry = Arc::new(RoomRegistry::new(local.id.clone()));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(
            SignalingChannel::connect(
                config.signaling_url.clone(),
                inbound_tx,
                events.clone(),
                RetryPolicy::exponential(
                    config.channel_retry_max_attempts,
                    config.channel_retry_base_delay,
                ),
                config.request_timeout,
            )
            .await?,
        );

        // Announce ourselves; the ack carries the authoritative room state
        // and current roster.
        let ack = channel
            .request(SignalingMessage::JoinRoom {
                request_id: Uuid::new_v4(),
                room_id: room_id.clone(),
                user_id: local.id.clone(),
                participant: local.clone(),
                timestamp: Utc::now(),
            })
            .await?;
        let (room, roster) = match ack {
            SignalingMessage::Ack {
                room: Some(room),
                participants,
                ..
            } => (room, participants),
            _ => {
                return Err(Error::Channel(
                    "join acknowledged without room state".to_string(),
                ))
            }
        };
        info!("joined room {} as {}", room.id, local.id);
        registry.set_room(room, roster).await;

        // Capture failure leaves us receive-only instead of killing the
        // session.
        let media = match LocalMedia::acquire(local.audio_enabled, local.video_enabled) {
            Ok(media) => media,
            Err(e) => {
                warn!("local media unavailable, joining receive-only: {}", e);
                LocalMedia::disabled()
            }
        };

        let orchestrator = Arc::new(PeerOrchestrator::new(
            local.clone(),
            room_id.clone(),
            channel.clone(),
            registry.clone(),
            events.clone(),
            Arc::new(Mutex::new(media)),
            &config,
        ));

        // Negotiate with everyone already in the room.
        for remote in registry.remote_participants().await {
            orchestrator.handle_remote_joined(remote).await;
        }

        let controller = Arc::new(AdaptiveQualityController::new(
            orchestrator.clone(),
            events.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        NetworkQualityMonitor::new(
            orchestrator.clone(),
            controller.clone(),
            config.monitor_interval,
        )
        .spawn(shutdown_rx.clone());

        tokio::spawn(dispatch_loop(
            inbound_rx,
            registry.clone(),
            orchestrator.clone(),
            controller.clone(),
            events.clone(),
            local.id.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            local,
            room_id,
            registry,
            channel,
            orchestrator,
            controller,
            events,
            service,
            shutdown_tx,
            left: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn room(&self) -> Option<Room> {
        self.registry.room().await
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.registry.participants().await
    }

    pub async fn peer_state(&self, id: &ParticipantId) -> Option<PeerState> {
        self.orchestrator.peer_state(id).await
    }

    pub fn quality_metrics(&self, id: &ParticipantId) -> Option<CallQualityMetrics> {
        self.controller.metrics_for(id)
    }

    pub fn is_signaling_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.orchestrator.set_screen_share(true).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.orchestrator.set_screen_share(false).await
    }

    /// Leave the room and release everything: monitor sampling, peer
    /// connections and the signaling channel. Idempotent; the second call is
    /// a no-op.
    pub async fn leave(&self) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            debug!("leave called twice, ignoring");
            return Ok(());
        }
        info!("leaving room {}", self.room_id);

        // Stop sampling and dispatching before tearing connections down.
        let _ = self.shutdown_tx.send(true);

        let notify_result = self
            .channel
            .request(SignalingMessage::LeaveRoom {
                request_id: Uuid::new_v4(),
                room_id: self.room_id.clone(),
                user_id: self.local.id.clone(),
                timestamp: Utc::now(),
            })
            .await;
        if let Err(e) = &notify_result {
            warn!("leave-room signaling failed: {}", e);
        }

        self.orchestrator.shutdown().await;
        self.registry.clear().await;
        self.channel.close();

        self.service
            .leave_room(&self.room_id, &self.local.id)
            .await?;
        Ok(())
    }

    /// Organizer action: end the session for everyone, then leave locally.
    pub async fn end_session(&self) -> Result<()> {
        self.service.end_session(&self.room_id).await?;
        self.leave().await
    }
}

/// Single writer of the registry: applies every server-pushed event, then
/// publishes it, then routes negotiation payloads to the orchestrator's
/// per-participant queues.
async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    registry: Arc<RoomRegistry>,
    orchestrator: Arc<PeerOrchestrator>,
    controller: Arc<AdaptiveQualityController>,
    events: EventBus,
    local_id: ParticipantId,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            message = inbound.recv() => {
                let Some(message) = message else { break };
                message
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        match message {
            SignalingMessage::UserJoined { participant, .. } => {
                if participant.id == local_id {
                    continue;
                }
                match registry.apply_user_joined(participant).await {
                    Ok(Some(participant)) => {
                        events.publish(SessionEvent::ParticipantJoined(participant.clone()));
                        orchestrator.handle_remote_joined(participant).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("rejected participant join: {}", e),
                }
            }
            SignalingMessage::UserLeft { user_id, .. } => {
                // Registry idempotence guarantees a duplicate leave emits no
                // second transition and frees nothing twice.
                if registry.apply_user_left(&user_id).await {
                    orchestrator.handle_remote_left(&user_id).await;
                    controller.remove_participant(&user_id);
                    events.publish(SessionEvent::ParticipantLeft {
                        participant_id: user_id,
                    });
                }
            }
            SignalingMessage::RoomUpdated { room, .. } => {
                registry.apply_room_updated(room.clone()).await;
                events.publish(SessionEvent::RoomUpdated(room));
            }
            SignalingMessage::Offer {
                user_id,
                to_user,
                sdp,
                ..
            } => {
                if to_user == local_id {
                    orchestrator.handle_offer(&user_id, sdp).await;
                }
            }
            SignalingMessage::Answer {
                user_id,
                to_user,
                sdp,
                ..
            } => {
                if to_user == local_id {
                    orchestrator.handle_answer(&user_id, sdp).await;
                }
            }
            SignalingMessage::IceCandidate {
                user_id,
                to_user,
                candidate,
                ..
            } => {
                if to_user == local_id {
                    orchestrator
                        .handle_candidate(&user_id, candidate.into())
                        .await;
                }
            }
            other => debug!("unhandled signaling message: {:?}", other),
        }
    }
    debug!("signaling dispatch loop stopped");
}
