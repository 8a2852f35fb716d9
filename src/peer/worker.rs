use super::media::LocalMedia;
use super::orchestrator::{is_offer_initiator, PeerCommand, PeerShared};
use crate::events::{EventBus, SessionEvent};
use crate::quality::QualitySettings;
use crate::room::{Participant, RoomRegistry};
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::types::{PeerState, RoomId};
use crate::utils::{Error, Result, RetryPolicy, RetryState};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Negotiation state machine for a single remote participant.
///
/// Runs on its own task and processes its FIFO queue to completion, one
/// command at a time. All transitions for this participant therefore happen
/// in arrival order; nothing here locks across participants.
pub(crate) struct PeerWorker {
    local: Participant,
    remote: Participant,
    room_id: RoomId,
    channel: Arc<SignalingChannel>,
    registry: Arc<RoomRegistry>,
    events: EventBus,
    media: Arc<Mutex<LocalMedia>>,
    ice_servers: Vec<RTCIceServer>,
    retry_policy: RetryPolicy,
    shared: Arc<PeerShared>,
    self_tx: mpsc::UnboundedSender<PeerCommand>,
    /// Candidates that arrived before the remote description. Applied in
    /// arrival order once it is set, discarded on leave.
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_description_set: bool,
    video_sender: Option<Arc<RTCRtpSender>>,
    retry: RetryState,
    /// Bumped whenever the underlying connection is recycled.
    generation: u64,
}

impl PeerWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: Participant,
        remote: Participant,
        room_id: RoomId,
        channel: Arc<SignalingChannel>,
        registry: Arc<RoomRegistry>,
        events: EventBus,
        media: Arc<Mutex<LocalMedia>>,
        ice_servers: Vec<RTCIceServer>,
        retry_policy: RetryPolicy,
        shared: Arc<PeerShared>,
        self_tx: mpsc::UnboundedSender<PeerCommand>,
    ) -> Self {
        Self {
            local,
            remote,
            room_id,
            channel,
            registry,
            events,
            media,
            ice_servers,
            retry_policy,
            shared,
            self_tx,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            video_sender: None,
            retry: RetryState::new(),
            generation: 0,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PeerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PeerCommand::RemoteJoined => {
                    if let Err(e) = self.start(false).await {
                        warn!("negotiation with {} failed to start: {}", self.remote.id, e);
                        self.recover_transport().await;
                    }
                }
                PeerCommand::OfferReceived(sdp) => {
                    if let Err(e) = self.handle_offer(sdp).await {
                        warn!("offer from {} failed: {}", self.remote.id, e);
                        self.recover_transport().await;
                    }
                }
                PeerCommand::AnswerReceived(sdp) => {
                    if let Err(e) = self.handle_answer(sdp).await {
                        warn!("answer from {} failed: {}", self.remote.id, e);
                        self.recover_transport().await;
                    }
                }
                PeerCommand::CandidateReceived(candidate) => {
                    self.handle_candidate(candidate).await;
                }
                PeerCommand::TransportUp(generation) => {
                    if generation == self.generation {
                        self.retry.reset();
                        self.set_state(PeerState::Connected).await;
                    }
                }
                PeerCommand::TransportDegraded(generation) => {
                    if generation == self.generation {
                        if self.state() == PeerState::Connected {
                            self.set_state(PeerState::Degraded).await;
                        }
                        self.recover_transport().await;
                    }
                }
                PeerCommand::TransportDown(generation) => {
                    if generation == self.generation {
                        self.recover_transport().await;
                    }
                }
                PeerCommand::RetryConnect(generation) => {
                    if generation == self.generation && !self.state().is_terminal() {
                        if let Err(e) = self.start(true).await {
                            warn!("reconnect to {} failed: {}", self.remote.id, e);
                            self.recover_transport().await;
                        }
                    }
                }
                PeerCommand::ApplySettings(settings, ack) => {
                    let _ = ack.send(self.apply_settings(settings).await);
                }
                PeerCommand::ReplaceVideoTrack(track) => {
                    self.replace_video_track(track).await;
                }
                PeerCommand::Left => {
                    self.close_connection().await;
                    self.pending_candidates.clear();
                    self.set_state(PeerState::Closed).await;
                    break;
                }
            }
        }
        debug!("peer worker for {} stopped", self.remote.id);
    }

    fn state(&self) -> PeerState {
        *self.shared.state.lock()
    }

    async fn set_state(&self, state: PeerState) {
        {
            let mut current = self.shared.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.registry
            .set_connection_state(&self.remote.id, state)
            .await;
        self.events.publish(SessionEvent::ConnectionStateChanged {
            participant_id: self.remote.id.clone(),
            state,
        });
    }

    async fn connection(&self) -> Result<Arc<RTCPeerConnection>> {
        self.shared
            .connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Peer(format!("no active connection for {}", self.remote.id)))
    }

    /// First negotiation with this participant. `renegotiate` keeps the
    /// retry budget; a fresh join starts with a clean one.
    async fn start(&mut self, renegotiate: bool) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        if !renegotiate {
            self.retry.reset();
        }
        self.create_connection().await?;
        self.set_state(PeerState::Negotiating).await;
        if is_offer_initiator(&self.local, &self.remote) {
            self.send_offer().await?;
        }
        Ok(())
    }

    async fn create_connection(&mut self) -> Result<()> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        self.generation += 1;
        self.remote_description_set = false;
        self.video_sender = None;
        self.attach_local_media(&pc).await?;
        self.install_callbacks(&pc);

        *self.shared.connection.lock().await = Some(pc);
        debug!(
            "created connection to {} (generation {})",
            self.remote.id, self.generation
        );
        Ok(())
    }

    /// Publish whatever local tracks exist; always negotiate receive
    /// directions so remote media flows even when local capture failed.
    async fn attach_local_media(&mut self, pc: &Arc<RTCPeerConnection>) -> Result<()> {
        let (audio, video) = {
            let media = self.media.lock().await;
            (media.audio_track(), media.video_track())
        };

        match audio {
            Some(track) => {
                let sender = pc.add_track(track).await?;
                drain_rtcp(sender);
            }
            None => {
                pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
                    .await?;
            }
        }
        match video {
            Some(track) => {
                let sender = pc.add_track(track).await?;
                drain_rtcp(sender.clone());
                self.video_sender = Some(sender);
            }
            None => {
                pc.add_transceiver_from_kind(RTPCodecType::Video, None)
                    .await?;
            }
        }
        Ok(())
    }

    fn install_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        let generation = self.generation;
        let tx = self.self_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let command = match state {
                    RTCPeerConnectionState::Connected => Some(PeerCommand::TransportUp(generation)),
                    RTCPeerConnectionState::Disconnected => {
                        Some(PeerCommand::TransportDegraded(generation))
                    }
                    RTCPeerConnectionState::Failed => Some(PeerCommand::TransportDown(generation)),
                    _ => None,
                };
                if let Some(command) = command {
                    let _ = tx.send(command);
                }
            })
        }));

        let channel = self.channel.clone();
        let room_id = self.room_id.clone();
        let local_id = self.local.id.clone();
        let remote_id = self.remote.id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let channel = channel.clone();
            let room_id = room_id.clone();
            let local_id = local_id.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let message = SignalingMessage::IceCandidate {
                            room_id,
                            user_id: local_id,
                            to_user: remote_id.clone(),
                            candidate: init.into(),
                            timestamp: Utc::now(),
                        };
                        if let Err(e) = channel.send(message) {
                            warn!("could not relay ICE candidate to {}: {}", remote_id, e);
                        }
                    }
                    Err(e) => warn!("could not serialize ICE candidate: {}", e),
                }
            })
        }));
    }

    async fn send_offer(&self) -> Result<()> {
        let pc = self.connection().await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        self.channel.send(SignalingMessage::Offer {
            room_id: self.room_id.clone(),
            user_id: self.local.id.clone(),
            to_user: self.remote.id.clone(),
            sdp: offer.sdp,
            timestamp: Utc::now(),
        })?;
        debug!("sent offer to {}", self.remote.id);
        Ok(())
    }

    async fn handle_offer(&mut self, sdp: String) -> Result<()> {
        if self.state().is_terminal() {
            debug!("ignoring offer from closed peer {}", self.remote.id);
            return Ok(());
        }
        if self.shared.connection.lock().await.is_none() {
            self.create_connection().await?;
        }
        self.set_state(PeerState::Negotiating).await;

        let pc = self.connection().await?;
        let offer = RTCSessionDescription::offer(sdp)?;
        pc.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.drain_candidates(&pc).await;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        self.channel.send(SignalingMessage::Answer {
            room_id: self.room_id.clone(),
            user_id: self.local.id.clone(),
            to_user: self.remote.id.clone(),
            sdp: answer.sdp,
            timestamp: Utc::now(),
        })?;
        debug!("answered offer from {}", self.remote.id);
        Ok(())
    }

    async fn handle_answer(&mut self, sdp: String) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let pc = self.connection().await?;
        let answer = RTCSessionDescription::answer(sdp)?;
        pc.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.drain_candidates(&pc).await;
        Ok(())
    }

    async fn handle_candidate(&mut self, candidate: RTCIceCandidateInit) {
        if self.state().is_terminal() {
            return;
        }
        if !self.remote_description_set {
            // Too early to apply; hold on to it rather than dropping it.
            debug!(
                "buffering early ICE candidate from {} ({} pending)",
                self.remote.id,
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push(candidate);
            return;
        }
        match self.connection().await {
            Ok(pc) => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!("could not add ICE candidate from {}: {}", self.remote.id, e);
                }
            }
            Err(_) => self.pending_candidates.push(candidate),
        }
    }

    async fn drain_candidates(&mut self, pc: &Arc<RTCPeerConnection>) {
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!(
                    "could not apply buffered ICE candidate from {}: {}",
                    self.remote.id, e
                );
            }
        }
    }

    /// Close the stale connection and schedule a renegotiation attempt. The
    /// retry arrives as a queued command, never an inline sleep, so anything
    /// already queued for this participant runs before it. When the retry
    /// budget runs out the peer is marked failed rather than retrying
    /// forever.
    async fn recover_transport(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.close_connection().await;

        match self.retry.next_delay(&self.retry_policy) {
            Some(delay) => {
                info!(
                    "recreating connection to {} in {:?} (attempt {}/{})",
                    self.remote.id,
                    delay,
                    self.retry.attempts(),
                    self.retry_policy.max_attempts
                );
                schedule_retry(self.self_tx.clone(), self.generation, delay);
            }
            None => {
                error!(
                    "connection to {} failed permanently after {} attempts",
                    self.remote.id,
                    self.retry.attempts()
                );
                metrics::counter!("rtc_peer_failures", 1);
                self.set_state(PeerState::Failed).await;
            }
        }
    }

    /// Enforce a quality target on this connection. Track presence (video
    /// on/off) is handled here; encoder rate control follows the published
    /// settings on the capture side.
    async fn apply_settings(&mut self, settings: QualitySettings) -> Result<()> {
        let _pc = self.connection().await?;
        if let Some(sender) = &self.video_sender {
            if settings.video.is_off() {
                sender.replace_track(None).await?;
                debug!("muted video to {} (audio-only target)", self.remote.id);
            } else {
                let track = self.media.lock().await.video_track();
                if let Some(track) = track {
                    sender.replace_track(Some(track)).await?;
                }
                debug!(
                    "applied {}x{}@{}fps {}kbps to {}",
                    settings.video.width,
                    settings.video.height,
                    settings.video.frame_rate,
                    settings.video.bitrate_kbps,
                    self.remote.id
                );
            }
        }
        Ok(())
    }

    async fn replace_video_track(&mut self, track: Option<Arc<dyn TrackLocal + Send + Sync>>) {
        let Some(sender) = &self.video_sender else {
            return;
        };
        if let Err(e) = sender.replace_track(track).await {
            warn!(
                "could not swap outgoing video track for {}: {}",
                self.remote.id, e
            );
        }
    }

    async fn close_connection(&mut self) {
        self.remote_description_set = false;
        self.video_sender = None;
        // A closed connection stops firing callbacks; bumping the generation
        // also discards anything already queued from it.
        self.generation += 1;
        let pc = self.shared.connection.lock().await.take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                debug!("closing connection to {}: {}", self.remote.id, e);
            }
        }
    }
}

fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
    });
}

fn schedule_retry(tx: mpsc::UnboundedSender<PeerCommand>, generation: u64, delay: Duration) {
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = tx.send(PeerCommand::RetryConnect(generation));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn departure_queued_during_retry_delay_is_seen_first() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        schedule_retry(tx.clone(), 3, Duration::from_millis(20));
        tx.send(PeerCommand::Left).unwrap();

        assert!(matches!(rx.recv().await, Some(PeerCommand::Left)));
        assert!(matches!(rx.recv().await, Some(PeerCommand::RetryConnect(3))));
    }

    #[tokio::test]
    async fn scheduled_retry_carries_its_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        schedule_retry(tx, 42, Duration::from_millis(1));
        match rx.recv().await {
            Some(PeerCommand::RetryConnect(generation)) => assert_eq!(generation, 42),
            _ => panic!("expected a retry command"),
        }
    }
}
