use super::media::LocalMedia;
use super::worker::PeerWorker;
use crate::config::SessionConfig;
use crate::events::{EventBus, SessionEvent};
use crate::quality::QualitySettings;
use crate::room::{Participant, RoomRegistry};
use crate::signaling::SignalingChannel;
use crate::types::{ParticipantId, ParticipantRole, PeerState, RoomId};
use crate::utils::{Error, Result, RetryPolicy};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

const APPLY_SETTINGS_TIMEOUT: Duration = Duration::from_secs(5);

/// One entry of a participant's FIFO event queue. Processed strictly in
/// arrival order by that participant's worker; queues of different
/// participants are independent.
pub(crate) enum PeerCommand {
    RemoteJoined,
    OfferReceived(String),
    AnswerReceived(String),
    CandidateReceived(RTCIceCandidateInit),
    /// Transport signals carry the connection generation they were observed
    /// on, so callbacks of an already-recycled connection are ignored.
    TransportUp(u64),
    TransportDegraded(u64),
    TransportDown(u64),
    /// Scheduled reconnect attempt. Delivered through the queue rather than
    /// slept inline, so a departure queued during the delay is processed
    /// first.
    RetryConnect(u64),
    ApplySettings(QualitySettings, oneshot::Sender<Result<()>>),
    ReplaceVideoTrack(Option<Arc<dyn TrackLocal + Send + Sync>>),
    Left,
}

/// State shared between a worker and its readers (orchestrator, monitor).
pub struct PeerShared {
    pub participant_id: ParticipantId,
    pub state: parking_lot::Mutex<PeerState>,
    pub connection: Mutex<Option<Arc<RTCPeerConnection>>>,
}

pub(crate) struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
    shared: Arc<PeerShared>,
}

/// Deterministic glare avoidance: for any pair exactly one side offers, and
/// both compute the decision without coordinating. The therapist always
/// initiates; between equal roles the lexicographically lower id does.
pub fn is_offer_initiator(local: &Participant, remote: &Participant) -> bool {
    let local_therapist = local.role == ParticipantRole::Therapist;
    let remote_therapist = remote.role == ParticipantRole::Therapist;
    match (local_therapist, remote_therapist) {
        (true, false) => true,
        (false, true) => false,
        _ => local.id < remote.id,
    }
}

/// Owns one negotiation worker per remote participant: creates and recycles
/// the underlying peer connections, drives offer/answer/ICE exchange and
/// applies quality setting changes. Holds no registry state of its own; the
/// participant it negotiates for is looked up by id.
pub struct PeerOrchestrator {
    local: Participant,
    room_id: RoomId,
    channel: Arc<SignalingChannel>,
    registry: Arc<RoomRegistry>,
    events: EventBus,
    media: Arc<Mutex<LocalMedia>>,
    ice_servers: Vec<RTCIceServer>,
    retry_policy: RetryPolicy,
    peers: RwLock<HashMap<ParticipantId, PeerHandle>>,
}

impl PeerOrchestrator {
    pub fn new(
        local: Participant,
        room_id: RoomId,
        channel: Arc<SignalingChannel>,
        registry: Arc<RoomRegistry>,
        events: EventBus,
        media: Arc<Mutex<LocalMedia>>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            local,
            room_id,
            channel,
            registry,
            events,
            media,
            ice_servers: build_ice_servers(config),
            retry_policy: RetryPolicy::fixed(
                config.peer_retry_max_attempts,
                config.peer_retry_delay,
            ),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    /// Start negotiating with a freshly joined remote participant.
    pub async fn handle_remote_joined(&self, remote: Participant) {
        self.ensure_peer(remote).await;
    }

    /// Route a signaling payload into the participant's FIFO queue. Offers
    /// from a participant without a worker yet (we saw their offer before
    /// processing their join) spin one up on the spot.
    pub async fn handle_offer(&self, from: &ParticipantId, sdp: String) {
        if !self.dispatch(from, PeerCommand::OfferReceived(sdp.clone())).await {
            match self.registry.participant(from).await {
                Some(remote) => {
                    let tx = self.spawn_worker(remote).await;
                    let _ = tx.send(PeerCommand::OfferReceived(sdp));
                }
                None => warn!("offer from unknown participant {}", from),
            }
        }
    }

    pub async fn handle_answer(&self, from: &ParticipantId, sdp: String) {
        if !self.dispatch(from, PeerCommand::AnswerReceived(sdp)).await {
            warn!("answer from participant {} with no negotiation", from);
        }
    }

    pub async fn handle_candidate(&self, from: &ParticipantId, candidate: RTCIceCandidateInit) {
        if !self
            .dispatch(from, PeerCommand::CandidateReceived(candidate))
            .await
        {
            debug!("dropping ICE candidate from unknown participant {}", from);
        }
    }

    /// Tear down a departed participant's connection. Idempotent: the second
    /// call for the same id finds no worker and does nothing.
    pub async fn handle_remote_left(&self, id: &ParticipantId) {
        let handle = self.peers.write().await.remove(id);
        match handle {
            Some(handle) => {
                let _ = handle.tx.send(PeerCommand::Left);
            }
            None => debug!("leave for participant {} with no worker", id),
        }
    }

    /// Apply a quality setting change to one participant's connection and
    /// wait for the outcome.
    pub async fn apply_settings(
        &self,
        id: &ParticipantId,
        settings: QualitySettings,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if !self
            .dispatch(id, PeerCommand::ApplySettings(settings, tx))
            .await
        {
            return Err(Error::Peer(format!("no active connection for {}", id)));
        }
        match tokio::time::timeout(APPLY_SETTINGS_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Peer(format!("worker for {} went away", id))),
            Err(_) => Err(Error::Timeout(format!(
                "applying settings to {} took longer than {:?}",
                id, APPLY_SETTINGS_TIMEOUT
            ))),
        }
    }

    /// Swap the outgoing video track on every active connection.
    pub async fn set_screen_share(&self, active: bool) -> Result<()> {
        let track = {
            let mut media = self.media.lock().await;
            if active == media.is_screen_sharing() {
                return Ok(());
            }
            if active {
                Some(media.start_screen_share())
            } else {
                media.stop_screen_share()
            }
        };

        for handle in self.peers.read().await.values() {
            let _ = handle.tx.send(PeerCommand::ReplaceVideoTrack(track.clone()));
        }

        self.registry
            .set_screen_sharing(&self.local.id, active)
            .await;
        let event = if active {
            SessionEvent::ScreenShareStarted {
                participant_id: self.local.id.clone(),
            }
        } else {
            SessionEvent::ScreenShareStopped {
                participant_id: self.local.id.clone(),
            }
        };
        self.events.publish(event);
        info!(
            "screen share {}",
            if active { "started" } else { "stopped" }
        );
        Ok(())
    }

    pub async fn peer_state(&self, id: &ParticipantId) -> Option<PeerState> {
        self.peers
            .read()
            .await
            .get(id)
            .map(|handle| *handle.shared.state.lock())
    }

    /// Connections worth sampling: a live transport exists and the peer has
    /// not reached a terminal state.
    pub async fn active_connections(&self) -> Vec<(ParticipantId, Arc<RTCPeerConnection>)> {
        let peers = self.peers.read().await;
        let mut connections = Vec::with_capacity(peers.len());
        for (id, handle) in peers.iter() {
            if handle.shared.state.lock().is_terminal() {
                continue;
            }
            if let Some(pc) = handle.shared.connection.lock().await.clone() {
                connections.push((id.clone(), pc));
            }
        }
        connections
    }

    /// Release every worker. Used on local leave; safe to call twice.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.peers.write().await.drain().collect();
        for (id, handle) in handles {
            debug!("closing peer worker for {}", id);
            let _ = handle.tx.send(PeerCommand::Left);
        }
    }

    async fn ensure_peer(&self, remote: Participant) {
        if self.peers.read().await.contains_key(&remote.id) {
            debug!("worker for {} already running", remote.id);
            return;
        }
        let tx = self.spawn_worker(remote).await;
        let _ = tx.send(PeerCommand::RemoteJoined);
    }

    async fn spawn_worker(&self, remote: Participant) -> mpsc::UnboundedSender<PeerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared {
            participant_id: remote.id.clone(),
            state: parking_lot::Mutex::new(PeerState::Absent),
            connection: Mutex::new(None),
        });

        let worker = PeerWorker::new(
            self.local.clone(),
            remote.clone(),
            self.room_id.clone(),
            self.channel.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.media.clone(),
            self.ice_servers.clone(),
            self.retry_policy,
            shared.clone(),
            tx.clone(),
        );
        tokio::spawn(worker.run(rx));

        self.peers.write().await.insert(
            remote.id.clone(),
            PeerHandle {
                tx: tx.clone(),
                shared,
            },
        );
        metrics::counter!("rtc_peer_workers_started", 1);
        tx
    }

    async fn dispatch(&self, id: &ParticipantId, command: PeerCommand) -> bool {
        match self.peers.read().await.get(id) {
            Some(handle) => handle.tx.send(command).is_ok(),
            None => false,
        }
    }
}

fn build_ice_servers(config: &SessionConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![RTCIceServer {
        urls: vec![format!("stun:{}:{}", config.stun_server, config.stun_port)],
        ..Default::default()
    }];
    if !config.turn_server.is_empty() {
        servers.push(RTCIceServer {
            urls: vec![format!("turn:{}:{}", config.turn_server, config.turn_port)],
            username: config.turn_username.clone(),
            credential: config.turn_password.clone(),
            credential_type: RTCIceCredentialType::Password,
            ..Default::default()
        });
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str, role: ParticipantRole) -> Participant {
        Participant::new(id.to_string(), id.to_string(), role)
    }

    #[test]
    fn therapist_initiates_regardless_of_join_order() {
        let therapist = participant("zz-therapist", ParticipantRole::Therapist);
        let client = participant("aa-client", ParticipantRole::Client);

        assert!(is_offer_initiator(&therapist, &client));
        assert!(!is_offer_initiator(&client, &therapist));
    }

    #[test]
    fn equal_roles_fall_back_to_lower_id() {
        let a = participant("alpha", ParticipantRole::Client);
        let b = participant("beta", ParticipantRole::Client);

        assert!(is_offer_initiator(&a, &b));
        assert!(!is_offer_initiator(&b, &a));
    }

    #[test]
    fn exactly_one_side_initiates_for_any_pair() {
        let roles = [
            ParticipantRole::Therapist,
            ParticipantRole::Client,
            ParticipantRole::Guardian,
        ];
        for role_a in roles {
            for role_b in roles {
                let a = participant("p-a", role_a);
                let b = participant("p-b", role_b);
                let a_initiates = is_offer_initiator(&a, &b);
                let b_initiates = is_offer_initiator(&b, &a);
                assert_ne!(
                    a_initiates, b_initiates,
                    "glare with roles {:?}/{:?}",
                    role_a, role_b
                );
            }
        }
    }
}
