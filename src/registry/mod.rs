//! Session Registry
//!
//! Tracks connected participants and the pairings between them, and routes
//! signals. Participant and pairing tables sit behind one mutex; fan-out to
//! the per-participant outboxes happens under that lock so that delivery
//! order always equals relay order.

use crate::webrtc::signaling::{ParticipantId, ServerMessage, SignalEnvelope};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tokio::sync::mpsc;

/// Outbound queue feeding one participant's socket writer
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// How signals are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPolicy {
    /// Only to the sender's pairing partner
    #[default]
    Paired,
    /// To every other connected participant
    Broadcast,
}

impl RelayPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayPolicy::Paired => "paired",
            RelayPolicy::Broadcast => "broadcast",
        }
    }
}

impl FromStr for RelayPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paired" => Ok(RelayPolicy::Paired),
            "broadcast" => Ok(RelayPolicy::Broadcast),
            other => Err(format!("unknown relay policy: {}", other)),
        }
    }
}

/// One connected endpoint
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub pairing: Option<String>,
    /// Cleared once the outbox is found closed
    pub open: bool,
    pub connected_at: Instant,
    outbox: Outbox,
}

/// Two participants exchanging signals
#[derive(Debug, Clone)]
pub struct Pairing {
    pub id: String,
    pub members: [ParticipantId; 2],
    pub created_at: Instant,
}

impl Pairing {
    pub fn partner_of(&self, id: &ParticipantId) -> Option<&ParticipantId> {
        match &self.members {
            [a, b] if a == id => Some(b),
            [a, b] if b == id => Some(a),
            _ => None,
        }
    }
}

/// Why a relayed signal reached nobody
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownSender,
    NoPeer,
    AmbiguousTarget,
    RecipientGone,
}

/// Result of one relay attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered(Vec<ParticipantId>),
    Dropped(DropReason),
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Participant cap reached
    Full(usize),
    UnknownParticipant(ParticipantId),
    /// Requested peer is missing or already paired
    PeerUnavailable(ParticipantId),
    AlreadyPaired(ParticipantId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Full(max) => write!(f, "Relay is full ({} participants)", max),
            RegistryError::UnknownParticipant(id) => write!(f, "Unknown participant: {}", id),
            RegistryError::PeerUnavailable(id) => write!(f, "Peer unavailable: {}", id),
            RegistryError::AlreadyPaired(id) => write!(f, "Participant already paired: {}", id),
        }
    }
}

impl Error for RegistryError {}

#[derive(Default)]
struct RegistryInner {
    participants: HashMap<ParticipantId, Participant>,
    pairings: HashMap<String, Pairing>,
}

impl RegistryInner {
    /// Queue a message for `to`; marks the participant closed when its
    /// socket writer is gone
    fn deliver(&mut self, to: &ParticipantId, message: ServerMessage) -> bool {
        let Some(participant) = self.participants.get_mut(to) else {
            return false;
        };
        if !participant.open {
            return false;
        }
        if participant.outbox.send(message).is_err() {
            debug!("Outbox of {} closed, marking participant closed", to);
            participant.open = false;
            return false;
        }
        true
    }

    fn partner_of(&self, id: &ParticipantId) -> Option<ParticipantId> {
        let pairing_id = self.participants.get(id)?.pairing.as_ref()?;
        self.pairings.get(pairing_id)?.partner_of(id).cloned()
    }

    fn pair(&mut self, a: &ParticipantId, b: &ParticipantId) -> String {
        let pairing = Pairing {
            id: uuid::Uuid::new_v4().to_string(),
            members: [a.clone(), b.clone()],
            created_at: Instant::now(),
        };
        let pairing_id = pairing.id.clone();
        for member in [a, b] {
            if let Some(participant) = self.participants.get_mut(member) {
                participant.pairing = Some(pairing_id.clone());
            }
        }
        self.pairings.insert(pairing_id.clone(), pairing);
        self.deliver(a, ServerMessage::Paired { peer_id: b.clone() });
        self.deliver(b, ServerMessage::Paired { peer_id: a.clone() });
        info!("Paired {} with {} (pairing {})", a, b, pairing_id);
        pairing_id
    }

    /// Remove `id`'s pairing and tell the partner
    fn dissolve(&mut self, id: &ParticipantId) -> Option<ParticipantId> {
        let pairing_id = self.participants.get_mut(id)?.pairing.take()?;
        let pairing = self.pairings.remove(&pairing_id)?;
        let partner = pairing.partner_of(id)?.clone();
        if let Some(participant) = self.participants.get_mut(&partner) {
            participant.pairing = None;
        }
        self.deliver(
            &partner,
            ServerMessage::PeerLeft {
                participant_id: id.clone(),
            },
        );
        info!("Pairing {} dissolved, {} left {}", pairing_id, id, partner);
        Some(partner)
    }

    fn unpaired_others(&self, id: &ParticipantId) -> Vec<ParticipantId> {
        self.participants
            .values()
            .filter(|p| &p.id != id && p.open && p.pairing.is_none())
            .map(|p| p.id.clone())
            .collect()
    }

    fn relay_paired(&mut self, from: &ParticipantId, signal: SignalEnvelope) -> RelayOutcome {
        let partner = match self.partner_of(from) {
            Some(partner) => partner,
            None => {
                let candidates = self.unpaired_others(from);
                match candidates.as_slice() {
                    [] => return RelayOutcome::Dropped(DropReason::NoPeer),
                    [only] => {
                        let only = only.clone();
                        self.pair(from, &only);
                        only
                    }
                    _ => {
                        warn!(
                            "{} from {} is ambiguous: {} unpaired participants",
                            signal.kind(),
                            from,
                            candidates.len()
                        );
                        self.deliver(
                            from,
                            ServerMessage::error(
                                "AMBIGUOUS_TARGET",
                                "More than one participant is waiting; send a join to pick one",
                            ),
                        );
                        return RelayOutcome::Dropped(DropReason::AmbiguousTarget);
                    }
                }
            }
        };

        let message = ServerMessage::Signal {
            from: from.clone(),
            signal,
        };
        if self.deliver(&partner, message) {
            RelayOutcome::Delivered(vec![partner])
        } else {
            RelayOutcome::Dropped(DropReason::RecipientGone)
        }
    }

    fn relay_broadcast(&mut self, from: &ParticipantId, signal: SignalEnvelope) -> RelayOutcome {
        let recipients: Vec<ParticipantId> = self
            .participants
            .keys()
            .filter(|id| *id != from)
            .cloned()
            .collect();
        let delivered: Vec<ParticipantId> = recipients
            .into_iter()
            .filter(|to| {
                self.deliver(
                    to,
                    ServerMessage::Signal {
                        from: from.clone(),
                        signal: signal.clone(),
                    },
                )
            })
            .collect();
        if delivered.is_empty() {
            RelayOutcome::Dropped(DropReason::NoPeer)
        } else {
            RelayOutcome::Delivered(delivered)
        }
    }
}

/// Participant and pairing tables of the relay
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    policy: RelayPolicy,
    max_participants: usize,
}

impl SessionRegistry {
    pub fn new(policy: RelayPolicy, max_participants: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            policy,
            max_participants,
        }
    }

    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    /// Admit a new participant and acknowledge it with `connected`
    pub fn register(&self, outbox: Outbox) -> Result<ParticipantId, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.participants.len() >= self.max_participants {
            warn!("Rejecting participant: relay full ({})", self.max_participants);
            return Err(RegistryError::Full(self.max_participants));
        }

        let id = ParticipantId::generate();
        let open = outbox
            .send(ServerMessage::Connected {
                participant_id: id.clone(),
            })
            .is_ok();
        inner.participants.insert(
            id.clone(),
            Participant {
                id: id.clone(),
                pairing: None,
                open,
                connected_at: Instant::now(),
                outbox,
            },
        );
        info!("Participant {} registered ({} connected)", id, inner.participants.len());
        Ok(id)
    }

    /// Route a signal from `from` according to the relay policy
    pub fn relay(&self, from: &ParticipantId, signal: SignalEnvelope) -> RelayOutcome {
        let mut inner = self.inner.lock();
        if !inner.participants.contains_key(from) {
            debug!("Dropping {} from unknown participant {}", signal.kind(), from);
            return RelayOutcome::Dropped(DropReason::UnknownSender);
        }
        let kind = signal.kind();
        let outcome = match self.policy {
            RelayPolicy::Paired => inner.relay_paired(from, signal),
            RelayPolicy::Broadcast => inner.relay_broadcast(from, signal),
        };
        debug!("Relay {} from {}: {:?}", kind, from, outcome);
        outcome
    }

    /// Pair `from` with the named participant
    pub fn join(&self, from: &ParticipantId, peer: &ParticipantId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let sender = inner
            .participants
            .get(from)
            .ok_or_else(|| RegistryError::UnknownParticipant(from.clone()))?;
        if sender.pairing.is_some() {
            // joining the current partner again is a no-op
            if inner.partner_of(from).as_ref() == Some(peer) {
                return Ok(());
            }
            return Err(RegistryError::AlreadyPaired(from.clone()));
        }
        if from == peer {
            return Err(RegistryError::PeerUnavailable(peer.clone()));
        }
        match inner.participants.get(peer) {
            Some(target) if target.open && target.pairing.is_none() => {}
            _ => return Err(RegistryError::PeerUnavailable(peer.clone())),
        }
        inner.pair(from, peer);
        Ok(())
    }

    /// Dissolve `id`'s pairing while keeping it connected. Returns the
    /// former partner.
    pub fn leave(&self, id: &ParticipantId) -> Option<ParticipantId> {
        self.inner.lock().dissolve(id)
    }

    /// Remove a disconnected participant. Returns the partner that was
    /// notified with `peer-left`, if any.
    pub fn unregister(&self, id: &ParticipantId) -> Option<ParticipantId> {
        let mut inner = self.inner.lock();
        let partner = inner.dissolve(id);
        if let Some(participant) = inner.participants.remove(id) {
            info!(
                "Participant {} unregistered after {:?} ({} connected)",
                id,
                participant.connected_at.elapsed(),
                inner.participants.len()
            );
        }
        partner
    }

    pub fn partner_of(&self, id: &ParticipantId) -> Option<ParticipantId> {
        self.inner.lock().partner_of(id)
    }

    pub fn is_registered(&self, id: &ParticipantId) -> bool {
        self.inner.lock().participants.contains_key(id)
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().participants.len()
    }

    pub fn pairing_count(&self) -> usize {
        self.inner.lock().pairings.len()
    }
}
