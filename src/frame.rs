//! Mesh frame data model: the unit of traffic exchanged between peers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PeerId = String;

/// Frame kind. Ordering here is not meaningful; priority lives in [`FrameType::priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    EmergencyMedical = 0,
    EmergencyDanger = 1,
    Signal = 2,
    Chat = 3,
    Game = 4,
    Heartbeat = 5,
    RoutingUpdate = 6,
    KeyExchange = 7,
    System = 8,
    Topology = 9,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::EmergencyMedical,
            1 => Self::EmergencyDanger,
            2 => Self::Signal,
            3 => Self::Chat,
            4 => Self::Game,
            5 => Self::Heartbeat,
            6 => Self::RoutingUpdate,
            7 => Self::KeyExchange,
            8 => Self::System,
            9 => Self::Topology,
            _ => return None,
        })
    }

    pub fn is_emergency(self) -> bool {
        matches!(self, Self::EmergencyMedical | Self::EmergencyDanger)
    }

    /// True for frame types that skip the per-type, overall, and
    /// content-repetition checks (the ban check still applies to all of
    /// these). Emergency types are additionally subject to the dedicated
    /// emergency limiter; see [`FrameType::is_emergency`].
    pub fn bypasses_guard(self) -> bool {
        self.is_emergency() || matches!(self, Self::System | Self::KeyExchange)
    }

    /// Fixed integer priority, higher sorts first in the normal queue.
    pub fn priority(self) -> u8 {
        match self {
            Self::EmergencyMedical | Self::EmergencyDanger => 100,
            Self::System | Self::KeyExchange => 90,
            Self::RoutingUpdate => 70,
            Self::Heartbeat => 60,
            Self::Signal => 50,
            Self::Chat => 40,
            Self::Game => 30,
            Self::Topology => 20,
        }
    }

    pub fn default_ttl(self) -> u8 {
        if self.is_emergency() {
            20
        } else {
            10
        }
    }

    pub fn max_age_secs(self) -> u64 {
        if self.is_emergency() {
            600
        } else {
            300
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshFrame {
    pub id: [u8; 16],
    pub frame_type: FrameType,
    pub source_id: PeerId,
    pub target_id: Option<PeerId>,
    pub payload: Vec<u8>,
    pub timestamp: u32,
    pub ttl: u8,
    pub hop_count: u8,
    pub route_path: Vec<PeerId>,
}

impl MeshFrame {
    pub fn new(frame_type: FrameType, source_id: PeerId, target_id: Option<PeerId>, payload: Vec<u8>) -> Self {
        Self {
            id: *Uuid::new_v4().as_bytes(),
            ttl: frame_type.default_ttl(),
            timestamp: now_secs(),
            hop_count: 0,
            route_path: vec![source_id.clone()],
            frame_type,
            source_id,
            target_id,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id.is_none()
    }

    /// Returns true when the frame's `route_path` contains a duplicate peer,
    /// indicating a forwarding loop.
    pub fn has_loop(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.route_path.len());
        for p in &self.route_path {
            if !seen.insert(p) {
                return true;
            }
        }
        false
    }

    pub fn is_expired(&self, now: u32) -> bool {
        let max_age = self.frame_type.max_age_secs() as u32;
        now.saturating_sub(self.timestamp) > max_age
    }

    /// Like [`MeshFrame::is_expired`], but bounded by an engine-configured
    /// ceiling rather than the hardcoded per-type age.
    pub fn is_expired_within(&self, now: u32, configured_ttl_secs: u32) -> bool {
        let max_age = self.frame_type.max_age_secs().min(configured_ttl_secs as u64) as u32;
        now.saturating_sub(self.timestamp) > max_age
    }

    /// Produces the copy that should be enqueued for re-transmission: ttl
    /// decremented, hop_count incremented, local peer appended to the path.
    pub fn prepare_forward(&self, local_peer: &PeerId) -> Self {
        let mut next = self.clone();
        next.ttl = next.ttl.saturating_sub(1);
        next.hop_count = next.hop_count.saturating_add(1);
        next.route_path.push(local_peer.clone());
        next
    }
}

pub fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_bypasses_guard_but_not_ban() {
        assert!(FrameType::EmergencyMedical.bypasses_guard());
        assert!(FrameType::System.bypasses_guard());
        assert!(!FrameType::Chat.bypasses_guard());
    }

    #[test]
    fn loop_detection_catches_repeated_hop() {
        let mut f = MeshFrame::new(FrameType::Chat, "a".into(), None, vec![]);
        f.route_path.push("b".into());
        f.route_path.push("a".into());
        assert!(f.has_loop());
    }

    #[test]
    fn ttl_and_hop_count_move_together_on_forward() {
        let f = MeshFrame::new(FrameType::Chat, "a".into(), None, vec![1, 2, 3]);
        let fwd = f.prepare_forward(&"b".to_string());
        assert_eq!(fwd.ttl, f.ttl - 1);
        assert_eq!(fwd.hop_count, f.hop_count + 1);
        assert_eq!(fwd.route_path.last().unwrap(), "b");
    }
}
