//! Peer table and trust bookkeeping.

use super::{Fingerprint, PeerId};
use crate::crypto::X25519PublicKey;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How much the local user trusts a peer's identity.
///
/// Only escalates through explicit calls on [`TrustStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Seen on the mesh, never checked.
    Unknown,
    /// Fingerprint compared out of band.
    Verified,
    /// Verified and explicitly marked trusted.
    Trusted,
}

impl TrustLevel {
    /// Stable string form used by storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::Verified => "verified",
            TrustLevel::Trusted => "trusted",
        }
    }

    /// Parse the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(TrustLevel::Unknown),
            "verified" => Some(TrustLevel::Verified),
            "trusted" => Some(TrustLevel::Trusted),
            _ => None,
        }
    }
}

/// A remote node known to this engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Truncated fingerprint.
    pub id: PeerId,
    /// SHA-256 of the static public key.
    pub fingerprint: Fingerprint,
    /// Self-chosen display name. Not authenticated beyond the announcement signature.
    pub nickname: String,
    /// Static X25519 key the `id` was derived from.
    pub static_public_key: X25519PublicKey,
    /// Ed25519 key, once learned from an announcement or handshake.
    pub signing_public_key: Option<[u8; 32]>,
    /// Whether a packet from this peer arrived recently.
    pub is_connected: bool,
    /// Milliseconds since the epoch.
    pub last_seen: u64,
    /// Trust level.
    pub trust_level: TrustLevel,
    /// User-marked favorite.
    pub is_favorite: bool,
    /// Packets from blocked peers are dropped before dedup.
    pub is_blocked: bool,
}

impl Peer {
    /// Create an unknown, connected peer from its static key.
    pub fn new(static_public_key: X25519PublicKey, nickname: impl Into<String>, now_ms: u64) -> Self {
        let fingerprint = Fingerprint::of(&static_public_key);
        Self {
            id: PeerId::from_fingerprint(&fingerprint),
            fingerprint,
            nickname: nickname.into(),
            static_public_key,
            signing_public_key: None,
            is_connected: true,
            last_seen: now_ms,
            trust_level: TrustLevel::Unknown,
            is_favorite: false,
            is_blocked: false,
        }
    }

    /// Builder-style signing key.
    pub fn with_signing_key(mut self, key: [u8; 32]) -> Self {
        self.signing_public_key = Some(key);
        self
    }
}

/// Result of merging identity material into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    /// The peer was not known before.
    Discovered,
    /// An existing entry was refreshed.
    Updated,
}

/// In-memory peer table keyed by [`PeerId`].
#[derive(Debug, Default, Clone)]
pub struct TrustStore {
    peers: HashMap<PeerId, Peer>,
}

impl TrustStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated from persisted records.
    pub fn from_peers(peers: impl IntoIterator<Item = Peer>) -> Self {
        Self {
            peers: peers.into_iter().map(|p| (p.id, p)).collect(),
        }
    }

    /// Insert a peer if absent. Returns true when it was inserted.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        if self.peers.contains_key(&peer.id) {
            return false;
        }
        self.peers.insert(peer.id, peer);
        true
    }

    /// Look up a peer.
    pub fn get_peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// All peers, in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Merge authenticated identity material for a peer.
    ///
    /// The `PeerId` must be derived from `static_key`, and a known peer may
    /// never change its static key. Trust, favorite and blocked flags are
    /// left untouched.
    pub fn apply_identity(
        &mut self,
        id: PeerId,
        static_key: X25519PublicKey,
        signing_key: [u8; 32],
        nickname: &str,
        now_ms: u64,
    ) -> Result<PeerUpdate> {
        if PeerId::from_static_key(&static_key) != id {
            return Err(Error::Identity(format!(
                "static key does not hash to peer id {}",
                id
            )));
        }

        match self.peers.get_mut(&id) {
            Some(peer) => {
                if peer.static_public_key != static_key {
                    return Err(Error::Identity(format!("static key changed for {}", id)));
                }
                if let Some(existing) = peer.signing_public_key {
                    if existing != signing_key {
                        return Err(Error::Identity(format!("signing key changed for {}", id)));
                    }
                }
                peer.signing_public_key = Some(signing_key);
                peer.nickname = nickname.to_string();
                peer.is_connected = true;
                peer.last_seen = peer.last_seen.max(now_ms);
                Ok(PeerUpdate::Updated)
            }
            None => {
                let peer = Peer::new(static_key, nickname, now_ms).with_signing_key(signing_key);
                self.peers.insert(id, peer);
                Ok(PeerUpdate::Discovered)
            }
        }
    }

    /// Mark a peer's fingerprint as checked out of band.
    ///
    /// No-op if it is already verified or trusted.
    pub fn verify_peer(&mut self, id: &PeerId) -> Result<TrustLevel> {
        let peer = self.peer_mut(id)?;
        if peer.trust_level == TrustLevel::Unknown {
            peer.trust_level = TrustLevel::Verified;
        }
        Ok(peer.trust_level)
    }

    /// Promote a verified peer to trusted.
    pub fn promote_to_trusted(&mut self, id: &PeerId) -> Result<TrustLevel> {
        let peer = self.peer_mut(id)?;
        match peer.trust_level {
            TrustLevel::Unknown => Err(Error::Identity(format!(
                "peer {} must be verified before it can be trusted",
                id
            ))),
            TrustLevel::Verified | TrustLevel::Trusted => {
                peer.trust_level = TrustLevel::Trusted;
                Ok(TrustLevel::Trusted)
            }
        }
    }

    /// Block a peer.
    pub fn block_peer(&mut self, id: &PeerId) -> Result<()> {
        let peer = self.peer_mut(id)?;
        peer.is_blocked = true;
        peer.is_connected = false;
        Ok(())
    }

    /// Unblock a peer.
    pub fn unblock_peer(&mut self, id: &PeerId) -> Result<()> {
        self.peer_mut(id)?.is_blocked = false;
        Ok(())
    }

    /// Whether the peer is known and blocked.
    pub fn is_blocked(&self, id: &PeerId) -> bool {
        self.peers.get(id).map(|p| p.is_blocked).unwrap_or(false)
    }

    /// Set or clear the favorite flag.
    pub fn set_favorite(&mut self, id: &PeerId, favorite: bool) -> Result<()> {
        self.peer_mut(id)?.is_favorite = favorite;
        Ok(())
    }

    /// Refresh `last_seen` and mark connected. Returns false for unknown peers.
    pub fn record_seen(&mut self, id: &PeerId, now_ms: u64) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_seen = peer.last_seen.max(now_ms);
                peer.is_connected = true;
                true
            }
            None => false,
        }
    }

    /// Mark a peer as no longer reachable.
    pub fn mark_disconnected(&mut self, id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.is_connected = false;
        }
    }

    /// Connected peers not heard from within `max_age_ms`.
    pub fn stale_peers(&self, now_ms: u64, max_age_ms: u64) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.is_connected && now_ms.saturating_sub(p.last_seen) > max_age_ms)
            .map(|p| p.id)
            .collect()
    }

    /// Delete a peer. Never called by packet processing.
    pub fn remove_peer(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    fn peer_mut(&mut self, id: &PeerId) -> Result<&mut Peer> {
        self.peers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StaticKeypair;

    fn sample_peer() -> Peer {
        Peer::new(*StaticKeypair::generate().public_key(), "alice", 1_000)
    }

    #[test]
    fn test_new_peer_is_unknown() {
        let peer = sample_peer();
        assert_eq!(peer.trust_level, TrustLevel::Unknown);
        assert_eq!(peer.id, PeerId::from_static_key(&peer.static_public_key));
        assert!(!peer.is_blocked);
    }

    #[test]
    fn test_add_peer_does_not_overwrite() {
        let mut store = TrustStore::new();
        let mut peer = sample_peer();
        assert!(store.add_peer(peer.clone()));

        peer.nickname = "mallory".into();
        assert!(!store.add_peer(peer.clone()));
        assert_eq!(store.get_peer(&peer.id).map(|p| p.nickname.as_str()), Some("alice"));
    }

    #[test]
    fn test_trust_escalation() {
        let mut store = TrustStore::new();
        let peer = sample_peer();
        let id = peer.id;
        store.add_peer(peer);

        assert!(store.promote_to_trusted(&id).is_err());
        assert_eq!(store.verify_peer(&id).expect("verify"), TrustLevel::Verified);
        assert_eq!(store.promote_to_trusted(&id).expect("promote"), TrustLevel::Trusted);
        // verifying again never lowers trust
        assert_eq!(store.verify_peer(&id).expect("verify"), TrustLevel::Trusted);
    }

    #[test]
    fn test_unknown_peer_operations_fail() {
        let mut store = TrustStore::new();
        let id = PeerId([9; 8]);
        assert!(matches!(store.verify_peer(&id), Err(Error::UnknownPeer(_))));
        assert!(store.block_peer(&id).is_err());
        assert!(!store.is_blocked(&id));
        assert!(!store.record_seen(&id, 5));
    }

    #[test]
    fn test_block_and_unblock() {
        let mut store = TrustStore::new();
        let peer = sample_peer();
        let id = peer.id;
        store.add_peer(peer);

        store.block_peer(&id).expect("block");
        assert!(store.is_blocked(&id));
        store.unblock_peer(&id).expect("unblock");
        assert!(!store.is_blocked(&id));
    }

    #[test]
    fn test_apply_identity_rejects_key_change() {
        let mut store = TrustStore::new();
        let key = *StaticKeypair::generate().public_key();
        let id = PeerId::from_static_key(&key);

        let first = store.apply_identity(id, key, [1; 32], "bob", 10).expect("apply");
        assert_eq!(first, PeerUpdate::Discovered);
        let second = store.apply_identity(id, key, [1; 32], "bobby", 20).expect("apply");
        assert_eq!(second, PeerUpdate::Updated);
        assert_eq!(store.get_peer(&id).map(|p| p.nickname.as_str()), Some("bobby"));

        // a different static key cannot claim the same id
        let other = *StaticKeypair::generate().public_key();
        assert!(store.apply_identity(id, other, [1; 32], "eve", 30).is_err());
        // nor can a different signing key
        assert!(store.apply_identity(id, key, [2; 32], "eve", 30).is_err());
    }

    #[test]
    fn test_apply_identity_keeps_trust() {
        let mut store = TrustStore::new();
        let key = *StaticKeypair::generate().public_key();
        let id = PeerId::from_static_key(&key);
        store.apply_identity(id, key, [1; 32], "bob", 10).expect("apply");
        store.verify_peer(&id).expect("verify");

        store.apply_identity(id, key, [1; 32], "bob", 20).expect("apply");
        assert_eq!(store.get_peer(&id).map(|p| p.trust_level), Some(TrustLevel::Verified));
    }

    #[test]
    fn test_stale_peers() {
        let mut store = TrustStore::new();
        let old = Peer::new(*StaticKeypair::generate().public_key(), "old", 1_000);
        let fresh = Peer::new(*StaticKeypair::generate().public_key(), "fresh", 9_000);
        let (old_id, fresh_id) = (old.id, fresh.id);
        store.add_peer(old);
        store.add_peer(fresh);

        assert_eq!(store.stale_peers(10_000, 5_000), vec![old_id]);
        store.mark_disconnected(&old_id);
        assert!(store.stale_peers(10_000, 5_000).is_empty());

        store.record_seen(&old_id, 10_000);
        assert!(store.get_peer(&old_id).map(|p| p.is_connected).unwrap_or(false));
        assert!(store.get_peer(&fresh_id).is_some());
    }

    #[test]
    fn test_trust_level_strings() {
        for level in [TrustLevel::Unknown, TrustLevel::Verified, TrustLevel::Trusted] {
            assert_eq!(TrustLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(TrustLevel::parse("bogus"), None);
    }
}
