//! Session lifecycle and object ownership for connected peers
//!
//! This module handles the server-side bookkeeping of connected peers:
//! - Session creation and teardown driven by transport connect/disconnect events
//! - Exclusive ownership of simulation objects per session
//! - Smoothed round-trip estimates fed from transport statistics
//! - Playout delay sizing at connect time
//!
//! All mutation happens on the tick task, so ownership exclusivity is enforced
//! by the checks in this module rather than by locks.

use crate::error::ServerError;
use log::{info, warn};
use shared::{ObjectId, PeerId};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// How the playout delay sent to a new peer is computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayoutDelayPolicy {
    /// `base * multiplier`, independent of the link.
    Fixed { base: Duration, multiplier: u32 },
    /// `rtt * multiplier`, never below `floor`. Falls back to `floor` when the
    /// transport has no RTT sample yet.
    MeasuredRtt { multiplier: f32, floor: Duration },
}

impl PlayoutDelayPolicy {
    pub fn delay_for(&self, measured_rtt: Option<Duration>) -> Duration {
        match *self {
            PlayoutDelayPolicy::Fixed { base, multiplier } => base * multiplier,
            PlayoutDelayPolicy::MeasuredRtt { multiplier, floor } => measured_rtt
                .map(|rtt| rtt.mul_f32(multiplier.max(0.0)))
                .map_or(floor, |delay| delay.max(floor)),
        }
    }
}

/// What happens to a session's objects when it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPolicy {
    DestroyOwned,
    ReleaseOwned,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub playout_policy: PlayoutDelayPolicy,
    pub disconnect_policy: DisconnectPolicy,
    /// Weight of a new RTT sample in the moving average, in (0, 1].
    pub latency_smoothing: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            playout_policy: PlayoutDelayPolicy::Fixed {
                base: Duration::from_millis(10),
                multiplier: 3,
            },
            disconnect_policy: DisconnectPolicy::DestroyOwned,
            latency_smoothing: 0.1,
        }
    }
}

/// Server-side record of one connected peer.
#[derive(Debug)]
pub struct Session {
    pub peer_id: PeerId,
    pub owned_objects: BTreeSet<ObjectId>,
    /// Exponential moving average of the transport's RTT; `None` until sampled.
    pub round_trip_estimate: Option<Duration>,
    /// Computed once at connect and sent to the peer.
    pub playout_delay: Duration,
}

impl Session {
    pub fn new(peer_id: PeerId, playout_delay: Duration) -> Self {
        Self {
            peer_id,
            owned_objects: BTreeSet::new(),
            round_trip_estimate: None,
            playout_delay,
        }
    }

    pub fn owns(&self, object: ObjectId) -> bool {
        self.owned_objects.contains(&object)
    }

    fn record_rtt(&mut self, sample: Duration, smoothing: f32) {
        self.round_trip_estimate = Some(match self.round_trip_estimate {
            Some(estimate) => {
                let alpha = f64::from(smoothing.clamp(0.0, 1.0));
                Duration::from_secs_f64(
                    estimate.as_secs_f64() * (1.0 - alpha) + sample.as_secs_f64() * alpha,
                )
            }
            None => sample,
        });
    }
}

/// Reports a transport contract violation: fatal in debug builds, a logged
/// no-op in release builds.
fn lifecycle_violation(message: &str, peer: PeerId) {
    warn!("Lifecycle violation for {}: {}", peer, message);
    debug_assert!(false, "lifecycle violation for {}: {}", peer, message);
}

/// Maps peers to sessions and objects to their owning peer.
pub struct SessionRegistry {
    sessions: HashMap<PeerId, Session>,
    owners: HashMap<ObjectId, PeerId>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            owners: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates a session for a newly connected peer.
    ///
    /// The caller must send the returned session's playout delay to the peer.
    /// Fails with [`ServerError::ServerFull`] at capacity.
    pub fn on_connect(
        &mut self,
        peer: PeerId,
        measured_rtt: Option<Duration>,
    ) -> Result<&Session, ServerError> {
        if self.sessions.contains_key(&peer) {
            lifecycle_violation("connected twice", peer);
            return self.sessions.get(&peer).ok_or(ServerError::UnknownPeer(peer));
        }

        if self.sessions.len() >= self.config.max_sessions {
            return Err(ServerError::ServerFull(self.config.max_sessions));
        }

        let playout_delay = self.config.playout_policy.delay_for(measured_rtt);
        info!(
            "Session opened for {} (playout delay {:?})",
            peer, playout_delay
        );
        Ok(self
            .sessions
            .entry(peer)
            .or_insert_with(|| Session::new(peer, playout_delay)))
    }

    /// Removes the session and returns the objects it owned, in id order.
    ///
    /// Ownership entries are always cleared here; destroying the objects
    /// themselves is left to the caller according to
    /// [`SessionConfig::disconnect_policy`].
    pub fn on_disconnect(&mut self, peer: PeerId) -> Option<Vec<ObjectId>> {
        let Some(session) = self.sessions.remove(&peer) else {
            lifecycle_violation("disconnect without session", peer);
            return None;
        };

        for object in &session.owned_objects {
            self.owners.remove(object);
        }
        info!(
            "Session closed for {} ({} owned objects)",
            peer,
            session.owned_objects.len()
        );
        Some(session.owned_objects.into_iter().collect())
    }

    /// Grants `peer` ownership of every object in `objects`, or of none.
    ///
    /// Objects already owned by `peer` are accepted unchanged. Objects owned by
    /// another session fail the whole call; ownership is never transferred
    /// implicitly.
    pub fn assign_ownership(
        &mut self,
        peer: PeerId,
        objects: &[ObjectId],
    ) -> Result<(), ServerError> {
        if !self.sessions.contains_key(&peer) {
            return Err(ServerError::UnknownPeer(peer));
        }

        for object in objects {
            if let Some(&owner) = self.owners.get(object) {
                if owner != peer {
                    return Err(ServerError::OwnershipConflict {
                        object: *object,
                        owner,
                    });
                }
            }
        }

        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(ServerError::UnknownPeer(peer))?;
        for object in objects {
            self.owners.insert(*object, peer);
            session.owned_objects.insert(*object);
        }
        Ok(())
    }

    /// Releases the listed objects held by `peer`; returns how many were released.
    pub fn release_ownership(&mut self, peer: PeerId, objects: &[ObjectId]) -> usize {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return 0;
        };

        let mut released = 0;
        for object in objects {
            if session.owned_objects.remove(object) {
                self.owners.remove(object);
                released += 1;
            }
        }
        released
    }

    /// Drops ownership of objects for which `exists` returns false.
    pub fn retain_existing(&mut self, mut exists: impl FnMut(ObjectId) -> bool) {
        let gone: Vec<ObjectId> = self
            .owners
            .keys()
            .copied()
            .filter(|object| !exists(*object))
            .collect();

        for object in gone {
            if let Some(peer) = self.owners.remove(&object) {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.owned_objects.remove(&object);
                }
            }
        }
    }

    /// Feeds one transport RTT sample into the session's moving average.
    pub fn update_latency(&mut self, peer: PeerId, measured_rtt: Duration) {
        let smoothing = self.config.latency_smoothing;
        match self.sessions.get_mut(&peer) {
            Some(session) => session.record_rtt(measured_rtt, smoothing),
            None => lifecycle_violation("latency update without session", peer),
        }
    }

    pub fn owner_of(&self, object: ObjectId) -> Option<PeerId> {
        self.owners.get(&object).copied()
    }

    pub fn is_owner(&self, peer: PeerId, object: ObjectId) -> bool {
        self.owner_of(object) == Some(peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<&Session> {
        self.sessions.get(&peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }

    /// Connected peers in ascending id order.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.sessions.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SessionConfig::default())
    }

    #[test]
    fn test_connect_creates_session_with_fixed_playout_delay() {
        let mut registry = registry();
        let session = registry.on_connect(PeerId(1), None).unwrap();

        assert_eq!(session.peer_id, PeerId(1));
        assert!(session.owned_objects.is_empty());
        assert_eq!(session.playout_delay, Duration::from_millis(30));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_measured_playout_policy() {
        let policy = PlayoutDelayPolicy::MeasuredRtt {
            multiplier: 1.5,
            floor: Duration::from_millis(20),
        };
        assert_eq!(policy.delay_for(None), Duration::from_millis(20));
        assert_eq!(
            policy.delay_for(Some(Duration::from_millis(5))),
            Duration::from_millis(20)
        );
        assert_eq!(
            policy.delay_for(Some(Duration::from_millis(100))),
            Duration::from_millis(150)
        );
    }

    #[test]
    fn test_connect_beyond_capacity_fails() {
        let mut registry = SessionRegistry::new(SessionConfig {
            max_sessions: 1,
            ..SessionConfig::default()
        });
        registry.on_connect(PeerId(1), None).unwrap();

        let result = registry.on_connect(PeerId(2), None);
        assert!(matches!(result, Err(ServerError::ServerFull(1))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "connected twice"))]
    fn test_double_connect_is_a_lifecycle_violation() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();
        registry.on_connect(PeerId(1), None).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "disconnect without session"))]
    fn test_disconnect_unknown_peer_is_a_lifecycle_violation() {
        let mut registry = registry();
        assert!(registry.on_disconnect(PeerId(9)).is_none());
    }

    #[test]
    fn test_assign_ownership() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();
        registry
            .assign_ownership(PeerId(1), &[ObjectId(10), ObjectId(11)])
            .unwrap();

        assert!(registry.is_owner(PeerId(1), ObjectId(10)));
        assert_eq!(registry.owner_of(ObjectId(11)), Some(PeerId(1)));
        assert!(registry.get(PeerId(1)).unwrap().owns(ObjectId(10)));
    }

    #[test]
    fn test_assign_ownership_conflict_is_all_or_nothing() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();
        registry.on_connect(PeerId(2), None).unwrap();
        registry.assign_ownership(PeerId(1), &[ObjectId(10)]).unwrap();

        let result = registry.assign_ownership(PeerId(2), &[ObjectId(20), ObjectId(10)]);
        assert!(matches!(
            result,
            Err(ServerError::OwnershipConflict {
                object: ObjectId(10),
                owner: PeerId(1)
            })
        ));
        assert_eq!(registry.owner_of(ObjectId(20)), None);
        assert_eq!(registry.owner_of(ObjectId(10)), Some(PeerId(1)));
    }

    #[test]
    fn test_reassigning_own_object_is_accepted() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();
        registry.assign_ownership(PeerId(1), &[ObjectId(3)]).unwrap();
        assert!(registry.assign_ownership(PeerId(1), &[ObjectId(3)]).is_ok());
    }

    #[test]
    fn test_assign_to_unknown_peer_fails() {
        let mut registry = registry();
        let result = registry.assign_ownership(PeerId(5), &[ObjectId(1)]);
        assert!(matches!(result, Err(ServerError::UnknownPeer(PeerId(5)))));
    }

    #[test]
    fn test_disconnect_returns_and_clears_owned_objects() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();
        registry
            .assign_ownership(PeerId(1), &[ObjectId(2), ObjectId(1)])
            .unwrap();

        let owned = registry.on_disconnect(PeerId(1)).unwrap();
        assert_eq!(owned, vec![ObjectId(1), ObjectId(2)]);
        assert_eq!(registry.owner_of(ObjectId(1)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_ownership() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();
        registry
            .assign_ownership(PeerId(1), &[ObjectId(1), ObjectId(2)])
            .unwrap();

        assert_eq!(registry.release_ownership(PeerId(1), &[ObjectId(1)]), 1);
        assert_eq!(registry.owner_of(ObjectId(1)), None);
        assert!(registry.is_owner(PeerId(1), ObjectId(2)));
    }

    #[test]
    fn test_retain_existing_drops_destroyed_objects() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();
        registry
            .assign_ownership(PeerId(1), &[ObjectId(1), ObjectId(2)])
            .unwrap();

        registry.retain_existing(|object| object != ObjectId(2));
        assert!(!registry.get(PeerId(1)).unwrap().owns(ObjectId(2)));
        assert_eq!(registry.owner_of(ObjectId(2)), None);
    }

    #[test]
    fn test_latency_moving_average() {
        let mut registry = registry();
        registry.on_connect(PeerId(1), None).unwrap();

        registry.update_latency(PeerId(1), Duration::from_millis(100));
        registry.update_latency(PeerId(1), Duration::from_millis(200));

        let estimate = registry.get(PeerId(1)).unwrap().round_trip_estimate.unwrap();
        assert_approx_eq!(estimate.as_secs_f64(), 0.110, 1e-6);
    }

    #[test]
    fn test_peers_are_sorted() {
        let mut registry = registry();
        registry.on_connect(PeerId(3), None).unwrap();
        registry.on_connect(PeerId(1), None).unwrap();
        registry.on_connect(PeerId(2), None).unwrap();
        assert_eq!(registry.peers(), vec![PeerId(1), PeerId(2), PeerId(3)]);
    }
}
