//! Client-side copy of the replicated world
//!
//! Reliable messages (construction, teardown, ownership, playout delay) take
//! effect as soon as they are handled. Snapshots are held back for the
//! playout delay the server announced, which absorbs jitter on the
//! unreliable channel. Each field remembers the tick that last wrote it, so
//! a snapshot that arrives late still lands the fields nothing newer has
//! touched and is only dropped when every one of its fields is stale.

use log::{debug, info, warn};
use shared::{FieldChange, Message, ObjectId, ObjectState, VehicleSettings};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicatedObject {
    pub state: ObjectState,
    pub settings: Option<VehicleSettings>,
    /// Tick of the newest applied snapshot; 0 until the first one.
    pub last_tick: u64,
    field_ticks: [u64; FieldChange::COUNT],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStats {
    pub constructed: u64,
    pub destroyed: u64,
    pub snapshots_applied: u64,
    pub stale_snapshots: u64,
    pub orphan_snapshots: u64,
}

#[derive(Debug)]
struct PendingSnapshot {
    release_at: Instant,
    tick: u64,
    object_id: ObjectId,
    changes: Vec<FieldChange>,
}

#[derive(Debug, Default)]
pub struct Replica {
    objects: BTreeMap<ObjectId, ReplicatedObject>,
    owned: BTreeSet<ObjectId>,
    playout_delay: Duration,
    pending: VecDeque<PendingSnapshot>,
    stats: ReplicaStats,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, message: Message, now: Instant) {
        match message {
            Message::SetPlayoutDelay { delay_micros } => {
                self.playout_delay = Duration::from_micros(delay_micros);
                info!("Playout delay set to {:?}", self.playout_delay);
            }
            Message::ObjectConstructed {
                object_id,
                state,
                settings,
            } => {
                self.objects.insert(
                    object_id,
                    ReplicatedObject {
                        state,
                        settings,
                        last_tick: 0,
                        field_ticks: [0; FieldChange::COUNT],
                    },
                );
                self.stats.constructed += 1;
                debug!("Constructed {} ({:?})", object_id, state.kind);
            }
            Message::ObjectDestroyed { object_id } => {
                self.objects.remove(&object_id);
                self.owned.remove(&object_id);
                self.pending.retain(|snapshot| snapshot.object_id != object_id);
                self.stats.destroyed += 1;
                debug!("Destroyed {}", object_id);
            }
            Message::OwnershipChanged { object_id, owned } => {
                if owned {
                    info!("Now controlling {}", object_id);
                    self.owned.insert(object_id);
                } else {
                    info!("Lost control of {}", object_id);
                    self.owned.remove(&object_id);
                }
            }
            Message::StateSnapshot {
                tick,
                object_id,
                changes,
            } => self.pending.push_back(PendingSnapshot {
                release_at: now + self.playout_delay,
                tick,
                object_id,
                changes,
            }),
            Message::ControlAction { object_id, .. } => {
                warn!("Ignoring control action for {} sent by the server", object_id);
            }
        }
    }

    /// Applies every buffered snapshot whose playout time has come.
    pub fn update(&mut self, now: Instant) {
        while self
            .pending
            .front()
            .is_some_and(|snapshot| snapshot.release_at <= now)
        {
            let Some(snapshot) = self.pending.pop_front() else {
                break;
            };
            self.apply_snapshot(snapshot);
        }
    }

    fn apply_snapshot(&mut self, snapshot: PendingSnapshot) {
        let Some(object) = self.objects.get_mut(&snapshot.object_id) else {
            self.stats.orphan_snapshots += 1;
            return;
        };
        let tick = snapshot.tick;
        let fresh: Vec<FieldChange> = snapshot
            .changes
            .into_iter()
            .filter(|change| tick > object.field_ticks[change.slot()])
            .collect();
        if fresh.is_empty() {
            self.stats.stale_snapshots += 1;
            return;
        }

        object.state.apply(&fresh);
        for change in &fresh {
            object.field_ticks[change.slot()] = tick;
        }
        object.last_tick = object.last_tick.max(tick);
        self.stats.snapshots_applied += 1;
    }

    pub fn object(&self, object_id: ObjectId) -> Option<&ReplicatedObject> {
        self.objects.get(&object_id)
    }

    pub fn objects(&self) -> impl Iterator<Item = (&ObjectId, &ReplicatedObject)> {
        self.objects.iter()
    }

    pub fn owned(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.owned.iter().copied()
    }

    pub fn owns(&self, object_id: ObjectId) -> bool {
        self.owned.contains(&object_id)
    }

    pub fn playout_delay(&self) -> Duration {
        self.playout_delay
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn stats(&self) -> ReplicaStats {
        self.stats
    }
}
