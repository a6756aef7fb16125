use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detector::{Phase, RepSummary};
use crate::{RepCounterError, Result};

/// Fully computed summary of a session for one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub workout_id: String,
    pub rep_count: u32,
    pub per_joint_phase: BTreeMap<String, Phase>,
    pub feedback_text: String,
    /// One entry per tracked joint; `None` where the angle was unavailable.
    pub angles: BTreeMap<String, Option<f32>>,
    pub frame_timestamp_ms: u64,
    pub person_detected: bool,
    /// Most recent counted repetition, if any.
    pub last_rep: Option<RepSummary>,
}

/// Creates a latest-value mailbox from the session worker to the display.
///
/// Publishing never waits for the display: a snapshot that has not been
/// picked up yet is simply replaced by the newer one.
pub fn snapshot_channel() -> (SnapshotPublisher, SnapshotReceiver) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::default()),
        ready: Condvar::new(),
    });
    (
        SnapshotPublisher {
            shared: shared.clone(),
        },
        SnapshotReceiver { shared },
    )
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<SessionSnapshot>,
    overwritten: u64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| RepCounterError::msg("snapshot mailbox has been poisoned"))
    }
}

/// Worker-side half of [`snapshot_channel`]. Dropping it closes the mailbox.
#[derive(Debug)]
pub struct SnapshotPublisher {
    shared: Arc<Shared>,
}

impl SnapshotPublisher {
    /// Stores `snapshot` as the latest value. Returns `true` if an undelivered
    /// snapshot was replaced.
    pub fn publish(&self, snapshot: SessionSnapshot) -> Result<bool> {
        let mut slot = self.shared.lock()?;
        let replaced = slot.latest.replace(snapshot).is_some();
        if replaced {
            slot.overwritten += 1;
        }
        drop(slot);
        self.shared.ready.notify_all();
        Ok(replaced)
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.shared.lock() {
            slot.closed = true;
        }
        self.shared.ready.notify_all();
    }
}

/// Display-side half of [`snapshot_channel`].
#[derive(Debug, Clone)]
pub struct SnapshotReceiver {
    shared: Arc<Shared>,
}

impl SnapshotReceiver {
    /// Takes the most recent snapshot, if one arrived since the last call.
    pub fn try_latest(&self) -> Result<Option<SessionSnapshot>> {
        Ok(self.shared.lock()?.latest.take())
    }

    /// Waits up to `timeout` for a snapshot. Returns `None` on timeout or when
    /// the worker has gone away and nothing is left to deliver.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<SessionSnapshot>> {
        let slot = self.shared.lock()?;
        let (mut slot, _) = self
            .shared
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.latest.is_none() && !slot.closed)
            .map_err(|_| RepCounterError::msg("snapshot mailbox has been poisoned"))?;
        Ok(slot.latest.take())
    }

    /// True once the worker has dropped its publisher.
    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.shared.lock()?.closed)
    }

    /// Number of snapshots replaced before the display picked them up.
    pub fn overwritten(&self) -> Result<u64> {
        Ok(self.shared.lock()?.overwritten)
    }
}
