use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cache::ServerKey;
use crate::ftp::listing::PathStyle;
use crate::operation::Operation;

/// Registry of live operations: a gap-filled array indexed by uid, the
/// cross-operation conflict queries, and the worker-may-be-closed pulse the
/// teardown loops wait on.
pub struct OperationsList {
    ops: Mutex<Vec<Option<Arc<Operation>>>>,
    /// Increment-only counter + condvar; waiting loops verify progress of
    /// the counter so a pulse between checks is never lost.
    closed_pulse: Arc<(Mutex<u64>, Condvar)>,
}

impl Default for OperationsList {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationsList {
    pub fn new() -> Self {
        OperationsList {
            ops: Mutex::new(Vec::new()),
            closed_pulse: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// Register an operation; fills the first free slot and stamps the uid.
    pub fn add(&self, op: Arc<Operation>) -> u32 {
        let mut ops = self.ops.lock().expect("ops lock");
        let slot = ops.iter().position(|o| o.is_none());
        let idx = match slot {
            Some(idx) => {
                ops[idx] = Some(op.clone());
                idx
            }
            None => {
                ops.push(Some(op.clone()));
                ops.len() - 1
            }
        };
        let uid = idx as u32;
        op.set_uid(uid);
        uid
    }

    pub fn get(&self, uid: u32) -> Option<Arc<Operation>> {
        let ops = self.ops.lock().expect("ops lock");
        ops.get(uid as usize).and_then(|o| o.clone())
    }

    /// Drop an operation from the registry. When `broadcast_changes` is set,
    /// its accumulated change paths are returned for the host panel.
    pub fn remove(&self, uid: u32, broadcast_changes: bool) -> Vec<crate::operation::ChangedPath> {
        let op = {
            let mut ops = self.ops.lock().expect("ops lock");
            ops.get_mut(uid as usize).and_then(|slot| slot.take())
        };
        match op {
            Some(op) if broadcast_changes => op.take_change_paths(),
            _ => Vec::new(),
        }
    }

    /// Walk every live operation with a closure (short read-only sweeps).
    pub fn for_each<F: FnMut(&Arc<Operation>)>(&self, mut f: F) {
        let ops = self.ops.lock().expect("ops lock");
        for op in ops.iter().flatten() {
            f(op);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.lock().expect("ops lock").iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admission control: may an operation other than `asking_uid` change the
    /// given server path? False when some other live operation mutates it.
    pub fn can_make_changes_on_path(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        asking_uid: u32,
    ) -> bool {
        let ops = self.ops.lock().expect("ops lock");
        !ops.iter().flatten().any(|op| {
            op.uid() != asking_uid && op.mutates_server_path(key, path, style)
        })
    }

    /// Whether any live operation uploads to the given server; the panel asks
    /// after an operation ends to decide about refreshing.
    pub fn is_uploading_to_server(&self, key: &ServerKey) -> bool {
        let ops = self.ops.lock().expect("ops lock");
        ops.iter().flatten().any(|op| op.is_uploading_to_server(key))
    }

    /// Signal that some worker may have closed; wakes every teardown waiter.
    pub fn pulse_worker_closed(&self) {
        let (lock, cv) = &*self.closed_pulse;
        let mut state = lock.lock().expect("pulse lock");
        *state += 1;
        cv.notify_all();
    }

    /// Wait until the pulse fires (state advances past `seen_state`) or the
    /// timeout passes. Returns the new state, or None on timeout/cancel.
    /// `cancelled` is polled so the host can abort the wait (ESC).
    pub fn wait_worker_closed(
        &self,
        seen_state: u64,
        timeout: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> Option<u64> {
        let (lock, cv) = &*self.closed_pulse;
        let deadline = Instant::now() + timeout;
        let mut state = lock.lock().expect("pulse lock");
        while *state <= seen_state {
            if cancelled() {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // Short slices so the cancel flag is polled while we sleep.
            let slice = remaining.min(Duration::from_millis(100));
            let (guard, _) = cv.wait_timeout(state, slice).expect("pulse wait");
            state = guard;
        }
        Some(*state)
    }

    pub fn pulse_state(&self) -> u64 {
        *self.closed_pulse.0.lock().expect("pulse lock")
    }

    /// Graceful teardown of every live operation: stop workers, wait for the
    /// pulses, join threads.
    pub fn stop_all(&self) {
        self.for_each(|op| op.stop_workers());
        self.for_each(|op| op.join_workers());
    }
}
