use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::Sender;

use crate::error::ProblemKind;
use crate::item::{ForcedAction, Item, ItemId, ItemKind, ItemState};

/// Snapshot of the queue-global counters, consistent at the moment of the
/// call (taken under the queue lock).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub total: u32,
    /// Explore/resolve items still in an active state; while non-zero only
    /// those items are handed out.
    pub explore_active: u32,
    pub done: u32,
    pub skipped: u32,
    pub failed: u32,
    pub ui_needed: u32,
    pub waiting_processing_delayed: u32,
}

impl QueueCounts {
    pub fn done_or_skipped(&self) -> u32 {
        self.done + self.skipped
    }

    /// Nothing left that could still run without user intervention.
    pub fn is_quiescent(&self) -> bool {
        self.waiting_processing_delayed == 0
    }
}

/// Row snapshot for the host's item listview.
#[derive(Debug, Clone)]
pub struct ItemView {
    pub uid: ItemId,
    pub parent: Option<ItemId>,
    pub label: &'static str,
    pub path: String,
    pub name: String,
    pub state: ItemState,
    pub problem: ProblemKind,
    pub problem_text: String,
}

struct QueueInner {
    /// Scheduling order; splices keep children right after their dir item.
    items: Vec<Item>,
    index: HashMap<ItemId, usize>,
    /// Lower bound on the position of any waiting item, refined lazily.
    first_waiting: usize,
    counts: QueueCounts,
    /// Monotonic clock stamped into `error_time` on error entry.
    error_clock: u64,
    /// Sleeping workers to poke when new work may exist.
    waiters: Vec<Sender<()>>,
}

/// The operation queue: an arena of items indexed by uid with per-parent
/// child-state counters. All mutation happens under one mutex; workers hold
/// uids and item clones, never references into the arena.
pub struct Queue {
    inner: Mutex<QueueInner>,
}

fn counts_group(state: ItemState) -> (bool, bool, bool, bool) {
    // (not_done, skipped, failed, ui_needed) — the four parent counters.
    (
        state != ItemState::Done,
        state == ItemState::Skipped,
        matches!(state, ItemState::Failed | ItemState::ForcedToFail),
        state == ItemState::UserInputNeeded,
    )
}

fn is_active(state: ItemState) -> bool {
    matches!(state, ItemState::Waiting | ItemState::Processing | ItemState::Delayed)
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(QueueInner {
                items: Vec::new(),
                index: HashMap::new(),
                first_waiting: 0,
                counts: QueueCounts::default(),
                error_clock: 0,
                waiters: Vec::new(),
            }),
        }
    }

    /// Register a sleeping worker; it is poked (once) the next time new work
    /// may have appeared.
    pub fn register_waiter(&self, tx: Sender<()>) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.waiters.push(tx);
    }

    fn wake_sleepers(&self) {
        let drained: Vec<Sender<()>> = {
            let mut inner = self.inner.lock().expect("queue lock");
            std::mem::take(&mut inner.waiters)
        };
        for tx in drained {
            let _ = tx.send(());
        }
    }

    /// Append one item; counters update and sleeping workers are woken.
    pub fn add_item(&self, item: Item) {
        self.add_items(vec![item]);
    }

    /// Append a batch atomically (one lock round).
    pub fn add_items(&self, items: Vec<Item>) {
        {
            let mut inner = self.inner.lock().expect("queue lock");
            for item in items {
                inner.insert_tail(item);
            }
        }
        self.wake_sleepers();
    }

    /// Atomically swap one (processing) item for a list of items — the way an
    /// explore item turns into its children. Items whose parent equals the
    /// replaced item's parent take over its slot in the parent counters; the
    /// remaining items must be children of items inside the list, with dir
    /// counters preset by the builder. Returns false when the uid is unknown.
    pub fn replace_item_with_list(&self, uid: ItemId, new_items: Vec<Item>) -> bool {
        let replaced = {
            let mut inner = self.inner.lock().expect("queue lock");
            let Some(&pos) = inner.index.get(&uid) else {
                return false;
            };
            let parent = inner.items[pos].parent;
            let old_state = inner.items[pos].state;

            // Parent-counter delta: the replaced slot goes away, the new
            // top-level items arrive with their preset states.
            let (o_nd, o_sk, o_fl, o_ui) = counts_group(old_state);
            let mut d_nd = -(o_nd as i64);
            let mut d_sk = -(o_sk as i64);
            let mut d_fl = -(o_fl as i64);
            let mut d_ui = -(o_ui as i64);
            for it in &new_items {
                debug_assert!(
                    it.parent == parent
                        || new_items.iter().any(|p| Some(p.uid) == it.parent),
                    "replacement item must hang off the old parent or the new list"
                );
                if it.parent == parent {
                    let (nd, sk, fl, ui) = counts_group(it.state);
                    d_nd += nd as i64;
                    d_sk += sk as i64;
                    d_fl += fl as i64;
                    d_ui += ui as i64;
                }
            }

            // Global counters: out with the old item, in with every new one.
            let old_explore = inner.items[pos].kind.is_explore_or_resolve();
            inner.remove_from_counts(old_state, old_explore);
            for it in &new_items {
                inner.add_to_counts(it.state, it.kind.is_explore_or_resolve());
            }

            // Splice and reindex.
            inner.items.remove(pos);
            inner.index.remove(&uid);
            let inserted = new_items.len();
            for (offset, it) in new_items.into_iter().enumerate() {
                inner.items.insert(pos + offset, it);
            }
            inner.reindex_from(pos);
            inner.first_waiting = inner.first_waiting.min(pos);
            // Items born in an error state (policy pre-skips) need stamps too.
            for idx in pos..pos + inserted {
                if inner.items[idx].state.is_error() && inner.items[idx].error_time == 0 {
                    inner.stamp_error_time(idx);
                }
            }

            if parent.is_some() && (d_nd != 0 || d_sk != 0 || d_fl != 0 || d_ui != 0) {
                inner.propagate_counters(parent, d_nd, d_sk, d_fl, d_ui);
            }
            true
        };
        self.wake_sleepers();
        replaced
    }

    /// Canonical state mutator: sets state + problem fields and walks the
    /// parent chain updating counters (and possibly parent states).
    pub fn update_item_state(
        &self,
        uid: ItemId,
        state: ItemState,
        problem: ProblemKind,
        os_error: Option<i32>,
        err_descr: Option<String>,
    ) -> bool {
        let changed = {
            let mut inner = self.inner.lock().expect("queue lock");
            let Some(&pos) = inner.index.get(&uid) else {
                return false;
            };
            inner.items[pos].problem = problem;
            inner.items[pos].os_error = os_error;
            inner.items[pos].err_descr = err_descr;
            inner.set_state_at(pos, state);
            true
        };
        if changed {
            self.wake_sleepers();
        }
        changed
    }

    /// Hand out the next waiting item (explore/resolve first), marking it
    /// `Processing`. Returns a clone; the arena stays the source of truth.
    pub fn get_next_waiting(&self) -> Option<Item> {
        let mut inner = self.inner.lock().expect("queue lock");
        let only_explore = inner.counts.explore_active > 0;
        let mut first_w: Option<usize> = None;
        let mut chosen: Option<usize> = None;
        for idx in inner.first_waiting..inner.items.len() {
            if inner.items[idx].state == ItemState::Waiting {
                if first_w.is_none() {
                    first_w = Some(idx);
                }
                if !only_explore || inner.items[idx].kind.is_explore_or_resolve() {
                    chosen = Some(idx);
                    break;
                }
            }
        }
        inner.first_waiting = first_w.unwrap_or(inner.items.len());
        let pos = chosen?;
        inner.items[pos].state = ItemState::Processing;
        Some(inner.items[pos].clone())
    }

    /// Reverse of `get_next_waiting` for a worker that could not process the
    /// item after all (shutdown, connection loss).
    pub fn return_to_waiting(&self, uid: ItemId) -> bool {
        let ok = {
            let mut inner = self.inner.lock().expect("queue lock");
            let Some(&pos) = inner.index.get(&uid) else {
                return false;
            };
            if inner.items[pos].state != ItemState::Processing {
                return false;
            }
            inner.items[pos].state = ItemState::Waiting;
            inner.first_waiting = inner.first_waiting.min(pos);
            true
        };
        if ok {
            self.wake_sleepers();
        }
        ok
    }

    /// User-driven skip. A waiting item is stamped `SkippedByUser`; an item
    /// already in a solvable error state keeps its problem.
    pub fn skip_item(&self, uid: ItemId) -> bool {
        let mut inner = self.inner.lock().expect("queue lock");
        let Some(&pos) = inner.index.get(&uid) else {
            return false;
        };
        match inner.items[pos].state {
            ItemState::Waiting => {
                inner.items[pos].problem = ProblemKind::SkippedByUser;
                inner.set_state_at(pos, ItemState::Skipped);
                true
            }
            ItemState::Failed | ItemState::UserInputNeeded => {
                inner.set_state_at(pos, ItemState::Skipped);
                true
            }
            _ => false,
        }
    }

    /// User-driven retry: clears the error and puts the item back in play.
    /// Dir items fall back to the state implied by their child counters.
    pub fn retry_item(&self, uid: ItemId) -> bool {
        let ok = {
            let mut inner = self.inner.lock().expect("queue lock");
            let Some(&pos) = inner.index.get(&uid) else {
                return false;
            };
            if !matches!(
                inner.items[pos].state,
                ItemState::Skipped | ItemState::Failed | ItemState::UserInputNeeded
            ) {
                return false;
            }
            inner.items[pos].problem = ProblemKind::Ok;
            inner.items[pos].os_error = None;
            inner.items[pos].err_descr = None;
            let new_state = match inner.items[pos].kind.dir_counters() {
                Some(c) => c.implied_state(),
                None => ItemState::Waiting,
            };
            inner.set_state_at(pos, new_state);
            inner.first_waiting = inner.first_waiting.min(pos);
            true
        };
        if ok {
            self.wake_sleepers();
        }
        ok
    }

    /// Apply an error resolution: record the forced action and retry the
    /// item. The caller (operation) may separately promote the decision to
    /// the operation-wide policy.
    pub fn solve_item(&self, uid: ItemId, forced: ForcedAction) -> bool {
        {
            let mut inner = self.inner.lock().expect("queue lock");
            let Some(&pos) = inner.index.get(&uid) else {
                return false;
            };
            inner.items[pos].forced = forced;
        }
        self.retry_item(uid)
    }

    /// Earliest unseen solvable error, by error-occurrence order. The host
    /// keeps the watermark of the last error it showed.
    pub fn find_oldest_error_above(&self, watermark: u64) -> Option<(ItemId, u64)> {
        let inner = self.inner.lock().expect("queue lock");
        inner
            .items
            .iter()
            .filter(|it| {
                matches!(it.state, ItemState::Failed | ItemState::UserInputNeeded)
                    && !it.problem.is_unsolvable()
                    && it.error_time > watermark
            })
            .min_by_key(|it| it.error_time)
            .map(|it| (it.uid, it.error_time))
    }

    pub fn counts(&self) -> QueueCounts {
        self.inner.lock().expect("queue lock").counts
    }

    /// Set the forced-action hint outside a solve flow (e.g. automatic
    /// resume after a connection loss mid-transfer).
    pub fn set_forced(&self, uid: ItemId, forced: ForcedAction) -> bool {
        let mut inner = self.inner.lock().expect("queue lock");
        let Some(&pos) = inner.index.get(&uid) else {
            return false;
        };
        inner.items[pos].forced = forced;
        true
    }

    /// Run a closure over an item's payload under the queue lock; used by
    /// workers to persist autorename phases, target-file states and the like.
    pub fn update_payload<F: FnOnce(&mut ItemKind)>(&self, uid: ItemId, f: F) -> bool {
        let mut inner = self.inner.lock().expect("queue lock");
        let Some(&pos) = inner.index.get(&uid) else {
            return false;
        };
        f(&mut inner.items[pos].kind);
        true
    }

    /// Read access to a single item under the lock.
    pub fn with_item<R, F: FnOnce(&Item) -> R>(&self, uid: ItemId, f: F) -> Option<R> {
        let inner = self.inner.lock().expect("queue lock");
        inner.index.get(&uid).map(|&pos| f(&inner.items[pos]))
    }

    pub fn contains(&self, uid: ItemId) -> bool {
        self.inner.lock().expect("queue lock").index.contains_key(&uid)
    }

    pub fn item_view(&self, uid: ItemId) -> Option<ItemView> {
        let inner = self.inner.lock().expect("queue lock");
        inner.index.get(&uid).map(|&pos| view_of(&inner.items[pos]))
    }

    /// Snapshot of all visible fields for listview rendering.
    pub fn list_items(&self) -> Vec<ItemView> {
        let inner = self.inner.lock().expect("queue lock");
        inner.items.iter().map(view_of).collect()
    }
}

fn view_of(it: &Item) -> ItemView {
    ItemView {
        uid: it.uid,
        parent: it.parent,
        label: it.kind.label(),
        path: it.path.clone(),
        name: it.name.clone(),
        state: it.state,
        problem: it.problem,
        problem_text: if it.problem == ProblemKind::Ok {
            String::new()
        } else {
            it.problem_text()
        },
    }
}

impl QueueInner {
    fn insert_tail(&mut self, item: Item) {
        self.add_to_counts(item.state, item.kind.is_explore_or_resolve());
        let pos = self.items.len();
        self.index.insert(item.uid, pos);
        self.first_waiting = self.first_waiting.min(pos);
        // Fresh error-state items (pre-skipped by policy) still need a stamp.
        let needs_stamp = item.state.is_error();
        self.items.push(item);
        if needs_stamp {
            self.stamp_error_time(pos);
        }
    }

    fn reindex_from(&mut self, pos: usize) {
        for idx in pos..self.items.len() {
            let uid = self.items[idx].uid;
            self.index.insert(uid, idx);
        }
    }

    fn stamp_error_time(&mut self, pos: usize) {
        self.error_clock += 1;
        self.items[pos].error_time = self.error_clock;
    }

    fn add_to_counts(&mut self, state: ItemState, explore: bool) {
        self.counts.total += 1;
        if explore && is_active(state) {
            self.counts.explore_active += 1;
        }
        match state {
            ItemState::Done => self.counts.done += 1,
            ItemState::Skipped => self.counts.skipped += 1,
            ItemState::Failed | ItemState::ForcedToFail => self.counts.failed += 1,
            ItemState::UserInputNeeded => self.counts.ui_needed += 1,
            _ => self.counts.waiting_processing_delayed += 1,
        }
    }

    fn remove_from_counts(&mut self, state: ItemState, explore: bool) {
        self.counts.total -= 1;
        if explore && is_active(state) {
            self.counts.explore_active -= 1;
        }
        match state {
            ItemState::Done => self.counts.done -= 1,
            ItemState::Skipped => self.counts.skipped -= 1,
            ItemState::Failed | ItemState::ForcedToFail => self.counts.failed -= 1,
            ItemState::UserInputNeeded => self.counts.ui_needed -= 1,
            _ => self.counts.waiting_processing_delayed -= 1,
        }
    }

    /// Set a new state at `pos`, maintaining error stamps, global counters
    /// and the parent-chain counters.
    fn set_state_at(&mut self, pos: usize, new_state: ItemState) {
        let old_state = self.items[pos].state;
        if old_state == new_state {
            // Error fields may have changed; keep the stamp fresh on
            // repeated error entry so the solve walk keeps its order.
            if new_state.is_error() && self.items[pos].error_time == 0 {
                self.error_clock += 1;
                self.items[pos].error_time = self.error_clock;
            }
            return;
        }
        let explore = self.items[pos].kind.is_explore_or_resolve();
        let parent = self.items[pos].parent;

        self.remove_from_counts(old_state, explore);
        self.add_to_counts(new_state, explore);
        self.items[pos].state = new_state;
        if new_state.is_error() {
            self.error_clock += 1;
            self.items[pos].error_time = self.error_clock;
        } else {
            self.items[pos].error_time = 0;
        }
        if new_state == ItemState::Waiting {
            self.first_waiting = self.first_waiting.min(pos);
        }

        let (o_nd, o_sk, o_fl, o_ui) = counts_group(old_state);
        let (n_nd, n_sk, n_fl, n_ui) = counts_group(new_state);
        let d_nd = n_nd as i64 - o_nd as i64;
        let d_sk = n_sk as i64 - o_sk as i64;
        let d_fl = n_fl as i64 - o_fl as i64;
        let d_ui = n_ui as i64 - o_ui as i64;
        if d_nd != 0 || d_sk != 0 || d_fl != 0 || d_ui != 0 {
            self.propagate_counters(parent, d_nd, d_sk, d_fl, d_ui);
        }
    }

    /// The central recurrence: apply counter deltas to a dir item and cascade
    /// state changes up the parent chain. Work is O(depth) per child event.
    fn propagate_counters(
        &mut self,
        mut parent: Option<ItemId>,
        mut d_nd: i64,
        mut d_sk: i64,
        mut d_fl: i64,
        mut d_ui: i64,
    ) {
        while let Some(uid) = parent {
            let Some(&pos) = self.index.get(&uid) else {
                debug_assert!(false, "parent uid {} not in queue", uid);
                return;
            };
            let Some(counters) = self.items[pos].kind.dir_counters_mut() else {
                debug_assert!(false, "parent {} is not a dir item", uid);
                return;
            };
            counters.not_done = (counters.not_done as i64 + d_nd) as u32;
            counters.skipped = (counters.skipped as i64 + d_sk) as u32;
            counters.failed = (counters.failed as i64 + d_fl) as u32;
            counters.ui_needed = (counters.ui_needed as i64 + d_ui) as u32;
            let implied = counters.implied_state();

            let old_state = self.items[pos].state;
            // Only re-evaluate dir items resting in a counter-driven state;
            // a dir being processed keeps its state until the worker is done.
            let adjustable = matches!(
                old_state,
                ItemState::Waiting | ItemState::Delayed | ItemState::ForcedToFail
            );
            if !adjustable || implied == old_state {
                return;
            }

            let explore = self.items[pos].kind.is_explore_or_resolve();
            self.remove_from_counts(old_state, explore);
            self.add_to_counts(implied, explore);
            self.items[pos].state = implied;
            if implied.is_error() {
                self.error_clock += 1;
                self.items[pos].error_time = self.error_clock;
            } else {
                self.items[pos].error_time = 0;
            }
            if implied == ItemState::Waiting {
                self.first_waiting = self.first_waiting.min(pos);
            }

            let (o_nd, o_sk, o_fl, o_ui) = counts_group(old_state);
            let (n_nd, n_sk, n_fl, n_ui) = counts_group(implied);
            d_nd = n_nd as i64 - o_nd as i64;
            d_sk = n_sk as i64 - o_sk as i64;
            d_fl = n_fl as i64 - o_fl as i64;
            d_ui = n_ui as i64 - o_ui as i64;
            if d_nd == 0 && d_sk == 0 && d_fl == 0 && d_ui == 0 {
                return;
            }
            parent = self.items[pos].parent;
        }
    }
}
