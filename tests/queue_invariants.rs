//! Queue counter invariants checked against a brute-force recount after
//! every transition of a mixed item tree.

use std::collections::HashMap;

use ftpilot::ProblemKind;
use ftpilot::item::{DirCounters, Item, ItemId, ItemKind, ItemState};
use ftpilot::queue::Queue;

fn file(parent: Option<ItemId>, name: &str) -> Item {
    Item::new(parent, ItemState::Waiting, "/data", name, ItemKind::DeleteFile { is_hidden: false })
}

fn dir(parent: Option<ItemId>, name: &str, children: u32) -> Item {
    Item::new(
        parent,
        if children > 0 { ItemState::Delayed } else { ItemState::Waiting },
        "/data",
        name,
        ItemKind::DeleteDir {
            counters: DirCounters { not_done: children, ..DirCounters::default() },
            is_top_level: false,
            is_hidden: false,
        },
    )
}

/// Recompute every dir item's counters from its direct children and compare
/// with the stored values; also check the error-time invariant.
fn assert_invariants(queue: &Queue) {
    let views = queue.list_items();
    let mut recomputed: HashMap<ItemId, DirCounters> = HashMap::new();
    for view in &views {
        if let Some(parent) = view.parent {
            let slot = recomputed.entry(parent).or_default();
            if view.state != ItemState::Done {
                slot.not_done += 1;
            }
            match view.state {
                ItemState::Skipped => slot.skipped += 1,
                ItemState::Failed | ItemState::ForcedToFail => slot.failed += 1,
                ItemState::UserInputNeeded => slot.ui_needed += 1,
                _ => {}
            }
        }
    }
    for view in &views {
        let stored = queue.with_item(view.uid, |i| i.kind.dir_counters().copied()).flatten();
        if let Some(stored) = stored {
            let expected = recomputed.get(&view.uid).copied().unwrap_or_default();
            assert_eq!(stored, expected, "counters out of sync for {}", view.name);
        }
        let error_time = queue.with_item(view.uid, |i| i.error_time).unwrap();
        if view.state.is_error() {
            assert!(error_time > 0, "error state without stamp on {}", view.name);
        } else {
            assert_eq!(error_time, 0, "stale stamp on {}", view.name);
        }
    }
}

#[test]
fn counters_track_a_full_lifecycle() {
    let queue = Queue::new();
    let top = dir(None, "top", 2);
    let top_uid = top.uid;
    let nested = dir(Some(top_uid), "nested", 2);
    let nested_uid = nested.uid;
    let a = file(Some(top_uid), "a");
    let x = file(Some(nested_uid), "x");
    let y = file(Some(nested_uid), "y");
    let (a_uid, x_uid, y_uid) = (a.uid, x.uid, y.uid);
    queue.add_items(vec![top, nested, a, x, y]);
    assert_invariants(&queue);

    // Walk the leaves through mixed outcomes, checking after every step.
    queue.update_item_state(x_uid, ItemState::Done, ProblemKind::Ok, None, None);
    assert_invariants(&queue);
    queue.update_item_state(
        y_uid,
        ItemState::Failed,
        ProblemKind::UnableToDeleteFile,
        None,
        Some("550 busy".into()),
    );
    assert_invariants(&queue);
    // The failed leaf forces the nested dir (and the top) into forced-fail.
    assert_eq!(queue.with_item(nested_uid, |i| i.state).unwrap(), ItemState::ForcedToFail);
    assert_eq!(queue.with_item(top_uid, |i| i.state).unwrap(), ItemState::ForcedToFail);

    queue.retry_item(y_uid);
    assert_invariants(&queue);
    assert_eq!(queue.with_item(top_uid, |i| i.state).unwrap(), ItemState::Delayed);

    queue.update_item_state(y_uid, ItemState::Done, ProblemKind::Ok, None, None);
    assert_invariants(&queue);
    // Nested dir is runnable now; run it.
    assert_eq!(queue.with_item(nested_uid, |i| i.state).unwrap(), ItemState::Waiting);
    queue.update_item_state(nested_uid, ItemState::Done, ProblemKind::Ok, None, None);
    assert_invariants(&queue);

    queue.skip_item(a_uid);
    assert_invariants(&queue);
    assert_eq!(queue.with_item(top_uid, |i| i.state).unwrap(), ItemState::ForcedToFail);

    queue.retry_item(a_uid);
    queue.update_item_state(a_uid, ItemState::Done, ProblemKind::Ok, None, None);
    assert_invariants(&queue);
    assert_eq!(queue.with_item(top_uid, |i| i.state).unwrap(), ItemState::Waiting);
}

#[test]
fn skip_then_retry_preserves_parent_counters() {
    let queue = Queue::new();
    let parent = dir(None, "parent", 1);
    let parent_uid = parent.uid;
    let child = file(Some(parent_uid), "c");
    let child_uid = child.uid;
    queue.add_items(vec![parent, child]);
    let before = queue.with_item(parent_uid, |i| i.kind.dir_counters().copied()).flatten();

    assert!(queue.skip_item(child_uid));
    assert_invariants(&queue);
    assert!(queue.retry_item(child_uid));
    assert_invariants(&queue);

    let after = queue.with_item(parent_uid, |i| i.kind.dir_counters().copied()).flatten();
    assert_eq!(before, after);
    assert_eq!(queue.with_item(child_uid, |i| i.state).unwrap(), ItemState::Waiting);
}

#[test]
fn processing_items_stay_bound_to_the_queue() {
    let queue = Queue::new();
    let item = file(None, "a");
    let uid = item.uid;
    queue.add_item(item);
    let picked = queue.get_next_waiting().unwrap();
    assert_eq!(picked.uid, uid);
    // A worker holding the clone still finds the arena entry authoritative.
    assert!(queue.contains(uid));
    assert_eq!(queue.with_item(uid, |i| i.state).unwrap(), ItemState::Processing);
}

#[test]
fn explore_replacement_equivalent_to_original_for_singleton() {
    let queue = Queue::new();
    let original = file(None, "same");
    let uid = original.uid;
    queue.add_item(original);
    let counts_before = queue.counts();
    let _ = queue.get_next_waiting().unwrap();
    let replacement = file(None, "same");
    assert!(queue.replace_item_with_list(uid, vec![replacement]));
    assert_eq!(queue.counts(), counts_before);
    assert_invariants(&queue);
}
