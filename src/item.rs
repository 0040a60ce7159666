use std::sync::atomic::{AtomicU32, Ordering};

use chrono::NaiveDateTime;

use crate::error::ProblemKind;

/// Unique item id inside a queue. Workers hold ids, never references.
pub type ItemId = u32;

static NEXT_ITEM_UID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next item uid. Ids are process-global so an item can be built
/// (and wired to its parent) before the whole batch enters the queue.
pub fn next_item_uid() -> ItemId {
    NEXT_ITEM_UID.fetch_add(1, Ordering::Relaxed)
}

/// Runtime state of a queue item. Error states must stay grouped at the end;
/// `is_error` relies on it the same way the queue counters do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting to be picked up by a worker.
    Waiting,
    /// A worker is executing the item right now.
    Processing,
    /// Postponed until all child items reach a terminal state.
    Delayed,
    Done,
    Skipped,
    Failed,
    /// Completing the item needs a user decision.
    UserInputNeeded,
    /// Entered an error state because children were skipped or failed.
    ForcedToFail,
}

impl ItemState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ItemState::Skipped
                | ItemState::Failed
                | ItemState::UserInputNeeded
                | ItemState::ForcedToFail
        )
    }

    /// Terminal for the purposes of parent bookkeeping: the item will not run
    /// again without user intervention.
    pub fn is_terminal(self) -> bool {
        self == ItemState::Done || self.is_error()
    }
}

/// Action forced by the user from the error-resolution dialog; overrides the
/// operation-wide policy for this one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForcedAction {
    #[default]
    None,
    UseAutorename,
    UseExistingDir,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    ReduceFileSizeAndResume,
    UploadForceAutorename,
    UploadContinueAutorename,
    /// The whole file was sent but the server never answered; verify instead
    /// of re-sending.
    UploadTestIfFinished,
}

/// What this operation already did to the local/remote target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TgtFileState {
    #[default]
    Unknown,
    Transferred,
    Created,
    Resumed,
}

/// Child-state counters kept on directory items so parent state can be
/// re-evaluated in O(1) per child transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirCounters {
    pub not_done: u32,
    pub skipped: u32,
    pub failed: u32,
    pub ui_needed: u32,
}

impl DirCounters {
    /// State implied by the counters alone (used for dir items that are not
    /// being processed).
    pub fn implied_state(&self) -> ItemState {
        if self.skipped > 0 || self.failed > 0 {
            ItemState::ForcedToFail
        } else if self.not_done > 0 {
            ItemState::Delayed
        } else {
            ItemState::Waiting
        }
    }
}

/// Payload of download copy/move file items (also carried by resolve-link
/// items, which turn into file items when the link points at a file).
#[derive(Debug, Clone)]
pub struct CopyMoveFile {
    pub tgt_path: String,
    pub tgt_name: String,
    /// None = size unknown (listing had no usable size).
    pub size: Option<u64>,
    /// False when `size` counts blocks, not bytes (MVS/VMS listings).
    pub size_in_bytes: bool,
    pub ascii_mode: bool,
    /// The user told us to keep ASCII mode even though the file looks binary.
    pub ignore_ascii_for_binary: bool,
    pub tgt_file_state: TgtFileState,
    /// Source timestamp to stamp onto the finished target file.
    pub date_time: Option<NaiveDateTime>,
}

/// Payload of download explore items; the target is where generated children
/// will be placed on disk.
#[derive(Debug, Clone)]
pub struct CopyMoveExplore {
    pub tgt_path: String,
    pub tgt_name: String,
}

/// Payload of upload explore items; source is a disk path, target a server path.
#[derive(Debug, Clone)]
pub struct UploadExplore {
    pub tgt_path: String,
    pub tgt_name: String,
}

/// Payload of upload copy/move file items.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub tgt_path: String,
    pub tgt_name: String,
    pub size: Option<u64>,
    pub size_in_bytes: bool,
    pub ascii_mode: bool,
    pub ignore_ascii_for_binary: bool,
    /// Monotonic counter for the autorename generator; retries continue the
    /// sequence instead of starting over.
    pub autorename_phase: u32,
    /// Name of the current autorename attempt (when phase > 0).
    pub renamed_name: Option<String>,
    /// Source size after LF -> CRLF conversion; filled once the file has been
    /// read through in ASCII mode.
    pub size_with_crlf_eols: Option<u64>,
    pub number_of_eols: Option<u64>,
    pub tgt_file_state: TgtFileState,
}

/// Payload of change-attributes items.
#[derive(Debug, Clone)]
pub struct ChAttrs {
    /// Requested unix mode bits (0o000..=0o777).
    pub mode: u32,
    /// The source carries permission bits we cannot express; the
    /// `unknown_attrs` policy decides what happens.
    pub unknown_attrs: bool,
    /// Original rights string from the listing, kept for the prompt.
    pub orig_rights: Option<String>,
}

/// Item type + per-type payload. Variants before `DeleteLink` are the
/// explore/resolve group and are always drained first.
#[derive(Debug, Clone)]
pub enum ItemKind {
    // --- explore/resolve items (higher scheduling priority) ---
    DeleteExploreDir { is_top_level: bool, is_hidden: bool },
    CopyResolveLink(Box<CopyMoveFile>),
    MoveResolveLink(Box<CopyMoveFile>),
    CopyExploreDir(Box<CopyMoveExplore>),
    MoveExploreDir(Box<CopyMoveExplore>),
    MoveExploreDirLink(Box<CopyMoveExplore>),
    ChAttrsExploreDir { attrs: Box<ChAttrs> },
    ChAttrsResolveLink { attrs: Box<ChAttrs> },
    ChAttrsExploreDirLink { attrs: Box<ChAttrs> },
    UploadCopyExploreDir(Box<UploadExplore>),
    UploadMoveExploreDir(Box<UploadExplore>),
    // --- terminal items ---
    DeleteLink { is_hidden: bool },
    DeleteFile { is_hidden: bool },
    DeleteDir { counters: DirCounters, is_top_level: bool, is_hidden: bool },
    CopyFileOrFileLink(Box<CopyMoveFile>),
    MoveFileOrFileLink(Box<CopyMoveFile>),
    MoveDeleteDir { counters: DirCounters },
    MoveDeleteDirLink { counters: DirCounters },
    ChAttrsFile { attrs: Box<ChAttrs> },
    ChAttrsDir { counters: DirCounters, attrs: Box<ChAttrs> },
    UploadCopyFile(Box<UploadFile>),
    UploadMoveFile(Box<UploadFile>),
    UploadMoveDeleteDir { counters: DirCounters },
}

impl ItemKind {
    /// Explore and resolve items expand into child items at runtime and are
    /// dispatched before any terminal item.
    pub fn is_explore_or_resolve(&self) -> bool {
        use ItemKind::*;
        matches!(
            self,
            DeleteExploreDir { .. }
                | CopyResolveLink(_)
                | MoveResolveLink(_)
                | CopyExploreDir(_)
                | MoveExploreDir(_)
                | MoveExploreDirLink(_)
                | ChAttrsExploreDir { .. }
                | ChAttrsResolveLink { .. }
                | ChAttrsExploreDirLink { .. }
                | UploadCopyExploreDir(_)
                | UploadMoveExploreDir(_)
        )
    }

    /// Whether this item type may own children (and therefore counters).
    pub fn is_dir_item(&self) -> bool {
        self.dir_counters().is_some()
    }

    pub fn dir_counters(&self) -> Option<&DirCounters> {
        use ItemKind::*;
        match self {
            DeleteDir { counters, .. }
            | MoveDeleteDir { counters }
            | MoveDeleteDirLink { counters }
            | ChAttrsDir { counters, .. }
            | UploadMoveDeleteDir { counters } => Some(counters),
            _ => None,
        }
    }

    pub fn dir_counters_mut(&mut self) -> Option<&mut DirCounters> {
        use ItemKind::*;
        match self {
            DeleteDir { counters, .. }
            | MoveDeleteDir { counters }
            | MoveDeleteDirLink { counters }
            | ChAttrsDir { counters, .. }
            | UploadMoveDeleteDir { counters } => Some(counters),
            _ => None,
        }
    }

    /// Short label for logs and the item listview.
    pub fn label(&self) -> &'static str {
        use ItemKind::*;
        match self {
            DeleteExploreDir { .. } => "delete-explore",
            CopyResolveLink(_) => "copy-resolve-link",
            MoveResolveLink(_) => "move-resolve-link",
            CopyExploreDir(_) => "copy-explore",
            MoveExploreDir(_) => "move-explore",
            MoveExploreDirLink(_) => "move-explore-link",
            ChAttrsExploreDir { .. } => "chattr-explore",
            ChAttrsResolveLink { .. } => "chattr-resolve-link",
            ChAttrsExploreDirLink { .. } => "chattr-explore-link",
            UploadCopyExploreDir(_) => "upload-copy-explore",
            UploadMoveExploreDir(_) => "upload-move-explore",
            DeleteLink { .. } => "delete-link",
            DeleteFile { .. } => "delete-file",
            DeleteDir { .. } => "delete-dir",
            CopyFileOrFileLink(_) => "copy-file",
            MoveFileOrFileLink(_) => "move-file",
            MoveDeleteDir { .. } => "move-delete-dir",
            MoveDeleteDirLink { .. } => "move-delete-dir-link",
            ChAttrsFile { .. } => "chattr-file",
            ChAttrsDir { .. } => "chattr-dir",
            UploadCopyFile(_) => "upload-copy-file",
            UploadMoveFile(_) => "upload-move-file",
            UploadMoveDeleteDir { .. } => "upload-move-delete-dir",
        }
    }
}

/// One entry of the operation queue.
///
/// Construction happens outside the queue (so batches can be wired up
/// parent-to-child first); once inserted, all access goes through the queue
/// under its lock.
#[derive(Debug, Clone)]
pub struct Item {
    pub uid: ItemId,
    /// None = top-level item owned directly by the operation.
    pub parent: Option<ItemId>,
    pub state: ItemState,
    pub problem: ProblemKind,
    pub os_error: Option<i32>,
    /// Free-text error detail, usually a verbatim server reply.
    pub err_descr: Option<String>,
    /// Monotonic tick of the moment the item entered an error state;
    /// 0 = no error occurred.
    pub error_time: u64,
    pub forced: ForcedAction,
    /// Source path (server path, or disk path for upload sources).
    pub path: String,
    pub name: String,
    pub kind: ItemKind,
}

impl Item {
    pub fn new(
        parent: Option<ItemId>,
        state: ItemState,
        path: impl Into<String>,
        name: impl Into<String>,
        kind: ItemKind,
    ) -> Self {
        Item {
            uid: next_item_uid(),
            parent,
            state,
            problem: ProblemKind::Ok,
            os_error: None,
            err_descr: None,
            error_time: 0,
            forced: ForcedAction::None,
            path: path.into(),
            name: name.into(),
            kind,
        }
    }

    /// Full description of the current problem for the host dialog.
    pub fn problem_text(&self) -> String {
        self.problem.describe(self.os_error, self.err_descr.as_deref())
    }

    /// Enabler for the host dialog buttons: (solve, skip, retry).
    pub fn error_buttons(&self) -> (bool, bool, bool) {
        if !self.state.is_error() {
            return (false, false, false);
        }
        let solvable = !self.problem.is_unsolvable()
            && matches!(self.state, ItemState::Failed | ItemState::UserInputNeeded);
        let retry = self.state != ItemState::ForcedToFail;
        let skip = self.state != ItemState::Skipped;
        (solvable, skip, retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_allocation_is_monotonic() {
        let a = next_item_uid();
        let b = next_item_uid();
        assert!(b > a);
    }

    #[test]
    fn explore_group_precedes_terminal_group() {
        let explore = ItemKind::DeleteExploreDir { is_top_level: true, is_hidden: false };
        let terminal = ItemKind::DeleteFile { is_hidden: false };
        assert!(explore.is_explore_or_resolve());
        assert!(!terminal.is_explore_or_resolve());
    }

    #[test]
    fn counters_imply_parent_state() {
        let mut c = DirCounters::default();
        assert_eq!(c.implied_state(), ItemState::Waiting);
        c.not_done = 2;
        assert_eq!(c.implied_state(), ItemState::Delayed);
        c.skipped = 1;
        assert_eq!(c.implied_state(), ItemState::ForcedToFail);
    }

    #[test]
    fn error_buttons_follow_state_and_problem() {
        let mut item = Item::new(
            None,
            ItemState::Waiting,
            "/data",
            "a.txt",
            ItemKind::DeleteFile { is_hidden: false },
        );
        assert_eq!(item.error_buttons(), (false, false, false));
        item.state = ItemState::UserInputNeeded;
        item.problem = ProblemKind::FileIsHidden;
        assert_eq!(item.error_buttons(), (true, true, true));
        item.state = ItemState::ForcedToFail;
        let (_, skip, retry) = item.error_buttons();
        assert!(skip);
        assert!(!retry);
    }
}
