use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::cache::ServerKey;
use crate::config::{Config, PolicyTable};
use crate::error::ProblemKind;
use crate::ftp::listing::PathStyle;
use crate::item::ForcedAction;
use crate::queue::Queue;
use crate::speed::{BlockSizeEstimator, TransferSpeedMeter};
use crate::worker::{WorkerEvent, WorkerHandle, WorkerStatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Delete,
    CopyDownload,
    MoveDownload,
    ChangeAttrs,
    CopyUpload,
    MoveUpload,
}

impl OperationKind {
    pub fn is_upload(self) -> bool {
        matches!(self, OperationKind::CopyUpload | OperationKind::MoveUpload)
    }

    pub fn is_download(self) -> bool {
        matches!(self, OperationKind::CopyDownload | OperationKind::MoveDownload)
    }

    /// Whether this operation mutates the server-side tree it works on.
    pub fn mutates_server(self) -> bool {
        !matches!(self, OperationKind::CopyDownload)
    }

    pub fn label(self) -> &'static str {
        match self {
            OperationKind::Delete => "Delete",
            OperationKind::CopyDownload => "Download",
            OperationKind::MoveDownload => "Download+Delete",
            OperationKind::ChangeAttrs => "ChAttrs",
            OperationKind::CopyUpload => "Upload",
            OperationKind::MoveUpload => "Upload+Delete",
        }
    }
}

/// Aggregate state reported to the host dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    InProgress,
    SuccessfullyFinished,
    FinishedWithSkips,
    FinishedWithErrors,
}

/// Connection parameters for every worker of the operation.
#[derive(Debug, Clone)]
pub struct ServerParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub account: Option<String>,
    /// Custom proxy login macro; None = the standard USER/PASS chain.
    pub proxy_script: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    /// Commands issued once after login (per connection).
    pub init_commands: Vec<String>,
    /// Override for the LIST command.
    pub list_command: Option<String>,
    /// SYST answer cached from a previous session.
    pub server_system: Option<String>,
    pub use_passive_mode: bool,
    /// Observe the AUTH TLS / PBSZ / PROT sequence during login.
    pub use_tls: bool,
    /// Offer MODE Z after login and record whether the server agreed.
    pub offer_compression: bool,
    /// Reconnect after an auth failure without asking for new credentials.
    pub retry_login_without_asking: bool,
}

impl ServerParams {
    pub fn key(&self) -> ServerKey {
        ServerKey::new(self.user.clone(), self.host.clone(), self.port)
    }
}

/// ASCII/binary selection parameters, copied from the config at start.
#[derive(Debug, Clone)]
pub struct AsciiDetection {
    pub auto_detect: bool,
    pub use_ascii: bool,
    pub masks: Vec<String>,
}

impl AsciiDetection {
    pub fn ascii_mode_for(&self, name: &str) -> bool {
        if self.auto_detect {
            self.masks.iter().any(|m| crate::util::wildcard_match(m, name))
        } else {
            self.use_ascii
        }
    }
}

/// Everything fixed at operation creation.
#[derive(Debug, Clone)]
pub struct OperationParams {
    pub kind: OperationKind,
    pub server: ServerParams,
    pub style: PathStyle,
    /// Server path for delete/chattr/download sources, disk path for upload.
    pub source_path: String,
    /// Disk path for download, server path for upload; unused for delete.
    pub target_path: String,
    pub policies: PolicyTable,
    pub ascii: AsciiDetection,
    pub use_listing_cache: bool,
    pub resume_min_file_size: u64,
    /// Requested mode bits for change-attributes operations.
    pub attr_mode: Option<u32>,
    pub buf_size: usize,
    /// Transient-reply retries per command before the item fails.
    pub max_retries: usize,
    /// Base delay between those retries; attempts back off linearly.
    pub retry_delay_ms: u64,
    pub reconnect_delay_secs: u64,
}

impl OperationParams {
    /// Bundle the per-operation knobs out of the config.
    pub fn from_config(
        kind: OperationKind,
        server: ServerParams,
        style: PathStyle,
        source_path: String,
        target_path: String,
        config: &Config,
    ) -> Self {
        let policies =
            if kind.is_upload() { config.upload_policies } else { config.download_policies };
        OperationParams {
            kind,
            server,
            style,
            source_path,
            target_path,
            policies,
            ascii: AsciiDetection {
                auto_detect: config.auto_detect_transfer_mode,
                use_ascii: config.use_ascii_transfer_mode,
                masks: config.ascii_file_masks.clone(),
            },
            use_listing_cache: config.use_listings_cache,
            resume_min_file_size: config.resume_min_file_size,
            attr_mode: None,
            buf_size: config.buf_size,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            reconnect_delay_secs: config.reconnect_delay_secs,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    total_bytes: u64,
    total_blocks: u64,
    /// Files whose size the listing did not reveal.
    unknown_size_count: u32,
    done_bytes: u64,
}

/// Copy/upload progress snapshot for the host dialog.
#[derive(Debug, Clone, Copy)]
pub struct CopyProgress {
    pub transferred: u64,
    pub total: u64,
    pub waiting: u32,
    pub unknown_size_count: u32,
    pub errors_count: u32,
    pub done_or_skipped_count: u32,
    pub total_count: u32,
}

/// Pair-coalesced change notification: up to two uids are remembered, a
/// third collapses the report into "refresh everything" (the -1 sentinel).
#[derive(Debug, Default)]
struct ChangeReport {
    items: Option<(i64, i64)>,
    worker: Option<(i64, bool)>,
}

/// A source/target path whose content changed; the host panel refreshes it
/// after the operation ends.
#[derive(Debug, Clone)]
pub struct ChangedPath {
    pub path: String,
    pub including_subdirs: bool,
    /// Lazy notification only (refresh on next activation).
    pub soft_refresh: bool,
}

/// One bulk operation: the queue, the workers, the shared counters and the
/// parameters every worker consults. Lives behind an `Arc`; the lock order is
/// operation before queue before worker.
pub struct Operation {
    uid: AtomicU32,
    pub params: OperationParams,
    pub queue: Queue,
    policies: Mutex<PolicyTable>,
    totals: Mutex<Totals>,
    explored: Mutex<HashSet<String>>,
    pub global_speed: Mutex<TransferSpeedMeter>,
    block_estimator: Mutex<BlockSizeEstimator>,
    changes: Mutex<ChangeReport>,
    change_paths: Mutex<Vec<ChangedPath>>,
    /// Error-time watermark of the last error shown by the host dialog.
    error_watermark: Mutex<u64>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Operation {
    pub fn new(params: OperationParams) -> Self {
        let policies = params.policies;
        Operation {
            uid: AtomicU32::new(0),
            params,
            queue: Queue::new(),
            policies: Mutex::new(policies),
            totals: Mutex::new(Totals::default()),
            explored: Mutex::new(HashSet::new()),
            global_speed: Mutex::new(TransferSpeedMeter::default()),
            block_estimator: Mutex::new(BlockSizeEstimator::default()),
            changes: Mutex::new(ChangeReport::default()),
            change_paths: Mutex::new(Vec::new()),
            error_watermark: Mutex::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_uid(&self, uid: u32) {
        self.uid.store(uid, Ordering::Relaxed);
    }

    /// Current policy table (solve-for-all decisions mutate it mid-run).
    pub fn policies(&self) -> PolicyTable {
        *self.policies.lock().expect("policy lock")
    }

    /// Promote a per-item resolution to the operation-wide default ("apply to
    /// all further items").
    pub fn promote_policy(&self, problem: ProblemKind, forced: ForcedAction) {
        use crate::config::{DirExistsPolicy, FileExistsPolicy};
        let mut table = self.policies.lock().expect("policy lock");
        let file_choice = match forced {
            ForcedAction::UseAutorename | ForcedAction::UploadForceAutorename => {
                Some(FileExistsPolicy::AutoRename)
            }
            ForcedAction::Resume => Some(FileExistsPolicy::Resume),
            ForcedAction::ResumeOrOverwrite | ForcedAction::ReduceFileSizeAndResume => {
                Some(FileExistsPolicy::ResumeOrOverwrite)
            }
            ForcedAction::Overwrite => Some(FileExistsPolicy::Overwrite),
            _ => None,
        };
        match problem {
            ProblemKind::TgtFileAlreadyExists | ProblemKind::UploadTgtFileAlreadyExists => {
                if let Some(choice) = file_choice {
                    table.file_already_exists = choice;
                }
            }
            ProblemKind::RetryOnCreatedFile => {
                if let Some(choice) = file_choice {
                    table.retry_on_created_file = choice;
                }
            }
            ProblemKind::RetryOnResumedFile => {
                if let Some(choice) = file_choice {
                    table.retry_on_resumed_file = choice;
                }
            }
            ProblemKind::TgtDirAlreadyExists | ProblemKind::UploadTgtDirAlreadyExists => {
                table.dir_already_exists = match forced {
                    ForcedAction::UseAutorename => DirExistsPolicy::AutoRename,
                    ForcedAction::UseExistingDir => DirExistsPolicy::JoinExisting,
                    _ => table.dir_already_exists,
                };
            }
            _ => {}
        }
    }

    // --- size totals -----------------------------------------------------

    pub fn add_total_bytes(&self, bytes: u64) {
        self.totals.lock().expect("totals lock").total_bytes += bytes;
    }

    pub fn add_total_blocks(&self, blocks: u64) {
        self.totals.lock().expect("totals lock").total_blocks += blocks;
    }

    pub fn add_unknown_size(&self) {
        self.totals.lock().expect("totals lock").unknown_size_count += 1;
    }

    pub fn sub_unknown_size(&self) {
        let mut totals = self.totals.lock().expect("totals lock");
        totals.unknown_size_count = totals.unknown_size_count.saturating_sub(1);
    }

    /// Data moved on some worker's data connection; feeds both the byte
    /// progress and the operation-wide speed meter.
    pub fn add_done_bytes(&self, n: u64) {
        self.totals.lock().expect("totals lock").done_bytes += n;
        self.global_speed.lock().expect("speed lock").add_bytes(n);
    }

    /// Feed the block-size estimator with a file of known size in both units.
    pub fn add_block_sample(&self, bytes: u64, blocks: u64) {
        self.block_estimator.lock().expect("estimator lock").add_sample(bytes, blocks);
    }

    pub fn blocks_to_bytes(&self, blocks: u64) -> u64 {
        self.block_estimator.lock().expect("estimator lock").blocks_to_bytes(blocks)
    }

    /// Byte progress per the dialog: done / (bytes + estimated block bytes).
    pub fn copy_progress(&self) -> CopyProgress {
        let totals = *self.totals.lock().expect("totals lock");
        let counts = self.queue.counts();
        let estimated =
            totals.total_bytes + self.blocks_to_bytes(totals.total_blocks);
        CopyProgress {
            transferred: totals.done_bytes,
            total: estimated,
            waiting: counts.waiting_processing_delayed,
            unknown_size_count: totals.unknown_size_count,
            errors_count: counts.failed + counts.ui_needed,
            done_or_skipped_count: counts.done_or_skipped(),
            total_count: counts.total,
        }
    }

    pub fn operation_state(&self) -> OperationState {
        let counts = self.queue.counts();
        if !counts.is_quiescent() {
            return OperationState::InProgress;
        }
        if counts.failed > 0 || counts.ui_needed > 0 {
            OperationState::FinishedWithErrors
        } else if counts.skipped > 0 {
            OperationState::FinishedWithSkips
        } else {
            OperationState::SuccessfullyFinished
        }
    }

    // --- explored paths --------------------------------------------------

    /// Record a server path before exploring it. Returns false when the path
    /// was explored before — the symlink-loop guard. Paths are stored
    /// verbatim, no canonicalization.
    pub fn explored_paths_insert(&self, path: &str) -> bool {
        self.explored.lock().expect("explored lock").insert(path.to_string())
    }

    // --- error walk ------------------------------------------------------

    /// Earliest error the host has not shown yet; advances the watermark.
    pub fn next_unseen_error(&self) -> Option<crate::item::ItemId> {
        let mut watermark = self.error_watermark.lock().expect("watermark lock");
        let (uid, time) = self.queue.find_oldest_error_above(*watermark)?;
        *watermark = time;
        Some(uid)
    }

    // --- change notifications -------------------------------------------

    /// Remember that an item changed; pair-coalesced with the -1 sentinel
    /// standing for "more than two changed, refresh everything".
    pub fn report_item_changed(&self, uid: crate::item::ItemId) {
        let mut changes = self.changes.lock().expect("changes lock");
        changes.items = match changes.items {
            None => Some((uid as i64, -1)),
            Some((-1, -1)) => Some((-1, -1)),
            Some((first, -1)) if first == uid as i64 => Some((first, -1)),
            Some((first, -1)) => Some((first, uid as i64)),
            Some((first, second)) if first == uid as i64 || second == uid as i64 => {
                Some((first, second))
            }
            Some(_) => Some((-1, -1)),
        };
    }

    /// Take the coalesced item-change report: (uid1, uid2), -1 = none/all.
    pub fn get_changed_items(&self) -> Option<(i64, i64)> {
        self.changes.lock().expect("changes lock").items.take()
    }

    pub fn report_worker_changed(&self, worker_id: u32, report_progress: bool) {
        let mut changes = self.changes.lock().expect("changes lock");
        changes.worker = match changes.worker {
            None => Some((worker_id as i64, report_progress)),
            Some((id, progress)) if id == worker_id as i64 => {
                Some((id, progress || report_progress))
            }
            Some((_, progress)) => Some((-1, progress || report_progress)),
        };
    }

    pub fn get_changed_worker(&self) -> Option<(i64, bool)> {
        self.changes.lock().expect("changes lock").worker.take()
    }

    /// Note a path whose content this operation changed, for the panel
    /// refresh after the operation ends.
    pub fn note_change_path(&self, path: &str, including_subdirs: bool, soft_refresh: bool) {
        let mut paths = self.change_paths.lock().expect("paths lock");
        if !paths.iter().any(|p| p.path == path) {
            paths.push(ChangedPath {
                path: path.to_string(),
                including_subdirs,
                soft_refresh,
            });
        }
    }

    pub fn take_change_paths(&self) -> Vec<ChangedPath> {
        std::mem::take(&mut *self.change_paths.lock().expect("paths lock"))
    }

    // --- admission control ----------------------------------------------

    /// Whether this operation mutates the given server path (exact or under
    /// one of its mutation roots). Used by cross-operation admission checks.
    pub fn mutates_server_path(&self, key: &ServerKey, path: &str, style: PathStyle) -> bool {
        if !self.params.kind.mutates_server() || style != self.params.style {
            return false;
        }
        if self.params.server.key() != *key {
            return false;
        }
        let root: &str = if self.params.kind.is_upload() {
            &self.params.target_path
        } else {
            &self.params.source_path
        };
        path_is_or_under(path, root, style)
    }

    pub fn is_uploading_to_server(&self, key: &ServerKey) -> bool {
        self.params.kind.is_upload() && self.params.server.key() == *key
    }

    // --- workers ---------------------------------------------------------

    pub fn add_worker(&self, handle: WorkerHandle) {
        self.workers.lock().expect("workers lock").push(handle);
    }

    /// Ask every worker to stop (graceful). `shouldStop` is monotone; a
    /// second call is harmless.
    pub fn stop_workers(&self) {
        for worker in self.workers.lock().expect("workers lock").iter() {
            worker.send(WorkerEvent::ShouldStop);
        }
    }

    pub fn pause_workers(&self, pause: bool) {
        let event = if pause { WorkerEvent::ShouldPause } else { WorkerEvent::ShouldResume };
        for worker in self.workers.lock().expect("workers lock").iter() {
            worker.send(event.clone());
        }
    }

    /// Block until every worker thread ended (teardown path).
    pub fn join_workers(&self) {
        let mut workers = self.workers.lock().expect("workers lock");
        for worker in workers.iter_mut() {
            worker.join();
        }
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatusSnapshot> {
        self.workers.lock().expect("workers lock").iter().map(|w| w.status()).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("workers lock").len()
    }
}

/// Path prefix test in the server's own path syntax.
fn path_is_or_under(path: &str, root: &str, style: PathStyle) -> bool {
    let sep = match style {
        PathStyle::Unix => '/',
        PathStyle::Windows => '\\',
        _ => '.',
    };
    let root_trim = root.trim_end_matches(sep);
    if path == root || path == root_trim {
        return true;
    }
    path.strip_prefix(root_trim)
        .map(|rest| rest.starts_with(sep))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Item, ItemKind, ItemState};

    fn params(kind: OperationKind) -> OperationParams {
        OperationParams::from_config(
            kind,
            ServerParams {
                host: "ftp.example.com".into(),
                port: 21,
                user: "joe".into(),
                password: Some("pw".into()),
                account: None,
                proxy_script: None,
                proxy_host: None,
                proxy_port: None,
                proxy_user: None,
                proxy_password: None,
                init_commands: Vec::new(),
                list_command: None,
                server_system: None,
                use_passive_mode: true,
                use_tls: false,
                offer_compression: false,
                retry_login_without_asking: false,
            },
            PathStyle::Unix,
            "/out".into(),
            "/in/tray".into(),
            &Config::default(),
        )
    }

    #[test]
    fn explored_paths_flag_revisits() {
        let op = Operation::new(params(OperationKind::CopyDownload));
        assert!(op.explored_paths_insert("/data/a"));
        assert!(!op.explored_paths_insert("/data/a"));
        // Verbatim comparison: a differently spelled path is a new path.
        assert!(op.explored_paths_insert("/data/a/"));
    }

    #[test]
    fn progress_combines_bytes_and_blocks() {
        let op = Operation::new(params(OperationKind::CopyDownload));
        op.add_total_bytes(10_000);
        op.add_total_blocks(4);
        op.add_block_sample(8192, 4);
        op.add_done_bytes(1_000);
        let progress = op.copy_progress();
        assert_eq!(progress.transferred, 1_000);
        assert_eq!(progress.total, 10_000 + 8192);
    }

    #[test]
    fn state_reflects_queue_outcome() {
        let op = Operation::new(params(OperationKind::Delete));
        let item = Item::new(
            None,
            ItemState::Waiting,
            "/out",
            "a.txt",
            ItemKind::DeleteFile { is_hidden: false },
        );
        let uid = item.uid;
        op.queue.add_item(item);
        assert_eq!(op.operation_state(), OperationState::InProgress);
        op.queue.update_item_state(uid, ItemState::Done, ProblemKind::Ok, None, None);
        assert_eq!(op.operation_state(), OperationState::SuccessfullyFinished);
    }

    #[test]
    fn change_items_coalesce_to_sentinel() {
        let op = Operation::new(params(OperationKind::Delete));
        op.report_item_changed(10);
        op.report_item_changed(11);
        assert_eq!(op.get_changed_items(), Some((10, 11)));
        op.report_item_changed(1);
        op.report_item_changed(2);
        op.report_item_changed(3);
        assert_eq!(op.get_changed_items(), Some((-1, -1)));
        assert_eq!(op.get_changed_items(), None);
    }

    #[test]
    fn upload_mutation_root_is_the_target_path() {
        let op = Operation::new(params(OperationKind::CopyUpload));
        let key = op.params.server.key();
        assert!(op.mutates_server_path(&key, "/in/tray", PathStyle::Unix));
        assert!(op.mutates_server_path(&key, "/in/tray/sub", PathStyle::Unix));
        assert!(!op.mutates_server_path(&key, "/in/trayx", PathStyle::Unix));
        assert!(!op.mutates_server_path(&key, "/other", PathStyle::Unix));
        let other = ServerKey::new("joe", "other.example.com", 21);
        assert!(!op.mutates_server_path(&other, "/in/tray", PathStyle::Unix));
    }

    #[test]
    fn plain_download_does_not_mutate_server() {
        let op = Operation::new(params(OperationKind::CopyDownload));
        let key = op.params.server.key();
        assert!(!op.mutates_server_path(&key, "/out", PathStyle::Unix));
    }

    #[test]
    fn promote_policy_applies_for_all() {
        use crate::config::FileExistsPolicy;
        let op = Operation::new(params(OperationKind::CopyUpload));
        op.promote_policy(ProblemKind::UploadTgtFileAlreadyExists, ForcedAction::Overwrite);
        assert_eq!(op.policies().file_already_exists, FileExistsPolicy::Overwrite);
    }
}
