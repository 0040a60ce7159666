use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{CacheFetchOutcome, CachedItem, CachedSize, GetListing};
use crate::config::{CannotCreatePolicy, DirExistsPolicy, FileExistsPolicy};
use crate::disk::DiskWorkKind;
use crate::error::ProblemKind;
use crate::ftp::control::TransferType;
use crate::ftp::listing::ListingEntryKind;
use crate::item::{
    DirCounters, ForcedAction, Item, ItemKind, ItemState, TgtFileState, UploadExplore, UploadFile,
};
use crate::opened_files::AccessType;

use super::explore::ListFetch;
use super::{CwdFailure, DataSetupError, Flow, ItemOutcome, Worker, WorkerSubState};

/// Give up autorename after this many candidates; the server is rejecting
/// everything and the user should see it.
const AUTORENAME_PHASE_LIMIT: u32 = 40;

/// Result of resolving a target name against the (cached) listing.
enum TargetLookup {
    Entry(Option<CachedItem>),
    Stop,
    ConnectionLost,
    Failed(ProblemKind, Option<String>),
}

impl Worker {
    // --- target listing resolution ---------------------------------------

    /// Resolve `name` in the target path listing, fetching through the shared
    /// cache (or directly when the cache is disabled). Blocks while another
    /// worker fetches the same path.
    fn lookup_target(&mut self, tgt_path: &str, name: &str) -> TargetLookup {
        let key = self.op.params.server.key();
        let style = self.op.params.style;
        if !self.op.params.use_listing_cache {
            return match self.fetch_target_entries(tgt_path) {
                FetchedTarget::Entries(entries) => TargetLookup::Entry(
                    entries
                        .iter()
                        .find(|e| e.name == name)
                        .map(|e| CachedItem {
                            name: e.name.clone(),
                            kind: e.kind,
                            size: match e.size {
                                crate::ftp::listing::SizeInfo::Bytes(b) => CachedSize::Bytes(b),
                                _ => CachedSize::Unknown,
                            },
                        }),
                ),
                FetchedTarget::Stop => TargetLookup::Stop,
                FetchedTarget::ConnectionLost => TargetLookup::ConnectionLost,
                FetchedTarget::Failed(problem, text) => TargetLookup::Failed(problem, text),
            };
        }
        loop {
            if self.poll_control() == Flow::Stop {
                return TargetLookup::Stop;
            }
            let worker_tx = self.cache_tx.clone();
            match self.cache.get_listing(&key, tgt_path, style, self.id, &worker_tx, name) {
                GetListing::Ready { entry } => return TargetLookup::Entry(entry),
                GetListing::NotAccessible => {
                    return TargetLookup::Failed(ProblemKind::UploadCannotListTgtPath, None);
                }
                GetListing::MustFetch => {
                    self.set_sub_state(WorkerSubState::WaitingForListing);
                    match self.fetch_target_bytes(tgt_path) {
                        FetchedBytes::Data(bytes) => {
                            let hint =
                                self.conn.as_ref().and_then(|c| c.server_system.clone());
                            let parsed = self.cache.listing_finished(
                                &key,
                                tgt_path,
                                style,
                                &bytes,
                                hint.as_deref(),
                                self.parser.as_ref(),
                            );
                            if !parsed {
                                return TargetLookup::Failed(
                                    ProblemKind::UnableToParseListing,
                                    None,
                                );
                            }
                        }
                        FetchedBytes::Stop => {
                            self.cache.listing_failed(&key, tgt_path, style, false);
                            return TargetLookup::Stop;
                        }
                        FetchedBytes::ConnectionLost => {
                            self.cache.listing_failed(&key, tgt_path, style, false);
                            return TargetLookup::ConnectionLost;
                        }
                        FetchedBytes::NotAccessible(text) => {
                            self.cache.listing_failed(&key, tgt_path, style, true);
                            return TargetLookup::Failed(
                                ProblemKind::UploadCannotListTgtPath,
                                Some(text),
                            );
                        }
                        FetchedBytes::Error(text) => {
                            self.cache.listing_failed(&key, tgt_path, style, false);
                            return TargetLookup::Failed(
                                ProblemKind::UploadCannotListTgtPath,
                                Some(text),
                            );
                        }
                    }
                }
                GetListing::Wait => {
                    // Another worker is listing the same path; wait for its
                    // cache event, staying responsive to control events.
                    self.set_sub_state(WorkerSubState::WaitingForListing);
                    let cache_rx = self.cache_rx.clone();
                    let events = self.events.clone();
                    loop {
                        crossbeam_channel::select! {
                            recv(cache_rx) -> event => {
                                match event {
                                    Ok(ev) if ev.path == tgt_path => {
                                        match ev.outcome {
                                            CacheFetchOutcome::NotAccessible => {
                                                return TargetLookup::Failed(
                                                    ProblemKind::UploadCannotListTgtPath,
                                                    None,
                                                );
                                            }
                                            _ => break,
                                        }
                                    }
                                    Ok(_) => continue,
                                    Err(_) => break,
                                }
                            }
                            recv(events) -> event => {
                                match event {
                                    Ok(ev) => self.handle_event(ev),
                                    Err(_) => self.should_stop = true,
                                }
                                if self.should_stop {
                                    return TargetLookup::Stop;
                                }
                            }
                            default(Duration::from_secs(2)) => break,
                        }
                    }
                }
            }
        }
    }

    /// CWD to the target path and pull its listing bytes.
    fn fetch_target_bytes(&mut self, tgt_path: &str) -> FetchedBytes {
        match self.ensure_working_dir(tgt_path) {
            Ok(()) => {}
            Err(CwdFailure::Transport(super::CmdError::Stopping)) => return FetchedBytes::Stop,
            Err(CwdFailure::Transport(super::CmdError::ConnectionLost)) => {
                return FetchedBytes::ConnectionLost;
            }
            Err(CwdFailure::Refused(_, text)) => return FetchedBytes::NotAccessible(text),
        }
        match self.fetch_dir_listing() {
            ListFetch::Data(bytes) => FetchedBytes::Data(bytes),
            ListFetch::Stopping => FetchedBytes::Stop,
            ListFetch::ConnectionLost => FetchedBytes::ConnectionLost,
            ListFetch::Refused(text) | ListFetch::Incomplete(text) => FetchedBytes::Error(text),
            ListFetch::ListenFailed(msg) => FetchedBytes::Error(msg),
        }
    }

    /// Cache-less variant: fetch and parse, nothing shared.
    fn fetch_target_entries(&mut self, tgt_path: &str) -> FetchedTarget {
        match self.fetch_target_bytes(tgt_path) {
            FetchedBytes::Data(bytes) => {
                let hint = self.conn.as_ref().and_then(|c| c.server_system.clone());
                match self.parser.parse_listing(&bytes, hint.as_deref(), self.op.params.style) {
                    Ok(entries) => FetchedTarget::Entries(entries),
                    Err(_) => {
                        FetchedTarget::Failed(ProblemKind::UnableToParseListing, None)
                    }
                }
            }
            FetchedBytes::Stop => FetchedTarget::Stop,
            FetchedBytes::ConnectionLost => FetchedTarget::ConnectionLost,
            FetchedBytes::NotAccessible(text) | FetchedBytes::Error(text) => {
                FetchedTarget::Failed(ProblemKind::UploadCannotListTgtPath, Some(text))
            }
        }
    }

    // --- upload explore ---------------------------------------------------

    /// Explore one local directory: create its server counterpart (collision
    /// policies apply), list the local content through the disk thread and
    /// expand into child items.
    pub(super) fn run_upload_explore(&mut self, item: &Item) -> ItemOutcome {
        let (explore, is_move) = match &item.kind {
            ItemKind::UploadCopyExploreDir(e) => (e.as_ref().clone(), false),
            ItemKind::UploadMoveExploreDir(e) => (e.as_ref().clone(), true),
            _ => return ItemOutcome::Finished,
        };
        let created = match self.create_server_dir(item, &explore) {
            Ok(name) => name,
            Err(outcome) => return outcome,
        };
        let server_child_path = self.op.params.style.join(&explore.tgt_path, &created);

        // Local listing comes from the disk thread; the worker never touches
        // the filesystem directly.
        self.set_sub_state(WorkerSubState::WaitingForDisk);
        let source_dir = PathBuf::from(&item.path).join(&item.name);
        let out = match self.disk.run(DiskWorkKind::ListDir { path: source_dir.clone() }) {
            Ok(out) => out,
            Err(_) => {
                self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                return ItemOutcome::Finished;
            }
        };
        if out.problem != ProblemKind::Ok {
            self.fail_item(item.uid, out.problem, out.os_error, None);
            return ItemOutcome::Finished;
        }
        let entries = out.entries.unwrap_or_default();

        let child_count = entries.len() as u32;
        let mut batch = Vec::new();
        let parent_for_children = if is_move {
            let dir_item = Item::new(
                item.parent,
                if child_count == 0 { ItemState::Waiting } else { ItemState::Delayed },
                item.path.clone(),
                item.name.clone(),
                ItemKind::UploadMoveDeleteDir {
                    counters: DirCounters { not_done: child_count, ..DirCounters::default() },
                },
            );
            let uid = dir_item.uid;
            batch.push(dir_item);
            Some(uid)
        } else {
            item.parent
        };

        let source_dir_str = source_dir.to_string_lossy().to_string();
        for entry in entries {
            if entry.is_dir {
                let kind = if is_move {
                    ItemKind::UploadMoveExploreDir(Box::new(UploadExplore {
                        tgt_path: server_child_path.clone(),
                        tgt_name: entry.name.clone(),
                    }))
                } else {
                    ItemKind::UploadCopyExploreDir(Box::new(UploadExplore {
                        tgt_path: server_child_path.clone(),
                        tgt_name: entry.name.clone(),
                    }))
                };
                batch.push(Item::new(
                    parent_for_children,
                    ItemState::Waiting,
                    source_dir_str.clone(),
                    entry.name,
                    kind,
                ));
            } else {
                match entry.size {
                    Some(b) => self.op.add_total_bytes(b),
                    None => self.op.add_unknown_size(),
                }
                let ascii = self.op.params.ascii.ascii_mode_for(&entry.name);
                let payload = Box::new(UploadFile {
                    tgt_path: server_child_path.clone(),
                    tgt_name: entry.name.clone(),
                    size: entry.size,
                    size_in_bytes: true,
                    ascii_mode: ascii,
                    ignore_ascii_for_binary: false,
                    autorename_phase: 0,
                    renamed_name: None,
                    size_with_crlf_eols: None,
                    number_of_eols: None,
                    tgt_file_state: TgtFileState::Unknown,
                });
                let kind = if is_move {
                    ItemKind::UploadMoveFile(payload)
                } else {
                    ItemKind::UploadCopyFile(payload)
                };
                batch.push(Item::new(
                    parent_for_children,
                    ItemState::Waiting,
                    source_dir_str.clone(),
                    entry.name,
                    kind,
                ));
            }
        }
        self.op.queue.replace_item_with_list(item.uid, batch);
        self.op.report_item_changed(item.uid);
        ItemOutcome::Finished
    }

    /// Create the server-side directory for an explore, resolving collisions
    /// against the cached target listing. Returns the name actually used.
    fn create_server_dir(
        &mut self,
        item: &Item,
        explore: &UploadExplore,
    ) -> Result<String, ItemOutcome> {
        let key = self.op.params.server.key();
        let style = self.op.params.style;
        let mut phase = 0u32;
        let mut candidate = explore.tgt_name.clone();
        let force_autorename = matches!(
            item.forced,
            ForcedAction::UseAutorename
                | ForcedAction::UploadForceAutorename
                | ForcedAction::UploadContinueAutorename
        );
        loop {
            if phase > AUTORENAME_PHASE_LIMIT {
                self.fail_item(item.uid, ProblemKind::UploadCrDirAutoRenFailed, None, None);
                return Err(ItemOutcome::Finished);
            }
            let entry = match self.lookup_target(&explore.tgt_path, &candidate) {
                TargetLookup::Entry(entry) => entry,
                TargetLookup::Stop => return Err(ItemOutcome::Stopping),
                TargetLookup::ConnectionLost => return Err(ItemOutcome::ConnectionLost),
                TargetLookup::Failed(problem, text) => {
                    self.fail_item(item.uid, problem, None, text);
                    return Err(ItemOutcome::Finished);
                }
            };
            match entry {
                None => {
                    // Name free: create it.
                    match self.ensure_working_dir(&explore.tgt_path) {
                        Ok(()) => {}
                        Err(CwdFailure::Transport(e)) => return Err(e.outcome()),
                        Err(CwdFailure::Refused(problem, text)) => {
                            self.fail_item(item.uid, problem, None, Some(text));
                            return Err(ItemOutcome::Finished);
                        }
                    }
                    let reply = match self.command_with_auto_retry(&format!("MKD {}", candidate)) {
                        Ok(r) => r,
                        Err(e) => return Err(e.outcome()),
                    };
                    if reply.is_success() {
                        self.cache.report_create_dirs(&key, &explore.tgt_path, style, &candidate);
                        self.op.note_change_path(&explore.tgt_path, true, false);
                        return Ok(candidate);
                    }
                    // Lost a race or the name is unacceptable; the cache no
                    // longer matches reality on this path.
                    self.cache.report_unknown_change(&key, &explore.tgt_path, style);
                    if phase == 0 && !force_autorename {
                        self.fail_item(
                            item.uid,
                            ProblemKind::UploadCannotCreateTgtDir,
                            None,
                            Some(reply.text),
                        );
                        return Err(ItemOutcome::Finished);
                    }
                    phase += 1;
                    candidate = crate::util::autorename_candidate(&explore.tgt_name, phase);
                }
                Some(existing) if existing.kind == ListingEntryKind::Directory => {
                    let choice = if force_autorename {
                        DirExistsPolicy::AutoRename
                    } else if item.forced == ForcedAction::UseExistingDir {
                        DirExistsPolicy::JoinExisting
                    } else {
                        self.op.policies().dir_already_exists
                    };
                    match choice {
                        DirExistsPolicy::JoinExisting => return Ok(candidate),
                        DirExistsPolicy::AutoRename => {
                            phase += 1;
                            candidate =
                                crate::util::autorename_candidate(&explore.tgt_name, phase);
                        }
                        DirExistsPolicy::UserPrompt => {
                            self.ui_item(
                                item.uid,
                                ProblemKind::UploadTgtDirAlreadyExists,
                                None,
                                None,
                            );
                            return Err(ItemOutcome::Finished);
                        }
                        DirExistsPolicy::Skip => {
                            self.skip_item_as(item.uid, ProblemKind::UploadTgtDirAlreadyExists);
                            return Err(ItemOutcome::Finished);
                        }
                    }
                }
                Some(_file_in_way) => {
                    let choice = if force_autorename {
                        CannotCreatePolicy::AutoRename
                    } else {
                        self.op.policies().cannot_create_dir
                    };
                    match choice {
                        CannotCreatePolicy::AutoRename => {
                            phase += 1;
                            candidate =
                                crate::util::autorename_candidate(&explore.tgt_name, phase);
                        }
                        CannotCreatePolicy::UserPrompt => {
                            self.ui_item(
                                item.uid,
                                ProblemKind::UploadCannotCreateTgtDir,
                                None,
                                None,
                            );
                            return Err(ItemOutcome::Finished);
                        }
                        CannotCreatePolicy::Skip => {
                            self.skip_item_as(item.uid, ProblemKind::UploadCannotCreateTgtDir);
                            return Err(ItemOutcome::Finished);
                        }
                    }
                }
            }
        }
    }

    // --- upload file ------------------------------------------------------

    /// STOR/APPE of one local file, target resolved through the listing
    /// cache: fresh store, autorename, resume, overwrite or test-if-finished.
    pub(super) fn run_upload_file(&mut self, item: &Item) -> ItemOutcome {
        let (payload, is_move) = match &item.kind {
            ItemKind::UploadCopyFile(p) => (p.as_ref().clone(), false),
            ItemKind::UploadMoveFile(p) => (p.as_ref().clone(), true),
            _ => return ItemOutcome::Finished,
        };
        let key = self.op.params.server.key();
        let style = self.op.params.style;
        let Some(lock) = self.opened.open_file(
            &key.user,
            &key.host,
            key.port,
            &payload.tgt_path,
            style,
            &payload.tgt_name,
            AccessType::Write,
        ) else {
            self.fail_item(item.uid, ProblemKind::TgtFileInUse, None, None);
            return ItemOutcome::Finished;
        };
        let outcome = self.upload_locked(item, payload, is_move);
        self.opened.close_file(lock);
        outcome
    }

    fn upload_locked(&mut self, item: &Item, payload: UploadFile, is_move: bool) -> ItemOutcome {
        let mut phase = payload.autorename_phase;
        let mut name = payload
            .renamed_name
            .clone()
            .unwrap_or_else(|| payload.tgt_name.clone());
        loop {
            let entry = match self.lookup_target(&payload.tgt_path, &name) {
                TargetLookup::Entry(entry) => entry,
                TargetLookup::Stop => return ItemOutcome::Stopping,
                TargetLookup::ConnectionLost => return ItemOutcome::ConnectionLost,
                TargetLookup::Failed(problem, text) => {
                    self.fail_item(item.uid, problem, None, text);
                    return ItemOutcome::Finished;
                }
            };
            let action = self.upload_action(item, &payload, entry);
            match action {
                UploadAction::Store => {
                    return self.store_file(item, &payload, &name, is_move, None);
                }
                UploadAction::Overwrite => {
                    // Overwrite-by-delete keeps permissions predictable on
                    // servers where plain STOR would append-or-refuse.
                    if let Err(e) = self.delete_target_first(&payload.tgt_path, &name) {
                        return e;
                    }
                    return self.store_file(item, &payload, &name, is_move, None);
                }
                UploadAction::Resume { remote_size } => {
                    return self.store_file(item, &payload, &name, is_move, Some(remote_size));
                }
                UploadAction::Autorename => {
                    if phase >= AUTORENAME_PHASE_LIMIT {
                        self.fail_item(item.uid, ProblemKind::UploadFileAutoRenFailed, None, None);
                        return ItemOutcome::Finished;
                    }
                    phase += 1;
                    name = crate::util::autorename_candidate(&payload.tgt_name, phase);
                    let new_name = name.clone();
                    self.op.queue.update_payload(item.uid, |kind| {
                        if let ItemKind::UploadCopyFile(p) | ItemKind::UploadMoveFile(p) = kind {
                            p.autorename_phase = phase;
                            p.renamed_name = Some(new_name.clone());
                        }
                    });
                    continue;
                }
                UploadAction::TestIfFinished { remote_size } => {
                    return self.test_if_finished(item, &payload, &name, is_move, remote_size);
                }
                UploadAction::Prompt(problem) => {
                    self.ui_item(item.uid, problem, None, None);
                    return ItemOutcome::Finished;
                }
                UploadAction::Skip(problem) => {
                    self.skip_item_as(item.uid, problem);
                    return ItemOutcome::Finished;
                }
            }
        }
    }

    /// Pick the action for the resolved target entry from forced action,
    /// policies and the resume preconditions.
    fn upload_action(
        &self,
        item: &Item,
        payload: &UploadFile,
        entry: Option<CachedItem>,
    ) -> UploadAction {
        let Some(existing) = entry else {
            // Continue an interrupted autorename run with its current name.
            if item.forced == ForcedAction::UploadTestIfFinished {
                return UploadAction::TestIfFinished { remote_size: None };
            }
            return UploadAction::Store;
        };
        if existing.kind != ListingEntryKind::File {
            // A directory or link sits where the file should go.
            return match self.op.policies().cannot_create_file {
                CannotCreatePolicy::UserPrompt => {
                    UploadAction::Prompt(ProblemKind::UploadCannotCreateTgtFile)
                }
                CannotCreatePolicy::AutoRename => UploadAction::Autorename,
                CannotCreatePolicy::Skip => {
                    UploadAction::Skip(ProblemKind::UploadCannotCreateTgtFile)
                }
            };
        }
        let exists_problem = match payload.tgt_file_state {
            TgtFileState::Created | TgtFileState::Transferred => ProblemKind::RetryOnCreatedFile,
            TgtFileState::Resumed => ProblemKind::RetryOnResumedFile,
            TgtFileState::Unknown => ProblemKind::UploadTgtFileAlreadyExists,
        };
        let policy_choice = match payload.tgt_file_state {
            TgtFileState::Created | TgtFileState::Transferred => {
                self.op.policies().retry_on_created_file
            }
            TgtFileState::Resumed => self.op.policies().retry_on_resumed_file,
            TgtFileState::Unknown => self.op.policies().file_already_exists,
        };
        let effective = match item.forced {
            ForcedAction::UseAutorename
            | ForcedAction::UploadForceAutorename
            | ForcedAction::UploadContinueAutorename => FileExistsPolicy::AutoRename,
            ForcedAction::Resume | ForcedAction::ReduceFileSizeAndResume => {
                FileExistsPolicy::Resume
            }
            ForcedAction::ResumeOrOverwrite => FileExistsPolicy::ResumeOrOverwrite,
            ForcedAction::Overwrite => FileExistsPolicy::Overwrite,
            ForcedAction::UploadTestIfFinished => {
                let remote = existing.size.as_bytes();
                return UploadAction::TestIfFinished { remote_size: remote };
            }
            _ => policy_choice,
        };
        match effective {
            FileExistsPolicy::UserPrompt => UploadAction::Prompt(exists_problem),
            FileExistsPolicy::AutoRename => UploadAction::Autorename,
            FileExistsPolicy::Overwrite => UploadAction::Overwrite,
            FileExistsPolicy::Skip => UploadAction::Skip(exists_problem),
            FileExistsPolicy::Resume => self.resume_action(payload, &existing, false),
            FileExistsPolicy::ResumeOrOverwrite => self.resume_action(payload, &existing, true),
        }
    }

    /// Resume preconditions: binary mode, a known remote size, and a remote
    /// not larger than the source. `or_overwrite` degrades to overwrite
    /// instead of reporting the precondition failures.
    fn resume_action(
        &self,
        payload: &UploadFile,
        existing: &CachedItem,
        or_overwrite: bool,
    ) -> UploadAction {
        if payload.ascii_mode {
            return if or_overwrite {
                UploadAction::Overwrite
            } else {
                UploadAction::Prompt(ProblemKind::UploadAsciiResumeNotSupported)
            };
        }
        let remote = match existing.size {
            CachedSize::Bytes(b) => b,
            CachedSize::Unknown | CachedSize::NeedsUpdate => {
                return if or_overwrite {
                    UploadAction::Overwrite
                } else {
                    UploadAction::Prompt(ProblemKind::UploadUnableToResumeUnknownSize)
                };
            }
        };
        if let Some(src) = payload.size
            && remote > src
        {
            return if or_overwrite {
                UploadAction::Overwrite
            } else {
                UploadAction::Prompt(ProblemKind::UploadUnableToResumeBiggerTgt)
            };
        }
        UploadAction::Resume { remote_size: remote }
    }

    fn delete_target_first(&mut self, tgt_path: &str, name: &str) -> Result<(), ItemOutcome> {
        match self.ensure_working_dir(tgt_path) {
            Ok(()) => {}
            Err(CwdFailure::Transport(e)) => return Err(e.outcome()),
            Err(CwdFailure::Refused(_, _)) => return Ok(()),
        }
        match self.command(&format!("DELE {}", name)) {
            Ok(reply) if reply.is_success() => {
                let key = self.op.params.server.key();
                self.cache.report_delete(&key, tgt_path, self.op.params.style, name);
                Ok(())
            }
            // STOR will overwrite anyway on most servers; keep going.
            Ok(_) => Ok(()),
            Err(e) => Err(e.outcome()),
        }
    }

    /// The actual data movement: open the source through the disk thread,
    /// STOR (or APPE at `resume_from`), stream chunks with the ASCII CRLF
    /// conversion, and verify what the server ended up with.
    fn store_file(
        &mut self,
        item: &Item,
        payload: &UploadFile,
        name: &str,
        is_move: bool,
        resume_from: Option<u64>,
    ) -> ItemOutcome {
        let key = self.op.params.server.key();
        let style = self.op.params.style;

        self.set_sub_state(WorkerSubState::WaitingForDisk);
        let out = match self.disk.run(DiskWorkKind::OpenFileForReading {
            path: PathBuf::from(&item.path),
            name: item.name.clone(),
        }) {
            Ok(out) => out,
            Err(_) => {
                self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                return ItemOutcome::Finished;
            }
        };
        if out.problem != ProblemKind::Ok {
            self.fail_item(item.uid, out.problem, out.os_error, None);
            return ItemOutcome::Finished;
        }
        let Some(mut src) = out.handle else {
            self.fail_item(item.uid, ProblemKind::UploadCannotOpenSrcFile, None, None);
            return ItemOutcome::Finished;
        };
        let src_size = out.size;

        match self.ensure_working_dir(&payload.tgt_path) {
            Ok(()) => {}
            Err(CwdFailure::Transport(e)) => return e.outcome(),
            Err(CwdFailure::Refused(problem, text)) => {
                self.fail_item(item.uid, problem, None, Some(text));
                return ItemOutcome::Finished;
            }
        }
        let ty = if payload.ascii_mode { TransferType::Ascii } else { TransferType::Binary };
        if let Err(e) = self.ensure_transfer_type(ty) {
            return e.outcome();
        }

        self.cache.report_store_file(&key, &payload.tgt_path, style, name);
        let pending = match self.open_data_connection() {
            Ok(p) => p,
            Err(DataSetupError::Cmd(e)) => return e.outcome(),
            Err(DataSetupError::Refused(text)) => {
                self.fail_item(item.uid, ProblemKind::IncompleteUpload, None, Some(text));
                return ItemOutcome::Finished;
            }
            Err(DataSetupError::Listen(msg)) | Err(DataSetupError::Setup(msg)) => {
                self.fail_item(item.uid, ProblemKind::ListenFailure, None, Some(msg));
                return ItemOutcome::Finished;
            }
        };
        let verb = if resume_from.is_some() { "APPE" } else { "STOR" };
        if let Err(e) = self.send_raw(&format!("{} {}", verb, name)) {
            return e.outcome();
        }
        let mut stream = match pending.establish(self.data_timeouts()) {
            Ok(s) => s,
            Err(_) => {
                self.cache.report_unknown_change(&key, &payload.tgt_path, style);
                return match self.read_final_reply() {
                    Ok(reply) => {
                        self.fail_item(
                            item.uid,
                            ProblemKind::IncompleteUpload,
                            None,
                            Some(reply.text),
                        );
                        ItemOutcome::Finished
                    }
                    Err(e) => e.outcome(),
                };
            }
        };
        self.set_data_conn_state(crate::ftp::data::DataConnState::TransferringData);
        self.set_sub_state(WorkerSubState::TransferringData);
        self.op.queue.update_payload(item.uid, |kind| {
            if let ItemKind::UploadCopyFile(p) | ItemKind::UploadMoveFile(p) = kind {
                p.tgt_file_state = if resume_from.is_some() {
                    TgtFileState::Resumed
                } else {
                    TgtFileState::Created
                };
            }
        });

        // Binary resume skips the bytes the server already has.
        let mut src_offset = resume_from.unwrap_or(0);
        let mut produced: u64 = 0;
        let mut eols_total: u64 = 0;
        let all_sent;
        loop {
            if self.poll_control() == Flow::Stop {
                drop(stream);
                self.cache.report_unknown_change(&key, &payload.tgt_path, style);
                let _ = self.read_final_reply();
                return ItemOutcome::Stopping;
            }
            self.set_sub_state(WorkerSubState::WaitingForDisk);
            let read = match self.disk.run(DiskWorkKind::ReadFile {
                handle: src,
                offset: src_offset,
                max_bytes: self.op.params.buf_size.max(4 * 1024),
                ascii: payload.ascii_mode,
            }) {
                Ok(o) => o,
                Err(_) => {
                    self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                    return ItemOutcome::Finished;
                }
            };
            let Some(handle_back) = read.handle else {
                self.fail_item(item.uid, ProblemKind::SrcFileReadError, None, None);
                return ItemOutcome::Finished;
            };
            src = handle_back;
            if read.problem != ProblemKind::Ok {
                drop(stream);
                self.cache.report_unknown_change(&key, &payload.tgt_path, style);
                let _ = self.read_final_reply();
                self.fail_item(item.uid, read.problem, read.os_error, None);
                return ItemOutcome::Finished;
            }
            let data = read.data.unwrap_or_default();
            if data.is_empty() {
                all_sent = true;
                break;
            }
            src_offset = read.new_offset.unwrap_or(src_offset);
            eols_total += read.eols.unwrap_or(0);
            self.set_sub_state(WorkerSubState::TransferringData);
            if let Err(e) = stream.write_chunk(&data) {
                tracing::debug!("[worker {}] upload data write failed: {}", self.id, e);
                drop(stream);
                self.cache.report_unknown_change(&key, &payload.tgt_path, style);
                self.conn = None;
                // Partial upload: continue later against the real remote size.
                self.op.queue.update_payload(item.uid, |kind| {
                    if let ItemKind::UploadCopyFile(p) | ItemKind::UploadMoveFile(p) = kind {
                        p.tgt_file_state = TgtFileState::Resumed;
                    }
                });
                return ItemOutcome::ConnectionLost;
            }
            produced += data.len() as u64;
            self.add_transfer_bytes(data.len() as u64);
        }
        let _ = stream.finish_upload();
        drop(stream);
        self.set_data_conn_state(crate::ftp::data::DataConnState::TransferFinished);

        let final_reply = match self.read_final_reply() {
            Ok(r) => r,
            Err(_) => {
                self.conn = None;
                if all_sent {
                    // Everything went out; verify instead of re-sending.
                    self.op.queue.set_forced(item.uid, ForcedAction::UploadTestIfFinished);
                    self.op.queue.return_to_waiting(item.uid);
                    return ItemOutcome::Finished;
                }
                self.cache.report_unknown_change(&key, &payload.tgt_path, style);
                return ItemOutcome::ConnectionLost;
            }
        };
        if !final_reply.is_success() {
            self.cache.report_unknown_change(&key, &payload.tgt_path, style);
            self.fail_item(item.uid, ProblemKind::IncompleteUpload, None, Some(final_reply.text));
            return ItemOutcome::Finished;
        }

        let remote_total = resume_from.unwrap_or(0) + produced;
        self.cache.report_file_uploaded(&key, &payload.tgt_path, style, name, Some(remote_total));
        if payload.ascii_mode {
            // Remember the CRLF-inflated size for later verification.
            self.op.queue.update_payload(item.uid, |kind| {
                if let ItemKind::UploadCopyFile(p) | ItemKind::UploadMoveFile(p) = kind {
                    p.size_with_crlf_eols = Some(remote_total);
                    p.number_of_eols = Some(eols_total);
                }
            });
        } else if resume_from.is_none()
            && let Some(expected) = src_size
            && produced != expected
        {
            self.fail_item(
                item.uid,
                ProblemKind::IncompleteUpload,
                None,
                Some(format!("sent {} of {} bytes", produced, expected)),
            );
            return ItemOutcome::Finished;
        }
        if payload.size.is_none() {
            self.op.sub_unknown_size();
        }
        self.finish_upload_item(item, is_move, &payload.tgt_path)
    }

    /// The whole file was sent but the final reply never came: compare the
    /// fresh remote size against what we must have produced.
    fn test_if_finished(
        &mut self,
        item: &Item,
        payload: &UploadFile,
        name: &str,
        is_move: bool,
        cached_remote: Option<u64>,
    ) -> ItemOutcome {
        let key = self.op.params.server.key();
        let style = self.op.params.style;
        // Force a fresh listing; the cached entry may predate the upload.
        let remote = match cached_remote {
            Some(b) => Some(b),
            None => {
                self.cache.report_unknown_change(&key, &payload.tgt_path, style);
                match self.lookup_target(&payload.tgt_path, name) {
                    TargetLookup::Entry(entry) => entry.and_then(|e| e.size.as_bytes()),
                    TargetLookup::Stop => return ItemOutcome::Stopping,
                    TargetLookup::ConnectionLost => return ItemOutcome::ConnectionLost,
                    TargetLookup::Failed(problem, text) => {
                        self.fail_item(item.uid, problem, None, text);
                        return ItemOutcome::Finished;
                    }
                }
            }
        };
        let expected = if payload.ascii_mode {
            payload.size_with_crlf_eols
        } else {
            payload.size
        };
        match (remote, expected) {
            (Some(r), Some(e)) if r == e => {
                tracing::debug!("[worker {}] upload verified by size ({} bytes)", self.id, r);
                self.finish_upload_item(item, is_move, &payload.tgt_path)
            }
            (Some(_), Some(_)) => {
                // Sizes disagree: the upload really is incomplete.
                self.op.queue.set_forced(item.uid, ForcedAction::None);
                self.ui_item(item.uid, ProblemKind::IncompleteUpload, None, None);
                ItemOutcome::Finished
            }
            _ => {
                self.ui_item(item.uid, ProblemKind::UploadTestIfFinishedNotSupported, None, None);
                ItemOutcome::Finished
            }
        }
    }

    fn finish_upload_item(&mut self, item: &Item, is_move: bool, tgt_path: &str) -> ItemOutcome {
        if is_move {
            self.set_sub_state(WorkerSubState::DeletingSource);
            let out = match self.disk.run(DiskWorkKind::DeleteFile {
                path: PathBuf::from(&item.path),
                name: item.name.clone(),
            }) {
                Ok(o) => o,
                Err(_) => {
                    self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                    return ItemOutcome::Finished;
                }
            };
            if out.problem != ProblemKind::Ok {
                self.fail_item(item.uid, out.problem, out.os_error, None);
                return ItemOutcome::Finished;
            }
            self.op.note_change_path(&item.path, false, false);
        }
        self.op.note_change_path(tgt_path, false, true);
        self.op.queue.update_payload(item.uid, |kind| {
            if let ItemKind::UploadCopyFile(p) | ItemKind::UploadMoveFile(p) = kind {
                p.tgt_file_state = TgtFileState::Transferred;
            }
        });
        self.done_item(item.uid);
        ItemOutcome::Finished
    }
}

enum UploadAction {
    Store,
    Autorename,
    Resume { remote_size: u64 },
    Overwrite,
    TestIfFinished { remote_size: Option<u64> },
    Prompt(ProblemKind),
    Skip(ProblemKind),
}

enum FetchedBytes {
    Data(Vec<u8>),
    Stop,
    ConnectionLost,
    NotAccessible(String),
    Error(String),
}

enum FetchedTarget {
    Entries(Vec<crate::ftp::listing::ListingEntry>),
    Stop,
    ConnectionLost,
    Failed(ProblemKind, Option<String>),
}
