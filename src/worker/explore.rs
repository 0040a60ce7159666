use crate::config::{HiddenDeletePolicy, NonEmptyDirPolicy};
use crate::disk::{CreateDisposition, DiskWorkKind};
use crate::error::ProblemKind;
use crate::ftp::control::TransferType;
use crate::ftp::listing::{ListingEntry, ListingEntryKind, SizeInfo};
use crate::item::{
    ChAttrs, CopyMoveExplore, CopyMoveFile, DirCounters, ForcedAction, Item, ItemKind, ItemState,
};

use super::{CwdFailure, DataSetupError, Flow, ItemOutcome, Worker, WorkerSubState};

/// Result of pulling one directory listing over a data connection.
pub(super) enum ListFetch {
    Data(Vec<u8>),
    Stopping,
    ConnectionLost,
    /// The server refused the transfer setup or the LIST itself.
    Refused(String),
    /// The data connection broke before the final 2xx arrived.
    Incomplete(String),
    ListenFailed(String),
}

impl Worker {
    /// Fetch the listing of the connection's current working directory.
    pub(super) fn fetch_dir_listing(&mut self) -> ListFetch {
        if let Err(e) = self.ensure_transfer_type(TransferType::Ascii) {
            return match e {
                super::CmdError::Stopping => ListFetch::Stopping,
                super::CmdError::ConnectionLost => ListFetch::ConnectionLost,
            };
        }
        let pending = match self.open_data_connection() {
            Ok(p) => p,
            Err(DataSetupError::Cmd(super::CmdError::Stopping)) => return ListFetch::Stopping,
            Err(DataSetupError::Cmd(super::CmdError::ConnectionLost)) => {
                return ListFetch::ConnectionLost;
            }
            Err(DataSetupError::Refused(text)) => return ListFetch::Refused(text),
            Err(DataSetupError::Listen(msg)) | Err(DataSetupError::Setup(msg)) => {
                return ListFetch::ListenFailed(msg);
            }
        };
        let list_cmd = self
            .op
            .params
            .server
            .list_command
            .clone()
            .unwrap_or_else(|| "LIST".to_string());
        if let Err(e) = self.send_raw(&list_cmd) {
            return match e {
                super::CmdError::Stopping => ListFetch::Stopping,
                super::CmdError::ConnectionLost => ListFetch::ConnectionLost,
            };
        }
        let mut stream = match pending.establish(self.data_timeouts()) {
            Ok(s) => s,
            Err(_) => {
                // No data connection: the control reply tells us why.
                return match self.read_final_reply() {
                    Ok(reply) => ListFetch::Refused(reply.text),
                    Err(super::CmdError::Stopping) => ListFetch::Stopping,
                    Err(super::CmdError::ConnectionLost) => ListFetch::ConnectionLost,
                };
            }
        };
        self.set_data_conn_state(crate::ftp::data::DataConnState::TransferringData);
        self.set_sub_state(WorkerSubState::WaitingForListing);

        let mut bytes = Vec::new();
        let mut buf = vec![0u8; self.op.params.buf_size.max(4 * 1024)];
        loop {
            if self.poll_control() == Flow::Stop {
                return ListFetch::Stopping;
            }
            match stream.read_chunk(&mut buf) {
                Ok(0) => break,
                Ok(n) => bytes.extend_from_slice(&buf[..n]),
                Err(e) => {
                    tracing::debug!("[worker {}] listing data error: {}", self.id, e);
                    // Drain the control reply so the pipeline stays aligned.
                    let _ = self.read_final_reply();
                    return ListFetch::Incomplete(e.to_string());
                }
            }
        }
        drop(stream);
        self.set_data_conn_state(crate::ftp::data::DataConnState::TransferFinished);
        match self.read_final_reply() {
            Ok(reply) if reply.is_success() => ListFetch::Data(bytes),
            Ok(reply) => ListFetch::Incomplete(reply.text),
            Err(super::CmdError::Stopping) => ListFetch::Stopping,
            Err(super::CmdError::ConnectionLost) => ListFetch::ConnectionLost,
        }
    }

    /// Shared preamble of every server-side explore: CWD into the dir, PWD
    /// for the verbatim server spelling, and the endless-loop guard.
    /// Ok(()) means the connection now sits in the explored directory.
    fn enter_dir_for_explore(&mut self, item: &Item) -> Result<(), ItemOutcome> {
        let full = self.op.params.style.join(&item.path, &item.name);
        match self.change_working_dir(&full, false) {
            Ok(()) => {}
            Err(CwdFailure::Transport(e)) => return Err(e.outcome()),
            Err(CwdFailure::Refused(problem, text)) => {
                self.fail_item(item.uid, problem, None, Some(text));
                return Err(ItemOutcome::Finished);
            }
        }
        let (reply, pwd) = {
            let outcome = match self.command("PWD") {
                Ok(r) => r,
                Err(e) => return Err(e.outcome()),
            };
            let path = if outcome.is_success() {
                crate::ftp::control::extract_quoted_path(&outcome.text)
            } else {
                None
            };
            (outcome, path)
        };
        let Some(server_path) = pwd else {
            self.fail_item(item.uid, ProblemKind::UnableToGetWorkingDir, None, Some(reply.text));
            return Err(ItemOutcome::Finished);
        };
        if !self.op.explored_paths_insert(&server_path) {
            self.fail_item(item.uid, ProblemKind::DirExploreEndlessLoop, None, None);
            return Err(ItemOutcome::Finished);
        }
        Ok(())
    }

    fn parse_fetched_listing(
        &mut self,
        item: &Item,
        fetch: ListFetch,
    ) -> Result<Vec<ListingEntry>, ItemOutcome> {
        let bytes = match fetch {
            ListFetch::Data(b) => b,
            ListFetch::Stopping => return Err(ItemOutcome::Stopping),
            ListFetch::ConnectionLost => return Err(ItemOutcome::ConnectionLost),
            ListFetch::Refused(text) | ListFetch::Incomplete(text) => {
                self.fail_item(item.uid, ProblemKind::IncompleteListing, None, Some(text));
                return Err(ItemOutcome::Finished);
            }
            ListFetch::ListenFailed(msg) => {
                self.fail_item(item.uid, ProblemKind::ListenFailure, None, Some(msg));
                return Err(ItemOutcome::Finished);
            }
        };
        let hint = self.conn.as_ref().and_then(|c| c.server_system.clone());
        match self.parser.parse_listing(&bytes, hint.as_deref(), self.op.params.style) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::debug!("[worker {}] listing unparsable: {}", self.id, e);
                self.fail_item(item.uid, ProblemKind::UnableToParseListing, None, None);
                Err(ItemOutcome::Finished)
            }
        }
    }

    // --- delete explore ---------------------------------------------------

    pub(super) fn run_delete_explore(&mut self, item: &Item) -> ItemOutcome {
        let ItemKind::DeleteExploreDir { is_top_level, is_hidden } = item.kind else {
            return ItemOutcome::Finished;
        };
        // Hidden-dir confirmation comes before any server traffic.
        if is_hidden {
            match self.op.policies().hidden_dir_delete {
                HiddenDeletePolicy::UserPrompt => {
                    self.ui_item(item.uid, ProblemKind::DirIsHidden, None, None);
                    return ItemOutcome::Finished;
                }
                HiddenDeletePolicy::Skip => {
                    self.skip_item_as(item.uid, ProblemKind::DirIsHidden);
                    return ItemOutcome::Finished;
                }
                HiddenDeletePolicy::DeleteIt => {}
            }
        }
        if let Err(outcome) = self.enter_dir_for_explore(item) {
            return outcome;
        }
        let fetch = self.fetch_dir_listing();
        let entries = match self.parse_fetched_listing(item, fetch) {
            Ok(e) => e,
            Err(outcome) => return outcome,
        };

        let dir_path = self.op.params.style.join(&item.path, &item.name);
        let child_count = entries.len() as u32;
        let dir_state = if child_count == 0 {
            ItemState::Waiting
        } else {
            match self.op.policies().non_empty_dir_delete {
                NonEmptyDirPolicy::DeleteIt => ItemState::Delayed,
                NonEmptyDirPolicy::UserPrompt => ItemState::UserInputNeeded,
                NonEmptyDirPolicy::Skip => ItemState::Skipped,
            }
        };
        let mut dir_item = Item::new(
            item.parent,
            dir_state,
            item.path.clone(),
            item.name.clone(),
            ItemKind::DeleteDir {
                counters: DirCounters { not_done: child_count, ..DirCounters::default() },
                is_top_level,
                is_hidden,
            },
        );
        if dir_state.is_error() {
            dir_item.problem = ProblemKind::DirIsNotEmpty;
        }
        let dir_uid = dir_item.uid;
        let mut batch = vec![dir_item];
        for entry in entries {
            let kind = match entry.kind {
                ListingEntryKind::File => ItemKind::DeleteFile { is_hidden: entry.is_hidden },
                ListingEntryKind::Link => ItemKind::DeleteLink { is_hidden: entry.is_hidden },
                ListingEntryKind::Directory => ItemKind::DeleteExploreDir {
                    is_top_level: false,
                    is_hidden: entry.is_hidden,
                },
            };
            batch.push(Item::new(
                Some(dir_uid),
                ItemState::Waiting,
                dir_path.clone(),
                entry.name,
                kind,
            ));
        }
        self.op.queue.replace_item_with_list(item.uid, batch);
        self.op.report_item_changed(item.uid);
        ItemOutcome::Finished
    }

    // --- chattrs explore and resolve -------------------------------------

    pub(super) fn run_chattrs_explore(&mut self, item: &Item) -> ItemOutcome {
        let attrs = match &item.kind {
            ItemKind::ChAttrsExploreDir { attrs } | ItemKind::ChAttrsExploreDirLink { attrs } => {
                attrs.clone()
            }
            _ => return ItemOutcome::Finished,
        };
        if let Err(outcome) = self.enter_dir_for_explore(item) {
            return outcome;
        }
        let fetch = self.fetch_dir_listing();
        let entries = match self.parse_fetched_listing(item, fetch) {
            Ok(e) => e,
            Err(outcome) => return outcome,
        };

        let dir_path = self.op.params.style.join(&item.path, &item.name);
        let child_count = entries.len() as u32;
        let dir_item = Item::new(
            item.parent,
            if child_count == 0 { ItemState::Waiting } else { ItemState::Delayed },
            item.path.clone(),
            item.name.clone(),
            ItemKind::ChAttrsDir {
                counters: DirCounters { not_done: child_count, ..DirCounters::default() },
                attrs: attrs.clone(),
            },
        );
        let dir_uid = dir_item.uid;
        let mut batch = vec![dir_item];
        for entry in entries {
            let child_attrs = Box::new(ChAttrs {
                mode: attrs.mode,
                unknown_attrs: rights_have_unknown_bits(entry.rights.as_deref()),
                orig_rights: entry.rights.clone(),
            });
            let kind = match entry.kind {
                ListingEntryKind::File => ItemKind::ChAttrsFile { attrs: child_attrs },
                ListingEntryKind::Link => ItemKind::ChAttrsResolveLink { attrs: child_attrs },
                ListingEntryKind::Directory => {
                    ItemKind::ChAttrsExploreDir { attrs: child_attrs }
                }
            };
            batch.push(Item::new(
                Some(dir_uid),
                ItemState::Waiting,
                dir_path.clone(),
                entry.name,
                kind,
            ));
        }
        self.op.queue.replace_item_with_list(item.uid, batch);
        self.op.report_item_changed(item.uid);
        ItemOutcome::Finished
    }

    /// CWD against the link name decides directory-link vs file-link. File
    /// links have no attributes to change, so they complete immediately.
    pub(super) fn run_chattrs_resolve_link(&mut self, item: &Item) -> ItemOutcome {
        let ItemKind::ChAttrsResolveLink { attrs } = &item.kind else {
            return ItemOutcome::Finished;
        };
        let full = self.op.params.style.join(&item.path, &item.name);
        match self.change_working_dir(&full, false) {
            Ok(()) => {
                let explore = Item::new(
                    item.parent,
                    ItemState::Waiting,
                    item.path.clone(),
                    item.name.clone(),
                    ItemKind::ChAttrsExploreDirLink { attrs: attrs.clone() },
                );
                self.op.queue.replace_item_with_list(item.uid, vec![explore]);
                ItemOutcome::Finished
            }
            Err(CwdFailure::Transport(e)) => e.outcome(),
            Err(CwdFailure::Refused(_, _)) => {
                // Not a directory: a link to a file, nothing to change.
                self.done_item(item.uid);
                ItemOutcome::Finished
            }
        }
    }

    // --- download explore and resolve ------------------------------------

    pub(super) fn run_download_explore(&mut self, item: &Item) -> ItemOutcome {
        let (explore, is_move, deletes_link) = match &item.kind {
            ItemKind::CopyExploreDir(e) => (e.clone(), false, false),
            ItemKind::MoveExploreDir(e) => (e.clone(), true, false),
            ItemKind::MoveExploreDirLink(e) => (e.clone(), true, true),
            _ => return ItemOutcome::Finished,
        };

        // The local target directory is created before listing so children
        // have somewhere to land; the collision policy may rename it.
        self.set_sub_state(WorkerSubState::WaitingForDisk);
        let disposition = match item.forced {
            ForcedAction::UseAutorename => CreateDisposition::AutoRename,
            ForcedAction::UseExistingDir => CreateDisposition::JoinExisting,
            _ => match self.op.policies().dir_already_exists {
                crate::config::DirExistsPolicy::UserPrompt => CreateDisposition::PromptUser,
                crate::config::DirExistsPolicy::AutoRename => CreateDisposition::AutoRename,
                crate::config::DirExistsPolicy::JoinExisting => CreateDisposition::JoinExisting,
                crate::config::DirExistsPolicy::Skip => CreateDisposition::Skip,
            },
        };
        let out = match self.disk.run(DiskWorkKind::CreateDir {
            path: std::path::PathBuf::from(&explore.tgt_path),
            name: explore.tgt_name.clone(),
            disposition,
            autorename_phase: 0,
        }) {
            Ok(out) => out,
            Err(_) => {
                self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                return ItemOutcome::Finished;
            }
        };
        if out.problem != ProblemKind::Ok {
            match (out.problem, disposition) {
                (ProblemKind::TgtDirAlreadyExists, CreateDisposition::Skip) => {
                    self.skip_item_as(item.uid, ProblemKind::TgtDirAlreadyExists);
                }
                (ProblemKind::TgtDirAlreadyExists, _) => {
                    self.ui_item(item.uid, ProblemKind::TgtDirAlreadyExists, None, None);
                }
                (problem, _) => self.fail_item(item.uid, problem, out.os_error, None),
            }
            return ItemOutcome::Finished;
        }
        let tgt_dir_name = out.new_name.unwrap_or_else(|| explore.tgt_name.clone());
        let child_tgt_path =
            std::path::Path::new(&explore.tgt_path).join(&tgt_dir_name).to_string_lossy().to_string();

        if let Err(outcome) = self.enter_dir_for_explore(item) {
            return outcome;
        }
        let fetch = self.fetch_dir_listing();
        let entries = match self.parse_fetched_listing(item, fetch) {
            Ok(e) => e,
            Err(outcome) => return outcome,
        };

        let dir_path = self.op.params.style.join(&item.path, &item.name);
        let child_count = entries.len() as u32;
        let mut batch = Vec::new();
        // Move leaves a delete-dir behind; plain copy has no terminal item,
        // its children hang directly off the explored item's parent.
        let parent_for_children = if is_move {
            let dir_item = Item::new(
                item.parent,
                if child_count == 0 { ItemState::Waiting } else { ItemState::Delayed },
                item.path.clone(),
                item.name.clone(),
                if deletes_link {
                    ItemKind::MoveDeleteDirLink {
                        counters: DirCounters { not_done: child_count, ..DirCounters::default() },
                    }
                } else {
                    ItemKind::MoveDeleteDir {
                        counters: DirCounters { not_done: child_count, ..DirCounters::default() },
                    }
                },
            );
            let uid = dir_item.uid;
            batch.push(dir_item);
            Some(uid)
        } else {
            item.parent
        };

        for entry in entries {
            self.account_entry_size(&entry);
            let ascii = self.op.params.ascii.ascii_mode_for(&entry.name);
            let payload = Box::new(CopyMoveFile {
                tgt_path: child_tgt_path.clone(),
                tgt_name: entry.name.clone(),
                size: match entry.size {
                    SizeInfo::Bytes(b) | SizeInfo::Blocks(b) => Some(b),
                    SizeInfo::Unknown => None,
                },
                size_in_bytes: !matches!(entry.size, SizeInfo::Blocks(_)),
                ascii_mode: ascii,
                ignore_ascii_for_binary: false,
                tgt_file_state: Default::default(),
                date_time: entry.date_time,
            });
            let kind = match entry.kind {
                ListingEntryKind::File => {
                    if is_move {
                        ItemKind::MoveFileOrFileLink(payload)
                    } else {
                        ItemKind::CopyFileOrFileLink(payload)
                    }
                }
                ListingEntryKind::Link => {
                    if is_move {
                        ItemKind::MoveResolveLink(payload)
                    } else {
                        ItemKind::CopyResolveLink(payload)
                    }
                }
                ListingEntryKind::Directory => {
                    let explore_payload = Box::new(CopyMoveExplore {
                        tgt_path: child_tgt_path.clone(),
                        tgt_name: entry.name.clone(),
                    });
                    if is_move {
                        ItemKind::MoveExploreDir(explore_payload)
                    } else {
                        ItemKind::CopyExploreDir(explore_payload)
                    }
                }
            };
            batch.push(Item::new(
                parent_for_children,
                ItemState::Waiting,
                dir_path.clone(),
                entry.name,
                kind,
            ));
        }
        self.op.queue.replace_item_with_list(item.uid, batch);
        self.op.report_item_changed(item.uid);
        ItemOutcome::Finished
    }

    /// CWD against the link name tells directory links from file links; the
    /// item replaces itself with the matching explore or file item.
    pub(super) fn run_resolve_link(&mut self, item: &Item) -> ItemOutcome {
        let (payload, is_move) = match &item.kind {
            ItemKind::CopyResolveLink(p) => (p.clone(), false),
            ItemKind::MoveResolveLink(p) => (p.clone(), true),
            _ => return ItemOutcome::Finished,
        };
        let full = self.op.params.style.join(&item.path, &item.name);
        match self.change_working_dir(&full, false) {
            Ok(()) => {
                let explore_payload = Box::new(CopyMoveExplore {
                    tgt_path: payload.tgt_path.clone(),
                    tgt_name: payload.tgt_name.clone(),
                });
                let kind = if is_move {
                    ItemKind::MoveExploreDirLink(explore_payload)
                } else {
                    ItemKind::CopyExploreDir(explore_payload)
                };
                let replacement = Item::new(
                    item.parent,
                    ItemState::Waiting,
                    item.path.clone(),
                    item.name.clone(),
                    kind,
                );
                self.op.queue.replace_item_with_list(item.uid, vec![replacement]);
                ItemOutcome::Finished
            }
            Err(CwdFailure::Transport(e)) => e.outcome(),
            Err(CwdFailure::Refused(_, _)) => {
                // A link to a file: transfer it like a plain file.
                let kind = if is_move {
                    ItemKind::MoveFileOrFileLink(payload)
                } else {
                    ItemKind::CopyFileOrFileLink(payload)
                };
                let replacement = Item::new(
                    item.parent,
                    ItemState::Waiting,
                    item.path.clone(),
                    item.name.clone(),
                    kind,
                );
                self.op.queue.replace_item_with_list(item.uid, vec![replacement]);
                ItemOutcome::Finished
            }
        }
    }

    fn account_entry_size(&self, entry: &ListingEntry) {
        match entry.size {
            SizeInfo::Bytes(b) => self.op.add_total_bytes(b),
            SizeInfo::Blocks(b) => self.op.add_total_blocks(b),
            SizeInfo::Unknown => {
                if entry.kind == ListingEntryKind::File {
                    self.op.add_unknown_size();
                }
            }
        }
    }
}

/// Anything beyond plain rwx bits (setuid, sticky, ACL markers) cannot be
/// reproduced through SITE CHMOD and trips the unknown-attrs policy.
fn rights_have_unknown_bits(rights: Option<&str>) -> bool {
    match rights {
        None => true,
        Some(r) => r.chars().any(|c| !matches!(c, 'r' | 'w' | 'x' | '-')),
    }
}
