use crate::config::{HiddenDeletePolicy, UnknownAttrsPolicy};
use crate::disk::DiskWorkKind;
use crate::error::ProblemKind;
use crate::item::{Item, ItemKind};
use crate::opened_files::AccessType;

use super::{CwdFailure, ItemOutcome, Worker, WorkerSubState};

impl Worker {
    /// DELE of one file or link, with the hidden-file confirmation first.
    pub(super) fn run_delete_file(&mut self, item: &Item) -> ItemOutcome {
        let is_hidden = match item.kind {
            ItemKind::DeleteFile { is_hidden } | ItemKind::DeleteLink { is_hidden } => is_hidden,
            _ => return ItemOutcome::Finished,
        };
        if is_hidden {
            match self.op.policies().hidden_file_delete {
                HiddenDeletePolicy::UserPrompt => {
                    self.ui_item(item.uid, ProblemKind::FileIsHidden, None, None);
                    return ItemOutcome::Finished;
                }
                HiddenDeletePolicy::Skip => {
                    self.skip_item_as(item.uid, ProblemKind::FileIsHidden);
                    return ItemOutcome::Finished;
                }
                HiddenDeletePolicy::DeleteIt => {}
            }
        }
        let key = self.op.params.server.key();
        let style = self.op.params.style;
        let Some(lock) = self.opened.open_file(
            &key.user,
            &key.host,
            key.port,
            &item.path,
            style,
            &item.name,
            AccessType::Delete,
        ) else {
            self.fail_item(item.uid, ProblemKind::SrcFileInUse, None, None);
            return ItemOutcome::Finished;
        };

        let outcome = (|| {
            match self.ensure_working_dir(&item.path) {
                Ok(()) => {}
                Err(CwdFailure::Transport(e)) => return e.outcome(),
                Err(CwdFailure::Refused(problem, text)) => {
                    self.fail_item(item.uid, problem, None, Some(text));
                    return ItemOutcome::Finished;
                }
            }
            let reply = match self.command_with_auto_retry(&format!("DELE {}", item.name)) {
                Ok(r) => r,
                Err(e) => return e.outcome(),
            };
            if reply.is_success() {
                self.cache.report_delete(&key, &item.path, style, &item.name);
                self.op.note_change_path(&item.path, false, false);
                self.done_item(item.uid);
            } else {
                self.fail_item(item.uid, ProblemKind::UnableToDeleteFile, None, Some(reply.text));
            }
            ItemOutcome::Finished
        })();
        self.opened.close_file(lock);
        outcome
    }

    /// RMD of a directory whose children all reached terminal states (the
    /// queue guarantees that through the parent counters).
    pub(super) fn run_delete_dir(&mut self, item: &Item) -> ItemOutcome {
        self.run_rmd(item, ProblemKind::UnableToDeleteDir)
    }

    /// Move: the directory (or directory link) emptied out, remove it.
    pub(super) fn run_move_delete_dir(&mut self, item: &Item) -> ItemOutcome {
        self.run_rmd(item, ProblemKind::UnableToDeleteDir)
    }

    fn run_rmd(&mut self, item: &Item, problem: ProblemKind) -> ItemOutcome {
        match self.ensure_working_dir(&item.path) {
            Ok(()) => {}
            Err(CwdFailure::Transport(e)) => return e.outcome(),
            Err(CwdFailure::Refused(cwd_problem, text)) => {
                self.fail_item(item.uid, cwd_problem, None, Some(text));
                return ItemOutcome::Finished;
            }
        }
        let reply = match self.command_with_auto_retry(&format!("RMD {}", item.name)) {
            Ok(r) => r,
            Err(e) => return e.outcome(),
        };
        if reply.is_success() {
            let key = self.op.params.server.key();
            self.cache.report_delete(&key, &item.path, self.op.params.style, &item.name);
            self.op.note_change_path(&item.path, false, false);
            self.done_item(item.uid);
        } else {
            self.fail_item(item.uid, problem, None, Some(reply.text));
        }
        ItemOutcome::Finished
    }

    /// SITE CHMOD on a file or directory; the unknown-attrs policy gates
    /// items whose original rights we cannot reproduce.
    pub(super) fn run_chattrs(&mut self, item: &Item) -> ItemOutcome {
        let attrs = match &item.kind {
            ItemKind::ChAttrsFile { attrs } => attrs,
            ItemKind::ChAttrsDir { attrs, .. } => attrs,
            _ => return ItemOutcome::Finished,
        };
        if attrs.unknown_attrs {
            match self.op.policies().unknown_attrs {
                UnknownAttrsPolicy::UserPrompt => {
                    self.ui_item(
                        item.uid,
                        ProblemKind::UnknownAttrs,
                        None,
                        attrs.orig_rights.clone(),
                    );
                    return ItemOutcome::Finished;
                }
                UnknownAttrsPolicy::Skip => {
                    self.skip_item_as(item.uid, ProblemKind::UnknownAttrs);
                    return ItemOutcome::Finished;
                }
                UnknownAttrsPolicy::Ignore => {}
            }
        }
        match self.ensure_working_dir(&item.path) {
            Ok(()) => {}
            Err(CwdFailure::Transport(e)) => return e.outcome(),
            Err(CwdFailure::Refused(problem, text)) => {
                self.fail_item(item.uid, problem, None, Some(text));
                return ItemOutcome::Finished;
            }
        }
        let cmd = format!("SITE CHMOD {:03o} {}", attrs.mode & 0o777, item.name);
        let reply = match self.command_with_auto_retry(&cmd) {
            Ok(r) => r,
            Err(e) => return e.outcome(),
        };
        if reply.is_success() {
            self.op.note_change_path(&item.path, false, true);
            self.done_item(item.uid);
        } else {
            self.fail_item(item.uid, ProblemKind::UnableToChangeAttrs, None, Some(reply.text));
        }
        ItemOutcome::Finished
    }

    /// Upload move: the local source directory emptied out, remove it.
    pub(super) fn run_upload_move_delete_dir(&mut self, item: &Item) -> ItemOutcome {
        self.set_sub_state(WorkerSubState::WaitingForDisk);
        let out = match self.disk.run(DiskWorkKind::DeleteDir {
            path: std::path::PathBuf::from(&item.path),
            name: item.name.clone(),
        }) {
            Ok(out) => out,
            Err(_) => {
                self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                return ItemOutcome::Finished;
            }
        };
        if out.problem == ProblemKind::Ok {
            self.op.note_change_path(&item.path, false, false);
            self.done_item(item.uid);
        } else {
            self.fail_item(item.uid, out.problem, out.os_error, None);
        }
        ItemOutcome::Finished
    }
}
