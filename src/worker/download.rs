use std::fs::File;
use std::path::PathBuf;

use crate::config::{AsciiOnBinaryPolicy, FileExistsPolicy};
use crate::disk::{CloseRequest, CreateDisposition, DiskWorkKind};
use crate::error::ProblemKind;
use crate::ftp::control::TransferType;
use crate::item::{CopyMoveFile, ForcedAction, Item, ItemKind, TgtFileState};
use crate::opened_files::AccessType;

use super::{CwdFailure, DataSetupError, Flow, ItemOutcome, Worker, WorkerSubState};

/// Tail window re-read on resume so a file rewritten between attempts is
/// caught before we append garbage.
const RESUME_TEST_BYTES: u64 = 4096;

impl Worker {
    /// RETR of one file (or file link): CWD, local create/resume through the
    /// disk thread, data connection, streamed flush, size verification, and
    /// the source DELE for moves.
    pub(super) fn run_download_file(&mut self, item: &Item) -> ItemOutcome {
        let (payload, is_move) = match &item.kind {
            ItemKind::CopyFileOrFileLink(p) => (p.as_ref().clone(), false),
            ItemKind::MoveFileOrFileLink(p) => (p.as_ref().clone(), true),
            _ => return ItemOutcome::Finished,
        };
        let key = self.op.params.server.key();
        let style = self.op.params.style;
        let access = if is_move { AccessType::Delete } else { AccessType::Read };
        let Some(lock) = self.opened.open_file(
            &key.user,
            &key.host,
            key.port,
            &item.path,
            style,
            &item.name,
            access,
        ) else {
            self.fail_item(item.uid, ProblemKind::SrcFileInUse, None, None);
            return ItemOutcome::Finished;
        };
        let outcome = self.download_locked(item, payload, is_move);
        self.opened.close_file(lock);
        outcome
    }

    fn download_locked(
        &mut self,
        item: &Item,
        payload: CopyMoveFile,
        is_move: bool,
    ) -> ItemOutcome {
        // Local target first: create, resume or collide per policy.
        self.set_sub_state(WorkerSubState::WaitingForDisk);
        let (disposition, exists_problem) = self.download_disposition(item, &payload);
        let out = match self.disk.run(DiskWorkKind::CreateFile {
            path: PathBuf::from(&payload.tgt_path),
            name: payload.tgt_name.clone(),
            disposition,
            exists_problem,
            autorename_phase: 0,
            overwrite_if_smaller_than: match disposition {
                CreateDisposition::Resume | CreateDisposition::ResumeOrOverwrite => {
                    Some(self.op.params.resume_min_file_size)
                }
                _ => None,
            },
        }) {
            Ok(out) => out,
            Err(_) => {
                self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                return ItemOutcome::Finished;
            }
        };
        if out.problem != ProblemKind::Ok {
            match disposition {
                CreateDisposition::Skip if out.problem == exists_problem => {
                    self.skip_item_as(item.uid, out.problem);
                }
                CreateDisposition::PromptUser if out.problem == exists_problem => {
                    self.ui_item(item.uid, out.problem, out.os_error, None);
                }
                _ => self.fail_item(item.uid, out.problem, out.os_error, None),
            }
            return ItemOutcome::Finished;
        }
        let Some(handle) = out.handle else {
            self.fail_item(item.uid, ProblemKind::CannotCreateTgtFile, None, None);
            return ItemOutcome::Finished;
        };
        let tgt_name = out.new_name.unwrap_or_else(|| payload.tgt_name.clone());
        let tgt_state = out.state.unwrap_or(TgtFileState::Created);
        let resume_offset = if tgt_state == TgtFileState::Resumed { out.size.unwrap_or(0) } else { 0 };
        let can_overwrite = out.can_overwrite;
        let can_delete_empty = out.can_delete_empty;
        self.op.queue.update_payload(item.uid, |kind| {
            if let ItemKind::CopyFileOrFileLink(p) | ItemKind::MoveFileOrFileLink(p) = kind {
                p.tgt_name = tgt_name.clone();
                p.tgt_file_state = tgt_state;
            }
        });

        // ASCII resume cannot line offsets up reliably; fall back when the
        // collision resolution allows it.
        if payload.ascii_mode && resume_offset > 0 && !can_overwrite {
            self.enqueue_target_close(handle, &payload, &tgt_name, false);
            self.fail_item(item.uid, ProblemKind::UnableToResume, None, None);
            return ItemOutcome::Finished;
        }

        let full_target = PathBuf::from(&payload.tgt_path).join(&tgt_name);
        self.transfer_download(
            item,
            &payload,
            is_move,
            handle,
            full_target,
            resume_offset,
            can_overwrite,
            can_delete_empty,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer_download(
        &mut self,
        item: &Item,
        payload: &CopyMoveFile,
        is_move: bool,
        handle: File,
        full_target: PathBuf,
        resume_offset: u64,
        can_overwrite: bool,
        can_delete_empty: bool,
    ) -> ItemOutcome {
        match self.ensure_working_dir(&item.path) {
            Ok(()) => {}
            Err(CwdFailure::Transport(e)) => {
                self.enqueue_plain_close(handle, &full_target, can_delete_empty);
                return e.outcome();
            }
            Err(CwdFailure::Refused(problem, text)) => {
                self.enqueue_plain_close(handle, &full_target, can_delete_empty);
                self.fail_item(item.uid, problem, None, Some(text));
                return ItemOutcome::Finished;
            }
        }
        let ty = if payload.ascii_mode { TransferType::Ascii } else { TransferType::Binary };
        if let Err(e) = self.ensure_transfer_type(ty) {
            self.enqueue_plain_close(handle, &full_target, can_delete_empty);
            return e.outcome();
        }

        // REST slightly before the tail so the overlap verifies the resume.
        let rest_offset = resume_offset.saturating_sub(RESUME_TEST_BYTES.min(resume_offset));
        if resume_offset > 0 {
            let reply = match self.command(&format!("REST {}", rest_offset)) {
                Ok(r) => r,
                Err(e) => {
                    self.enqueue_plain_close(handle, &full_target, can_delete_empty);
                    return e.outcome();
                }
            };
            if !reply.is_intermediate() {
                // Server cannot resume; overwrite when allowed, else give up.
                self.enqueue_plain_close(handle, &full_target, can_delete_empty);
                if can_overwrite {
                    self.op.queue.set_forced(item.uid, ForcedAction::Overwrite);
                    self.op.queue.return_to_waiting(item.uid);
                } else {
                    self.fail_item(item.uid, ProblemKind::UnableToResume, None, Some(reply.text));
                }
                return ItemOutcome::Finished;
            }
        }

        let pending = match self.open_data_connection() {
            Ok(p) => p,
            Err(e) => {
                self.enqueue_plain_close(handle, &full_target, can_delete_empty);
                return self.data_setup_failed(item, e);
            }
        };
        if let Err(e) = self.send_raw(&format!("RETR {}", item.name)) {
            self.enqueue_plain_close(handle, &full_target, can_delete_empty);
            return e.outcome();
        }
        let mut stream = match pending.establish(self.data_timeouts()) {
            Ok(s) => s,
            Err(_) => {
                self.enqueue_plain_close(handle, &full_target, can_delete_empty);
                return match self.read_final_reply() {
                    Ok(reply) => {
                        self.fail_item(
                            item.uid,
                            ProblemKind::IncompleteDownload,
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

        let mut file = Some(handle);
        let mut pos = rest_offset;
        let mut ignore_ascii = payload.ignore_ascii_for_binary;
        let mut buf = vec![0u8; self.op.params.buf_size.max(4 * 1024)];
        loop {
            if self.poll_control() == Flow::Stop {
                self.finish_partial(item, file.take(), &full_target, pos, resume_offset);
                return ItemOutcome::Stopping;
            }
            let n = match stream.read_chunk(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("[worker {}] data read error: {}", self.id, e);
                    self.finish_partial(item, file.take(), &full_target, pos, resume_offset);
                    self.conn = None;
                    return ItemOutcome::ConnectionLost;
                }
            };
            let chunk = &buf[..n];

            // ASCII mode on binary content: NULs do not belong in text.
            if payload.ascii_mode && !ignore_ascii && chunk.contains(&0) {
                match self.op.policies().ascii_on_binary {
                    AsciiOnBinaryPolicy::Ignore => {
                        ignore_ascii = true;
                        self.op.queue.update_payload(item.uid, |kind| {
                            if let ItemKind::CopyFileOrFileLink(p)
                            | ItemKind::MoveFileOrFileLink(p) = kind
                            {
                                p.ignore_ascii_for_binary = true;
                            }
                        });
                    }
                    AsciiOnBinaryPolicy::UserPrompt => {
                        self.abort_transfer(stream);
                        self.finish_partial(item, file.take(), &full_target, pos, resume_offset);
                        self.ui_item(item.uid, ProblemKind::AsciiTransferForBinaryFile, None, None);
                        return ItemOutcome::Finished;
                    }
                    AsciiOnBinaryPolicy::Skip => {
                        self.abort_transfer(stream);
                        self.finish_partial(item, file.take(), &full_target, pos, resume_offset);
                        self.skip_item_as(item.uid, ProblemKind::AsciiTransferForBinaryFile);
                        return ItemOutcome::Finished;
                    }
                    AsciiOnBinaryPolicy::RestartInBinary => {
                        self.abort_transfer(stream);
                        if let Some(h) = file.take() {
                            // Restart from scratch in binary mode.
                            let _ = self.disk.enqueue_close(CloseRequest {
                                handle: h,
                                path: full_target.clone(),
                                set_mtime: None,
                                delete_if_empty: false,
                                truncate_to: Some(0),
                            });
                        }
                        self.op.queue.update_payload(item.uid, |kind| {
                            if let ItemKind::CopyFileOrFileLink(p)
                            | ItemKind::MoveFileOrFileLink(p) = kind
                            {
                                p.ascii_mode = false;
                                p.tgt_file_state = TgtFileState::Created;
                            }
                        });
                        self.op.queue.set_forced(item.uid, ForcedAction::Overwrite);
                        self.op.queue.return_to_waiting(item.uid);
                        return ItemOutcome::Finished;
                    }
                }
            }

            // Hand the chunk to the disk thread; the overlap below the resume
            // offset verifies, the rest writes.
            self.set_sub_state(WorkerSubState::TransferringData);
            let write_from = resume_offset.clamp(pos, pos + n as u64);
            let h = match file.take() {
                Some(h) => h,
                None => break,
            };
            let disk_out = match self.disk.run(DiskWorkKind::CheckOrWriteFile {
                handle: h,
                check_from: pos,
                write_from,
                data: chunk.to_vec(),
            }) {
                Ok(o) => o,
                Err(_) => {
                    self.abort_transfer(stream);
                    self.fail_item(item.uid, ProblemKind::LowMem, None, None);
                    return ItemOutcome::Finished;
                }
            };
            file = disk_out.handle;
            if disk_out.problem != ProblemKind::Ok {
                self.abort_transfer(stream);
                if let Some(h) = file.take() {
                    self.enqueue_plain_close(h, &full_target, can_delete_empty);
                }
                match disk_out.problem {
                    ProblemKind::ResumeTestFailed => {
                        if can_overwrite {
                            self.op.queue.set_forced(item.uid, ForcedAction::Overwrite);
                            self.op.queue.return_to_waiting(item.uid);
                        } else {
                            self.ui_item(item.uid, ProblemKind::ResumeTestFailed, None, None);
                        }
                    }
                    problem => self.fail_item(item.uid, problem, disk_out.os_error, None),
                }
                return ItemOutcome::Finished;
            }
            pos += n as u64;
            self.add_transfer_bytes(n as u64);
        }
        self.set_data_conn_state(crate::ftp::data::DataConnState::TransferFinished);

        let final_reply = match self.read_final_reply() {
            Ok(r) => r,
            Err(_) => {
                self.finish_partial(item, file.take(), &full_target, pos, resume_offset);
                self.conn = None;
                return ItemOutcome::ConnectionLost;
            }
        };
        if !final_reply.is_success() {
            self.finish_partial(item, file.take(), &full_target, pos, resume_offset);
            self.fail_item(item.uid, ProblemKind::IncompleteDownload, None, Some(final_reply.text));
            return ItemOutcome::Finished;
        }

        // Size verification for binary files with a known byte size; ASCII
        // transfers legitimately change length.
        if !payload.ascii_mode
            && payload.size_in_bytes
            && let Some(expected) = payload.size
            && pos != expected
        {
            self.finish_partial(item, file.take(), &full_target, pos, resume_offset);
            self.fail_item(
                item.uid,
                ProblemKind::IncompleteDownload,
                None,
                Some(format!("received {} of {} bytes", pos, expected)),
            );
            return ItemOutcome::Finished;
        }
        // Block-sized listing plus actual byte count feeds the estimator.
        if !payload.size_in_bytes && let Some(blocks) = payload.size {
            self.op.add_block_sample(pos, blocks);
        }
        if payload.size.is_none() {
            self.op.sub_unknown_size();
        }

        if let Some(h) = file.take() {
            let _ = self.disk.enqueue_close(CloseRequest {
                handle: h,
                path: full_target.clone(),
                set_mtime: payload.date_time,
                delete_if_empty: false,
                truncate_to: None,
            });
        }
        self.op.queue.update_payload(item.uid, |kind| {
            if let ItemKind::CopyFileOrFileLink(p) | ItemKind::MoveFileOrFileLink(p) = kind {
                p.tgt_file_state = TgtFileState::Transferred;
            }
        });

        if is_move {
            self.set_sub_state(WorkerSubState::DeletingSource);
            let reply = match self.command_with_auto_retry(&format!("DELE {}", item.name)) {
                Ok(r) => r,
                Err(e) => return e.outcome(),
            };
            if !reply.is_success() {
                self.fail_item(
                    item.uid,
                    ProblemKind::UnableToDeleteSourceFile,
                    None,
                    Some(reply.text),
                );
                return ItemOutcome::Finished;
            }
            let key = self.op.params.server.key();
            self.cache.report_delete(&key, &item.path, self.op.params.style, &item.name);
            self.op.note_change_path(&item.path, false, false);
        }

        self.op.note_change_path(&payload.tgt_path, false, true);
        self.done_item(item.uid);
        ItemOutcome::Finished
    }

    /// Collision disposition from forced action, target-file state and the
    /// policy table; also picks the problem code for prompt outcomes.
    fn download_disposition(
        &self,
        item: &Item,
        payload: &CopyMoveFile,
    ) -> (CreateDisposition, ProblemKind) {
        let exists_problem = match payload.tgt_file_state {
            TgtFileState::Created | TgtFileState::Transferred => ProblemKind::RetryOnCreatedFile,
            TgtFileState::Resumed => ProblemKind::RetryOnResumedFile,
            TgtFileState::Unknown => ProblemKind::TgtFileAlreadyExists,
        };
        let forced = match item.forced {
            ForcedAction::UseAutorename => Some(CreateDisposition::AutoRename),
            ForcedAction::Resume | ForcedAction::ReduceFileSizeAndResume => {
                Some(CreateDisposition::Resume)
            }
            ForcedAction::ResumeOrOverwrite => Some(CreateDisposition::ResumeOrOverwrite),
            ForcedAction::Overwrite => Some(CreateDisposition::Overwrite),
            _ => None,
        };
        if let Some(disposition) = forced {
            return (disposition, exists_problem);
        }
        let policy = match payload.tgt_file_state {
            TgtFileState::Created | TgtFileState::Transferred => {
                self.op.policies().retry_on_created_file
            }
            TgtFileState::Resumed => self.op.policies().retry_on_resumed_file,
            TgtFileState::Unknown => self.op.policies().file_already_exists,
        };
        let disposition = match policy {
            FileExistsPolicy::UserPrompt => CreateDisposition::PromptUser,
            FileExistsPolicy::AutoRename => CreateDisposition::AutoRename,
            FileExistsPolicy::Resume => CreateDisposition::Resume,
            FileExistsPolicy::ResumeOrOverwrite => CreateDisposition::ResumeOrOverwrite,
            FileExistsPolicy::Overwrite => CreateDisposition::Overwrite,
            FileExistsPolicy::Skip => CreateDisposition::Skip,
        };
        (disposition, exists_problem)
    }

    fn data_setup_failed(&mut self, item: &Item, err: DataSetupError) -> ItemOutcome {
        match err {
            DataSetupError::Cmd(e) => e.outcome(),
            DataSetupError::Refused(text) => {
                self.fail_item(item.uid, ProblemKind::IncompleteDownload, None, Some(text));
                ItemOutcome::Finished
            }
            DataSetupError::Listen(msg) | DataSetupError::Setup(msg) => {
                self.fail_item(item.uid, ProblemKind::ListenFailure, None, Some(msg));
                ItemOutcome::Finished
            }
        }
    }

    /// Drop the data stream and realign the control pipeline.
    fn abort_transfer(&mut self, stream: crate::ftp::data::DataStream) {
        drop(stream);
        let _ = self.read_final_reply();
        self.set_data_conn_state(crate::ftp::data::DataConnState::DoesNotExist);
    }

    /// A transfer ended early: keep the partial bytes for a later resume and
    /// remember how far we got.
    fn finish_partial(
        &mut self,
        item: &Item,
        handle: Option<File>,
        full_target: &PathBuf,
        pos: u64,
        resume_offset: u64,
    ) {
        if let Some(h) = handle {
            let _ = self.disk.enqueue_close(CloseRequest {
                handle: h,
                path: full_target.clone(),
                set_mtime: None,
                delete_if_empty: true,
                truncate_to: None,
            });
        }
        if pos > resume_offset {
            self.op.queue.update_payload(item.uid, |kind| {
                if let ItemKind::CopyFileOrFileLink(p) | ItemKind::MoveFileOrFileLink(p) = kind {
                    p.tgt_file_state = TgtFileState::Resumed;
                }
            });
            self.op.queue.set_forced(item.uid, ForcedAction::Resume);
        }
    }

    fn enqueue_plain_close(&self, handle: File, path: &PathBuf, delete_if_empty: bool) {
        let _ = self.disk.enqueue_close(CloseRequest {
            handle,
            path: path.clone(),
            set_mtime: None,
            delete_if_empty,
            truncate_to: None,
        });
    }

    fn enqueue_target_close(
        &self,
        handle: File,
        payload: &CopyMoveFile,
        tgt_name: &str,
        delete_if_empty: bool,
    ) {
        let path = PathBuf::from(&payload.tgt_path).join(tgt_name);
        self.enqueue_plain_close(handle, &path, delete_if_empty);
    }
}
