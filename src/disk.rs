use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::EngineError;
use crate::error::ProblemKind;
use crate::item::TgtFileState;

/// How a create request resolves a name collision. The worker computes this
/// from the operation policy plus the item's forced action; the disk thread
/// only executes mechanics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    /// Collision goes back to the worker as the given problem.
    PromptUser,
    AutoRename,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    Skip,
    /// Join an existing directory instead of failing (dirs only).
    JoinExisting,
}

/// One entry of a local directory listing.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

/// Disk work posted by workers. Handles travel with the request and come back
/// in the outcome, so the single disk thread never holds state between calls.
pub enum DiskWorkKind {
    CreateDir {
        path: PathBuf,
        name: String,
        disposition: CreateDisposition,
        /// Continue the autorename sequence from this phase.
        autorename_phase: u32,
    },
    /// Create/open the target file resolving collisions. `exists_problem` is
    /// the problem to report on PromptUser (plain collision vs the
    /// retry-on-created/resumed variants).
    CreateFile {
        path: PathBuf,
        name: String,
        disposition: CreateDisposition,
        exists_problem: ProblemKind,
        autorename_phase: u32,
        /// Resume is quietly replaced by overwrite below this size.
        overwrite_if_smaller_than: Option<u64>,
    },
    /// Verify `data[..(write_from-check_from)]` matches the file tail, then
    /// write the remainder. Offsets are absolute file positions.
    CheckOrWriteFile { handle: File, check_from: u64, write_from: u64, data: Vec<u8> },
    /// Lazy-open variant combining create+seek+write.
    CreateAndWriteFile { full_name: PathBuf, write_offset: u64, data: Vec<u8> },
    ListDir { path: PathBuf },
    DeleteDir { path: PathBuf, name: String },
    DeleteFile { path: PathBuf, name: String },
    OpenFileForReading { path: PathBuf, name: String },
    /// Read from the upload source. In ASCII mode every bare LF becomes CRLF;
    /// the returned offset advances by raw bytes consumed, not bytes
    /// produced.
    ReadFile { handle: File, offset: u64, max_bytes: usize, ascii: bool },
}

/// Completion message for one disk work request.
#[derive(Default)]
pub struct DiskOutcome {
    pub problem: ProblemKind,
    pub os_error: Option<i32>,
    /// New target-file state after create/resume.
    pub state: Option<TgtFileState>,
    /// Name actually used (differs from the request under autorename).
    pub new_name: Option<String>,
    pub handle: Option<File>,
    /// Existing size for resume, or bytes produced by a read.
    pub size: Option<u64>,
    /// Overwrite remains possible if a later step decides so.
    pub can_overwrite: bool,
    /// The file was created empty by us and may be deleted on cancel.
    pub can_delete_empty: bool,
    pub data: Option<Vec<u8>>,
    /// Source offset after an ASCII-converted read.
    pub new_offset: Option<u64>,
    /// LF count converted in this read.
    pub eols: Option<u64>,
    pub entries: Option<Vec<LocalEntry>>,
    /// Full path of a file/dir this request freshly created (compensation
    /// target when the work gets cancelled mid-flight).
    pub created_path: Option<PathBuf>,
    pub cancelled: bool,
}

/// Deferred close: the worker never waits for a close unless it wants to.
pub struct CloseRequest {
    pub handle: File,
    pub path: PathBuf,
    pub set_mtime: Option<NaiveDateTime>,
    /// Delete the file when it ended up empty (abandoned creates).
    pub delete_if_empty: bool,
    pub truncate_to: Option<u64>,
}

struct WorkRequest {
    id: u64,
    kind: DiskWorkKind,
    reply: Sender<DiskOutcome>,
}

enum DiskMsg {
    Work(Box<WorkRequest>),
    Close(Box<CloseRequest>, u64),
    Shutdown,
}

/// The disk I/O thread: one thread, one FIFO, every local filesystem touch of
/// the engine goes through here so disk-bound concurrency is capped at one.
pub struct DiskIo {
    tx: Sender<DiskMsg>,
    next_id: AtomicU64,
    next_close_index: AtomicU64,
    cancel_set: Arc<Mutex<HashSet<u64>>>,
    closed: Arc<(Mutex<u64>, Condvar)>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DiskIo {
    pub fn spawn() -> Arc<Self> {
        let (tx, rx) = unbounded::<DiskMsg>();
        let cancel_set = Arc::new(Mutex::new(HashSet::new()));
        let closed = Arc::new((Mutex::new(0u64), Condvar::new()));
        let cancel_thread = cancel_set.clone();
        let closed_thread = closed.clone();
        let thread = std::thread::Builder::new()
            .name("ftpilot-disk".into())
            .spawn(move || disk_thread_main(rx, cancel_thread, closed_thread))
            .expect("spawn disk thread");
        Arc::new(DiskIo {
            tx,
            next_id: AtomicU64::new(1),
            next_close_index: AtomicU64::new(1),
            cancel_set,
            closed,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Post work; the outcome arrives on the returned receiver. The id can be
    /// used to cancel.
    pub fn post(&self, kind: DiskWorkKind) -> (u64, Receiver<DiskOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let _ = self.tx.send(DiskMsg::Work(Box::new(WorkRequest { id, kind, reply: reply_tx })));
        (id, reply_rx)
    }

    /// Post work and block for its outcome.
    pub fn run(&self, kind: DiskWorkKind) -> Result<DiskOutcome> {
        let (_, rx) = self.post(kind);
        rx.recv().map_err(|_| EngineError::DiskThreadGone.into())
    }

    /// Cancel posted work. Unstarted work is dropped; work already running is
    /// compensated afterwards (a freshly created file/dir is removed again).
    pub fn cancel(&self, id: u64) {
        self.cancel_set.lock().expect("cancel lock").insert(id);
    }

    /// Queue a close; returns a monotonic close index.
    pub fn enqueue_close(&self, req: CloseRequest) -> u64 {
        let index = self.next_close_index.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(DiskMsg::Close(Box::new(req), index));
        index
    }

    /// Wait until the close with the given index finished, with a timeout.
    pub fn wait_for_close(&self, index: u64, timeout: Duration) -> bool {
        let (lock, cv) = &*self.closed;
        let mut done = lock.lock().expect("close lock");
        let deadline = std::time::Instant::now() + timeout;
        while *done < index {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _res) = cv.wait_timeout(done, remaining).expect("close wait");
            done = guard;
        }
        true
    }

    /// Stop the thread after draining queued work.
    pub fn shutdown(&self) {
        let _ = self.tx.send(DiskMsg::Shutdown);
        if let Some(handle) = self.thread.lock().expect("thread lock").take() {
            let _ = handle.join();
        }
    }
}

fn disk_thread_main(
    rx: Receiver<DiskMsg>,
    cancel_set: Arc<Mutex<HashSet<u64>>>,
    closed: Arc<(Mutex<u64>, Condvar)>,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            DiskMsg::Shutdown => break,
            DiskMsg::Close(req, index) => {
                run_close(*req);
                let (lock, cv) = &*closed;
                let mut done = lock.lock().expect("close lock");
                *done = (*done).max(index);
                cv.notify_all();
            }
            DiskMsg::Work(req) => {
                let WorkRequest { id, kind, reply } = *req;
                if cancel_set.lock().expect("cancel lock").remove(&id) {
                    let _ = reply.send(DiskOutcome { cancelled: true, ..DiskOutcome::default() });
                    continue;
                }
                let mut outcome = run_work(kind);
                // A cancel that arrived while the work ran: inverse action.
                if cancel_set.lock().expect("cancel lock").remove(&id) {
                    compensate(&mut outcome);
                    outcome.cancelled = true;
                }
                let _ = reply.send(outcome);
            }
        }
    }
}

/// Undo a freshly executed create for a cancelled request.
fn compensate(outcome: &mut DiskOutcome) {
    if let Some(handle) = outcome.handle.take() {
        drop(handle);
    }
    if let Some(path) = outcome.created_path.take() {
        if path.is_dir() {
            let _ = fs::remove_dir(&path);
        } else if outcome.can_delete_empty {
            let _ = fs::remove_file(&path);
        }
        tracing::debug!("[disk] compensated cancelled create {}", path.display());
    }
}

fn os_err(e: &std::io::Error) -> Option<i32> {
    e.raw_os_error()
}

fn run_work(kind: DiskWorkKind) -> DiskOutcome {
    match kind {
        DiskWorkKind::CreateDir { path, name, disposition, autorename_phase } => {
            create_dir(&path, &name, disposition, autorename_phase)
        }
        DiskWorkKind::CreateFile {
            path,
            name,
            disposition,
            exists_problem,
            autorename_phase,
            overwrite_if_smaller_than,
        } => create_file(
            &path,
            &name,
            disposition,
            exists_problem,
            autorename_phase,
            overwrite_if_smaller_than,
        ),
        DiskWorkKind::CheckOrWriteFile { handle, check_from, write_from, data } => {
            check_or_write(handle, check_from, write_from, &data)
        }
        DiskWorkKind::CreateAndWriteFile { full_name, write_offset, data } => {
            create_and_write(&full_name, write_offset, &data)
        }
        DiskWorkKind::ListDir { path } => list_dir(&path),
        DiskWorkKind::DeleteDir { path, name } => delete_dir(&path, &name),
        DiskWorkKind::DeleteFile { path, name } => delete_file(&path, &name),
        DiskWorkKind::OpenFileForReading { path, name } => open_for_reading(&path, &name),
        DiskWorkKind::ReadFile { handle, offset, max_bytes, ascii } => {
            read_file(handle, offset, max_bytes, ascii)
        }
    }
}

fn run_close(req: CloseRequest) {
    let CloseRequest { handle, path, set_mtime, delete_if_empty, truncate_to } = req;
    if let Some(len) = truncate_to {
        let _ = handle.set_len(len);
    }
    let size = handle.metadata().map(|m| m.len()).unwrap_or(0);
    if let Some(mtime) = set_mtime {
        let system_time =
            std::time::UNIX_EPOCH + Duration::from_secs(mtime.and_utc().timestamp().max(0) as u64);
        let _ = handle.set_modified(system_time);
    }
    drop(handle);
    if delete_if_empty && size == 0 {
        let _ = fs::remove_file(&path);
        tracing::debug!("[disk] removed empty file {}", path.display());
    }
}

fn create_dir(
    path: &Path,
    name: &str,
    disposition: CreateDisposition,
    autorename_phase: u32,
) -> DiskOutcome {
    let target = path.join(name);
    match fs::create_dir(&target) {
        Ok(()) => DiskOutcome {
            new_name: Some(name.to_string()),
            created_path: Some(target),
            ..DiskOutcome::default()
        },
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match disposition {
            CreateDisposition::JoinExisting => {
                if target.is_dir() {
                    DiskOutcome { new_name: Some(name.to_string()), ..DiskOutcome::default() }
                } else {
                    // A file is in the way; joining is impossible.
                    DiskOutcome {
                        problem: ProblemKind::CannotCreateTgtDir,
                        os_error: os_err(&e),
                        ..DiskOutcome::default()
                    }
                }
            }
            CreateDisposition::AutoRename => {
                let start = autorename_phase.max(1);
                for phase in start..start + 32 {
                    let candidate = crate::util::autorename_candidate(name, phase);
                    let cand_path = path.join(&candidate);
                    if fs::create_dir(&cand_path).is_ok() {
                        return DiskOutcome {
                            new_name: Some(candidate),
                            created_path: Some(cand_path),
                            ..DiskOutcome::default()
                        };
                    }
                }
                DiskOutcome { problem: ProblemKind::CannotCreateTgtDir, ..DiskOutcome::default() }
            }
            _ => DiskOutcome {
                problem: ProblemKind::TgtDirAlreadyExists,
                ..DiskOutcome::default()
            },
        },
        Err(e) => DiskOutcome {
            problem: ProblemKind::CannotCreateTgtDir,
            os_error: os_err(&e),
            ..DiskOutcome::default()
        },
    }
}

fn create_new_file(target: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create_new(true).open(target)
}

fn create_file(
    path: &Path,
    name: &str,
    disposition: CreateDisposition,
    exists_problem: ProblemKind,
    autorename_phase: u32,
    overwrite_if_smaller_than: Option<u64>,
) -> DiskOutcome {
    let target = path.join(name);
    match create_new_file(&target) {
        Ok(handle) => DiskOutcome {
            state: Some(TgtFileState::Created),
            new_name: Some(name.to_string()),
            handle: Some(handle),
            size: Some(0),
            can_delete_empty: true,
            created_path: Some(target),
            ..DiskOutcome::default()
        },
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => resolve_file_collision(
            path,
            name,
            &target,
            disposition,
            exists_problem,
            autorename_phase,
            overwrite_if_smaller_than,
        ),
        Err(e) => DiskOutcome {
            problem: ProblemKind::CannotCreateTgtFile,
            os_error: os_err(&e),
            ..DiskOutcome::default()
        },
    }
}

fn resolve_file_collision(
    path: &Path,
    name: &str,
    target: &Path,
    disposition: CreateDisposition,
    exists_problem: ProblemKind,
    autorename_phase: u32,
    overwrite_if_smaller_than: Option<u64>,
) -> DiskOutcome {
    match disposition {
        CreateDisposition::PromptUser
        | CreateDisposition::Skip
        | CreateDisposition::JoinExisting => {
            DiskOutcome { problem: exists_problem, ..DiskOutcome::default() }
        }
        CreateDisposition::AutoRename => {
            let start = autorename_phase.max(1);
            for phase in start..start + 32 {
                let candidate = crate::util::autorename_candidate(name, phase);
                let cand_path = path.join(&candidate);
                match create_new_file(&cand_path) {
                    Ok(handle) => {
                        return DiskOutcome {
                            state: Some(TgtFileState::Created),
                            new_name: Some(candidate),
                            handle: Some(handle),
                            size: Some(0),
                            can_delete_empty: true,
                            created_path: Some(cand_path),
                            ..DiskOutcome::default()
                        };
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                    Err(e) => {
                        return DiskOutcome {
                            problem: ProblemKind::CannotCreateTgtFile,
                            os_error: os_err(&e),
                            ..DiskOutcome::default()
                        };
                    }
                }
            }
            DiskOutcome { problem: ProblemKind::CannotCreateTgtFile, ..DiskOutcome::default() }
        }
        CreateDisposition::Resume | CreateDisposition::ResumeOrOverwrite => {
            let existing_size = match fs::metadata(target) {
                Ok(m) if m.is_file() => m.len(),
                Ok(_) => {
                    return DiskOutcome {
                        problem: ProblemKind::CannotCreateTgtFile,
                        ..DiskOutcome::default()
                    };
                }
                Err(e) => {
                    return DiskOutcome {
                        problem: ProblemKind::CannotCreateTgtFile,
                        os_error: os_err(&e),
                        ..DiskOutcome::default()
                    };
                }
            };
            if overwrite_if_smaller_than.is_some_and(|min| existing_size < min) {
                // Too little to verify; overwrite instead of resuming.
                return overwrite_file(target, name);
            }
            match OpenOptions::new().read(true).write(true).open(target) {
                Ok(handle) => DiskOutcome {
                    state: Some(TgtFileState::Resumed),
                    new_name: Some(name.to_string()),
                    handle: Some(handle),
                    size: Some(existing_size),
                    can_overwrite: disposition == CreateDisposition::ResumeOrOverwrite,
                    ..DiskOutcome::default()
                },
                Err(e) => DiskOutcome {
                    problem: ProblemKind::CannotCreateTgtFile,
                    os_error: os_err(&e),
                    ..DiskOutcome::default()
                },
            }
        }
        CreateDisposition::Overwrite => overwrite_file(target, name),
    }
}

fn overwrite_file(target: &Path, name: &str) -> DiskOutcome {
    match OpenOptions::new().read(true).write(true).truncate(true).open(target) {
        Ok(handle) => DiskOutcome {
            state: Some(TgtFileState::Created),
            new_name: Some(name.to_string()),
            handle: Some(handle),
            size: Some(0),
            ..DiskOutcome::default()
        },
        Err(e) => DiskOutcome {
            problem: ProblemKind::CannotCreateTgtFile,
            os_error: os_err(&e),
            ..DiskOutcome::default()
        },
    }
}

fn check_or_write(mut handle: File, check_from: u64, write_from: u64, data: &[u8]) -> DiskOutcome {
    debug_assert!(write_from >= check_from);
    let overlap = ((write_from - check_from) as usize).min(data.len());
    if overlap > 0 {
        let mut existing = vec![0u8; overlap];
        if let Err(e) =
            handle.seek(SeekFrom::Start(check_from)).and_then(|_| handle.read_exact(&mut existing))
        {
            return DiskOutcome {
                problem: ProblemKind::TgtFileReadError,
                os_error: os_err(&e),
                handle: Some(handle),
                ..DiskOutcome::default()
            };
        }
        if existing != data[..overlap] {
            return DiskOutcome {
                problem: ProblemKind::ResumeTestFailed,
                handle: Some(handle),
                ..DiskOutcome::default()
            };
        }
    }
    let tail = &data[overlap..];
    if !tail.is_empty()
        && let Err(e) = handle.seek(SeekFrom::Start(write_from)).and_then(|_| handle.write_all(tail))
    {
        return DiskOutcome {
            problem: ProblemKind::TgtFileWriteError,
            os_error: os_err(&e),
            handle: Some(handle),
            ..DiskOutcome::default()
        };
    }
    DiskOutcome {
        handle: Some(handle),
        size: Some(write_from + tail.len() as u64),
        ..DiskOutcome::default()
    }
}

fn create_and_write(full_name: &Path, write_offset: u64, data: &[u8]) -> DiskOutcome {
    let open =
        OpenOptions::new().read(true).write(true).create(true).truncate(false).open(full_name);
    let mut handle = match open {
        Ok(h) => h,
        Err(e) => {
            return DiskOutcome {
                problem: ProblemKind::CannotCreateTgtFile,
                os_error: os_err(&e),
                ..DiskOutcome::default()
            };
        }
    };
    if let Err(e) = handle.seek(SeekFrom::Start(write_offset)).and_then(|_| handle.write_all(data))
    {
        return DiskOutcome {
            problem: ProblemKind::TgtFileWriteError,
            os_error: os_err(&e),
            handle: Some(handle),
            ..DiskOutcome::default()
        };
    }
    DiskOutcome {
        handle: Some(handle),
        size: Some(write_offset + data.len() as u64),
        ..DiskOutcome::default()
    }
}

fn list_dir(path: &Path) -> DiskOutcome {
    let read = match fs::read_dir(path) {
        Ok(r) => r,
        Err(e) => {
            return DiskOutcome {
                problem: ProblemKind::UploadCannotListSrcPath,
                os_error: os_err(&e),
                ..DiskOutcome::default()
            };
        }
    };
    let mut entries = Vec::new();
    for dent in read {
        let Ok(dent) = dent else {
            return DiskOutcome {
                problem: ProblemKind::UploadCannotListSrcPath,
                ..DiskOutcome::default()
            };
        };
        let name = dent.file_name().to_string_lossy().to_string();
        match dent.metadata() {
            Ok(md) if md.is_dir() => entries.push(LocalEntry { name, is_dir: true, size: None }),
            Ok(md) => entries.push(LocalEntry { name, is_dir: false, size: Some(md.len()) }),
            Err(e) => {
                return DiskOutcome {
                    problem: ProblemKind::UploadCannotListSrcPath,
                    os_error: os_err(&e),
                    ..DiskOutcome::default()
                };
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    DiskOutcome { entries: Some(entries), ..DiskOutcome::default() }
}

fn delete_dir(path: &Path, name: &str) -> DiskOutcome {
    match fs::remove_dir(path.join(name)) {
        Ok(()) => DiskOutcome::default(),
        Err(e) => DiskOutcome {
            problem: ProblemKind::UnableToDeleteDiskDir,
            os_error: os_err(&e),
            ..DiskOutcome::default()
        },
    }
}

fn delete_file(path: &Path, name: &str) -> DiskOutcome {
    match fs::remove_file(path.join(name)) {
        Ok(()) => DiskOutcome::default(),
        Err(e) => DiskOutcome {
            problem: ProblemKind::UnableToDeleteDiskFile,
            os_error: os_err(&e),
            ..DiskOutcome::default()
        },
    }
}

fn open_for_reading(path: &Path, name: &str) -> DiskOutcome {
    let target = path.join(name);
    match OpenOptions::new().read(true).open(&target) {
        Ok(handle) => {
            let size = handle.metadata().ok().map(|m| m.len());
            DiskOutcome { handle: Some(handle), size, ..DiskOutcome::default() }
        }
        Err(e) => DiskOutcome {
            problem: ProblemKind::UploadCannotOpenSrcFile,
            os_error: os_err(&e),
            ..DiskOutcome::default()
        },
    }
}

fn read_file(mut handle: File, offset: u64, max_bytes: usize, ascii: bool) -> DiskOutcome {
    if let Err(e) = handle.seek(SeekFrom::Start(offset)) {
        return DiskOutcome {
            problem: ProblemKind::SrcFileReadError,
            os_error: os_err(&e),
            handle: Some(handle),
            ..DiskOutcome::default()
        };
    }
    if !ascii {
        let mut buf = vec![0u8; max_bytes];
        match handle.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                DiskOutcome {
                    data: Some(buf),
                    new_offset: Some(offset + n as u64),
                    size: Some(n as u64),
                    handle: Some(handle),
                    ..DiskOutcome::default()
                }
            }
            Err(e) => DiskOutcome {
                problem: ProblemKind::SrcFileReadError,
                os_error: os_err(&e),
                handle: Some(handle),
                ..DiskOutcome::default()
            },
        }
    } else {
        // Read at most half the window raw so the worst case (all LF) still
        // fits after conversion.
        let raw_max = (max_bytes / 2).max(1);
        let mut raw = vec![0u8; raw_max];
        let n = match handle.read(&mut raw) {
            Ok(n) => n,
            Err(e) => {
                return DiskOutcome {
                    problem: ProblemKind::SrcFileReadError,
                    os_error: os_err(&e),
                    handle: Some(handle),
                    ..DiskOutcome::default()
                };
            }
        };
        raw.truncate(n);
        let mut out = Vec::with_capacity(n + n / 8);
        let mut eols: u64 = 0;
        let mut prev_cr = false;
        for &b in &raw {
            if b == b'\n' && !prev_cr {
                out.push(b'\r');
                eols += 1;
            }
            out.push(b);
            prev_cr = b == b'\r';
        }
        let produced = out.len() as u64;
        DiskOutcome {
            data: Some(out),
            new_offset: Some(offset + n as u64),
            size: Some(produced),
            eols: Some(eols),
            handle: Some(handle),
            ..DiskOutcome::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tmp_dir() -> PathBuf {
        let mut base = std::env::temp_dir();
        let uniq = format!(
            "fp_disk_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        base.push(uniq);
        fs::create_dir(&base).expect("create tmp dir");
        base
    }

    #[test]
    fn create_file_then_collision_prompts() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        let out = disk
            .run(DiskWorkKind::CreateFile {
                path: dir.clone(),
                name: "a.bin".into(),
                disposition: CreateDisposition::PromptUser,
                exists_problem: ProblemKind::TgtFileAlreadyExists,
                autorename_phase: 0,
                overwrite_if_smaller_than: None,
            })
            .unwrap();
        assert_eq!(out.problem, ProblemKind::Ok);
        assert_eq!(out.state, Some(TgtFileState::Created));
        drop(out.handle);

        let out2 = disk
            .run(DiskWorkKind::CreateFile {
                path: dir.clone(),
                name: "a.bin".into(),
                disposition: CreateDisposition::PromptUser,
                exists_problem: ProblemKind::TgtFileAlreadyExists,
                autorename_phase: 0,
                overwrite_if_smaller_than: None,
            })
            .unwrap();
        assert_eq!(out2.problem, ProblemKind::TgtFileAlreadyExists);
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn autorename_walks_candidates() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        fs::write(dir.join("r.txt"), b"x").unwrap();
        fs::write(dir.join("r (2).txt"), b"x").unwrap();
        let out = disk
            .run(DiskWorkKind::CreateFile {
                path: dir.clone(),
                name: "r.txt".into(),
                disposition: CreateDisposition::AutoRename,
                exists_problem: ProblemKind::TgtFileAlreadyExists,
                autorename_phase: 0,
                overwrite_if_smaller_than: None,
            })
            .unwrap();
        assert_eq!(out.new_name.as_deref(), Some("r (3).txt"));
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn resume_returns_existing_size_and_small_files_overwrite() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        fs::write(dir.join("big.dat"), vec![7u8; 4096]).unwrap();
        let out = disk
            .run(DiskWorkKind::CreateFile {
                path: dir.clone(),
                name: "big.dat".into(),
                disposition: CreateDisposition::Resume,
                exists_problem: ProblemKind::TgtFileAlreadyExists,
                autorename_phase: 0,
                overwrite_if_smaller_than: Some(1024),
            })
            .unwrap();
        assert_eq!(out.state, Some(TgtFileState::Resumed));
        assert_eq!(out.size, Some(4096));

        fs::write(dir.join("small.dat"), b"tiny").unwrap();
        let out2 = disk
            .run(DiskWorkKind::CreateFile {
                path: dir.clone(),
                name: "small.dat".into(),
                disposition: CreateDisposition::Resume,
                exists_problem: ProblemKind::TgtFileAlreadyExists,
                autorename_phase: 0,
                overwrite_if_smaller_than: Some(1024),
            })
            .unwrap();
        assert_eq!(out2.state, Some(TgtFileState::Created));
        assert_eq!(out2.size, Some(0));
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn check_or_write_verifies_tail() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        fs::write(dir.join("res.dat"), b"0123456789").unwrap();
        let handle = OpenOptions::new().read(true).write(true).open(dir.join("res.dat")).unwrap();
        // Verify bytes 5..10 match and append the rest.
        let out = disk
            .run(DiskWorkKind::CheckOrWriteFile {
                handle,
                check_from: 5,
                write_from: 10,
                data: b"56789abcde".to_vec(),
            })
            .unwrap();
        assert_eq!(out.problem, ProblemKind::Ok);
        assert_eq!(out.size, Some(15));
        drop(out.handle);
        assert_eq!(fs::read(dir.join("res.dat")).unwrap(), b"0123456789abcde");

        // Changed tail is refused.
        let handle = OpenOptions::new().read(true).write(true).open(dir.join("res.dat")).unwrap();
        let out2 = disk
            .run(DiskWorkKind::CheckOrWriteFile {
                handle,
                check_from: 5,
                write_from: 10,
                data: b"XXXXXzzzzz".to_vec(),
            })
            .unwrap();
        assert_eq!(out2.problem, ProblemKind::ResumeTestFailed);
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn create_and_write_is_lazy_open() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        let full = dir.join("lazy.bin");
        // First write creates the file at the given offset...
        let out = disk
            .run(DiskWorkKind::CreateAndWriteFile {
                full_name: full.clone(),
                write_offset: 0,
                data: b"abcd".to_vec(),
            })
            .unwrap();
        assert_eq!(out.problem, ProblemKind::Ok);
        assert_eq!(out.size, Some(4));
        drop(out.handle);
        // ...a second one appends into the existing file without truncating.
        let out2 = disk
            .run(DiskWorkKind::CreateAndWriteFile {
                full_name: full.clone(),
                write_offset: 4,
                data: b"efgh".to_vec(),
            })
            .unwrap();
        assert_eq!(out2.size, Some(8));
        drop(out2.handle);
        assert_eq!(fs::read(&full).unwrap(), b"abcdefgh");
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn ascii_read_converts_lf_to_crlf() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        fs::write(dir.join("text.txt"), b"a\nb\r\nc\n").unwrap();
        let handle = OpenOptions::new().read(true).open(dir.join("text.txt")).unwrap();
        let out = disk
            .run(DiskWorkKind::ReadFile { handle, offset: 0, max_bytes: 64, ascii: true })
            .unwrap();
        assert_eq!(out.data.as_deref(), Some(b"a\r\nb\r\nc\r\n".as_slice()));
        // Only the bare LFs count as conversions.
        assert_eq!(out.eols, Some(2));
        assert_eq!(out.new_offset, Some(7));
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn pending_close_sets_mtime_and_deletes_empty() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        let empty_path = dir.join("empty.part");
        let handle = File::create(&empty_path).unwrap();
        let idx = disk.enqueue_close(CloseRequest {
            handle,
            path: empty_path.clone(),
            set_mtime: None,
            delete_if_empty: true,
            truncate_to: None,
        });
        assert!(disk.wait_for_close(idx, Duration::from_secs(5)));
        assert!(!empty_path.exists());

        let full_path = dir.join("full.dat");
        fs::write(&full_path, b"data").unwrap();
        let handle = OpenOptions::new().read(true).write(true).open(&full_path).unwrap();
        let mtime =
            chrono::NaiveDate::from_ymd_opt(2024, 3, 14).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let idx = disk.enqueue_close(CloseRequest {
            handle,
            path: full_path.clone(),
            set_mtime: Some(mtime),
            delete_if_empty: true,
            truncate_to: None,
        });
        assert!(disk.wait_for_close(idx, Duration::from_secs(5)));
        assert!(full_path.exists());
        let modified = fs::metadata(&full_path).unwrap().modified().unwrap();
        let secs = modified.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
        assert_eq!(secs, mtime.and_utc().timestamp());
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn list_dir_reports_names_and_kinds() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        fs::create_dir(dir.join("sub")).unwrap();
        fs::write(dir.join("f.bin"), vec![0u8; 10]).unwrap();
        let out = disk.run(DiskWorkKind::ListDir { path: dir.clone() }).unwrap();
        let entries = out.entries.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.name == "sub" && e.is_dir));
        assert!(entries.iter().any(|e| e.name == "f.bin" && e.size == Some(10)));
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cancelled_work_is_dropped_or_compensated() {
        let dir = make_tmp_dir();
        let disk = DiskIo::spawn();
        let (id, rx) = disk.post(DiskWorkKind::CreateFile {
            path: dir.clone(),
            name: "victim.dat".into(),
            disposition: CreateDisposition::PromptUser,
            exists_problem: ProblemKind::TgtFileAlreadyExists,
            autorename_phase: 0,
            overwrite_if_smaller_than: None,
        });
        disk.cancel(id);
        let out = rx.recv().unwrap();
        if out.cancelled {
            // Dropped before start or compensated after: no file remains.
            assert!(!dir.join("victim.dat").exists());
        }
        disk.shutdown();
        let _ = fs::remove_dir_all(&dir);
    }
}
