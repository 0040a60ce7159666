//! End-to-end scenarios: the full engine (queue + workers + disk thread +
//! listing cache) against an in-process FTP server.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ftpilot::cache::UploadListingCache;
use ftpilot::config::{Config, FileExistsPolicy, NonEmptyDirPolicy};
use ftpilot::disk::DiskIo;
use ftpilot::ftp::listing::{PathStyle, UnixListingParser};
use ftpilot::item::{
    CopyMoveFile, Item, ItemId, ItemKind, ItemState, TgtFileState, UploadFile,
};
use ftpilot::opened_files::OpenedFiles;
use ftpilot::operation::{
    Operation, OperationKind, OperationParams, OperationState, ServerParams,
};
use ftpilot::worker::{WorkerSpawnCtx, spawn_worker};

use common::{MockFs, MockFtpServer, make_tmp_dir};

struct Engine {
    disk: Arc<DiskIo>,
    cache: Arc<UploadListingCache>,
    opened: Arc<OpenedFiles>,
    parser: Arc<UnixListingParser>,
}

impl Engine {
    fn start() -> Self {
        Engine {
            disk: DiskIo::spawn(),
            cache: Arc::new(UploadListingCache::new()),
            opened: Arc::new(OpenedFiles::new()),
            parser: Arc::new(UnixListingParser::with_reference_year(2026)),
        }
    }

    fn spawn_workers(&self, op: &Arc<Operation>, count: u32) {
        for id in 0..count {
            let handle = spawn_worker(WorkerSpawnCtx {
                id,
                op: op.clone(),
                disk: self.disk.clone(),
                cache: self.cache.clone(),
                opened: self.opened.clone(),
                parser: self.parser.clone(),
                ops_list: None,
            });
            op.add_worker(handle);
        }
    }

    fn shutdown(self, op: &Arc<Operation>) {
        op.stop_workers();
        op.join_workers();
        self.disk.shutdown();
    }
}

fn params_for(
    server: &MockFtpServer,
    kind: OperationKind,
    source_path: &str,
    target_path: &str,
    config: &Config,
) -> OperationParams {
    OperationParams::from_config(
        kind,
        ServerParams {
            host: server.addr.ip().to_string(),
            port: server.addr.port(),
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
        source_path.into(),
        target_path.into(),
        config,
    )
}

fn wait_quiescent(op: &Arc<Operation>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if op.queue.counts().is_quiescent() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn wait_for_state(
    op: &Arc<Operation>,
    uid: ItemId,
    state: ItemState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if op.queue.with_item(uid, |i| i.state) == Some(state) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Scenario: delete two files, the second hidden with policy = prompt. The
/// worker stops on the hidden file until the host confirms, then finishes.
#[test]
fn delete_with_hidden_confirmation() {
    let mut fs = MockFs::new();
    fs.add_file("/data/a.txt", b"payload");
    fs.add_file("/data/.secret", b"hidden");
    let server = MockFtpServer::start(fs);

    let config = Config::default();
    let op = Arc::new(Operation::new(params_for(
        &server,
        OperationKind::Delete,
        "/data",
        "",
        &config,
    )));
    let visible = Item::new(
        None,
        ItemState::Waiting,
        "/data",
        "a.txt",
        ItemKind::DeleteFile { is_hidden: false },
    );
    let hidden = Item::new(
        None,
        ItemState::Waiting,
        "/data",
        ".secret",
        ItemKind::DeleteFile { is_hidden: true },
    );
    let (visible_uid, hidden_uid) = (visible.uid, hidden.uid);
    op.queue.add_items(vec![visible, hidden]);

    let engine = Engine::start();
    engine.spawn_workers(&op, 1);

    assert!(wait_for_state(&op, visible_uid, ItemState::Done, Duration::from_secs(10)));
    assert!(wait_for_state(&op, hidden_uid, ItemState::UserInputNeeded, Duration::from_secs(10)));
    assert_eq!(
        op.queue.with_item(hidden_uid, |i| i.problem).unwrap(),
        ftpilot::ProblemKind::FileIsHidden
    );
    assert!(server.fs.lock().unwrap().file("/data/.secret").is_some());

    // Host confirms the delete: the hidden flag clears and the item retries.
    op.queue.update_payload(hidden_uid, |kind| {
        if let ItemKind::DeleteFile { is_hidden } = kind {
            *is_hidden = false;
        }
    });
    op.queue.retry_item(hidden_uid);

    assert!(wait_for_state(&op, hidden_uid, ItemState::Done, Duration::from_secs(10)));
    assert!(wait_quiescent(&op, Duration::from_secs(5)));
    assert_eq!(op.operation_state(), OperationState::SuccessfullyFinished);
    assert!(server.fs.lock().unwrap().file("/data/a.txt").is_none());
    assert!(server.fs.lock().unwrap().file("/data/.secret").is_none());
    engine.shutdown(&op);
}

/// Scenario: download one 1000-byte binary file over a passive data
/// connection; the bytes land on disk intact and the item completes.
#[test]
fn download_single_file_passive() {
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let mut fs = MockFs::new();
    fs.add_file("/data/blob.bin", &payload);
    let server = MockFtpServer::start(fs);
    let target_dir = make_tmp_dir("download");

    let config = Config::default();
    let op = Arc::new(Operation::new(params_for(
        &server,
        OperationKind::CopyDownload,
        "/data",
        target_dir.to_str().unwrap(),
        &config,
    )));
    let item = Item::new(
        None,
        ItemState::Waiting,
        "/data",
        "blob.bin",
        ItemKind::CopyFileOrFileLink(Box::new(CopyMoveFile {
            tgt_path: target_dir.to_string_lossy().to_string(),
            tgt_name: "blob.bin".into(),
            size: Some(1000),
            size_in_bytes: true,
            ascii_mode: false,
            ignore_ascii_for_binary: false,
            tgt_file_state: TgtFileState::Unknown,
            date_time: None,
        })),
    );
    let uid = item.uid;
    op.add_total_bytes(1000);
    op.queue.add_item(item);

    let engine = Engine::start();
    engine.spawn_workers(&op, 1);

    assert!(wait_for_state(&op, uid, ItemState::Done, Duration::from_secs(10)));
    assert!(wait_quiescent(&op, Duration::from_secs(5)));
    engine.shutdown(&op);

    let written = std::fs::read(target_dir.join("blob.bin")).expect("downloaded file");
    assert_eq!(written, payload);
    assert_eq!(op.operation_state(), OperationState::SuccessfullyFinished);
    assert_eq!(op.copy_progress().transferred, 1000);
    let _ = std::fs::remove_dir_all(&target_dir);
}

/// Scenario: explore a non-empty directory for delete with the non-empty-dir
/// policy set to skip. Children are generated and executed; the directory
/// itself is skipped; the operation finishes "with skips".
#[test]
fn delete_explore_non_empty_dir_skip_policy() {
    let mut fs = MockFs::new();
    fs.add_file("/data/sub/x.txt", b"x");
    fs.add_file("/data/sub/y.txt", b"y");
    fs.add_file("/data/sub/z.txt", b"z");
    let server = MockFtpServer::start(fs);

    let mut config = Config::default();
    config.download_policies.non_empty_dir_delete = NonEmptyDirPolicy::Skip;
    let op = Arc::new(Operation::new(params_for(
        &server,
        OperationKind::Delete,
        "/data",
        "",
        &config,
    )));
    op.queue.add_item(Item::new(
        None,
        ItemState::Waiting,
        "/data",
        "sub",
        ItemKind::DeleteExploreDir { is_top_level: true, is_hidden: false },
    ));

    let engine = Engine::start();
    engine.spawn_workers(&op, 2);

    assert!(wait_quiescent(&op, Duration::from_secs(10)));
    engine.shutdown(&op);

    // The three children were generated via the explore replacement and ran.
    let counts = op.queue.counts();
    assert_eq!(counts.total, 4);
    assert_eq!(counts.done, 3);
    assert_eq!(counts.skipped, 1);
    assert_eq!(op.operation_state(), OperationState::FinishedWithSkips);
    let fs = server.fs.lock().unwrap();
    assert!(fs.file("/data/sub/x.txt").is_none());
    assert!(fs.file("/data/sub/y.txt").is_none());
    assert!(fs.file("/data/sub/z.txt").is_none());
    // Policy said skip, so the (now empty) directory stays.
    assert!(fs.is_dir("/data/sub"));
}

/// Scenario: upload-move with a target collision and policy = autorename.
/// The cache reports the collision, the name generator picks the next
/// candidate, and the source file is deleted after the transfer.
#[test]
fn upload_move_with_autorename_collision() {
    let mut fs = MockFs::new();
    fs.add_file("/in/report.txt", b"old-contents");
    let server = MockFtpServer::start(fs);

    let source_dir = make_tmp_dir("upload");
    let source_bytes = b"fresh report body, 42 chars of payload ok!";
    std::fs::write(source_dir.join("report.txt"), source_bytes).unwrap();

    let mut config = Config::default();
    config.upload_policies.file_already_exists = FileExistsPolicy::AutoRename;
    let op = Arc::new(Operation::new(params_for(
        &server,
        OperationKind::MoveUpload,
        source_dir.to_str().unwrap(),
        "/in",
        &config,
    )));
    let item = Item::new(
        None,
        ItemState::Waiting,
        source_dir.to_string_lossy().to_string(),
        "report.txt",
        ItemKind::UploadMoveFile(Box::new(UploadFile {
            tgt_path: "/in".into(),
            tgt_name: "report.txt".into(),
            size: Some(source_bytes.len() as u64),
            size_in_bytes: true,
            ascii_mode: true,
            ignore_ascii_for_binary: false,
            autorename_phase: 0,
            renamed_name: None,
            size_with_crlf_eols: None,
            number_of_eols: None,
            tgt_file_state: TgtFileState::Unknown,
        })),
    );
    let uid = item.uid;
    op.queue.add_item(item);

    let engine = Engine::start();
    engine.spawn_workers(&op, 1);

    assert!(wait_for_state(&op, uid, ItemState::Done, Duration::from_secs(10)));
    assert!(wait_quiescent(&op, Duration::from_secs(5)));
    engine.shutdown(&op);

    let fs = server.fs.lock().unwrap();
    // The original stays untouched; the upload landed under the next name.
    assert_eq!(fs.file("/in/report.txt").unwrap(), b"old-contents");
    assert_eq!(fs.file("/in/report (2).txt").unwrap(), source_bytes);
    // Move semantics: the local source is gone.
    assert!(!source_dir.join("report.txt").exists());
    assert_eq!(op.operation_state(), OperationState::SuccessfullyFinished);
    let renamed = op.queue.with_item(uid, |i| match &i.kind {
        ItemKind::UploadMoveFile(p) => p.renamed_name.clone(),
        _ => None,
    });
    assert_eq!(renamed.unwrap().as_deref(), Some("report (2).txt"));
    let _ = std::fs::remove_dir_all(&source_dir);
}

/// Scenario: the control connection drops mid-download; the worker
/// reconnects, resumes with REST and the final file is complete.
#[test]
fn reconnect_and_resume_after_connection_drop() {
    let payload: Vec<u8> = (0..9000u32).map(|i| (i % 199) as u8).collect();
    let mut fs = MockFs::new();
    fs.add_file("/data/flaky.bin", &payload);
    fs.flaky = Some("flaky.bin".to_string());
    let server = MockFtpServer::start(fs);
    let target_dir = make_tmp_dir("resume");

    let mut config = Config::default();
    // Keep the partial file above the resume threshold so the retry really
    // resumes instead of overwriting.
    config.resume_min_file_size = 1024;
    let op = Arc::new(Operation::new(params_for(
        &server,
        OperationKind::CopyDownload,
        "/data",
        target_dir.to_str().unwrap(),
        &config,
    )));
    let item = Item::new(
        None,
        ItemState::Waiting,
        "/data",
        "flaky.bin",
        ItemKind::CopyFileOrFileLink(Box::new(CopyMoveFile {
            tgt_path: target_dir.to_string_lossy().to_string(),
            tgt_name: "flaky.bin".into(),
            size: Some(payload.len() as u64),
            size_in_bytes: true,
            ascii_mode: false,
            ignore_ascii_for_binary: false,
            tgt_file_state: TgtFileState::Unknown,
            date_time: None,
        })),
    );
    let uid = item.uid;
    op.queue.add_item(item);

    let engine = Engine::start();
    engine.spawn_workers(&op, 1);

    assert!(wait_for_state(&op, uid, ItemState::Done, Duration::from_secs(30)));
    assert!(wait_quiescent(&op, Duration::from_secs(5)));
    engine.shutdown(&op);

    let written = std::fs::read(target_dir.join("flaky.bin")).expect("resumed file");
    assert_eq!(written.len(), payload.len());
    assert_eq!(written, payload);
    assert_eq!(op.operation_state(), OperationState::SuccessfullyFinished);
    let _ = std::fs::remove_dir_all(&target_dir);
}

/// Two workers on one queue: a directory delete explored by one connection
/// can have its children drained by both.
#[test]
fn two_workers_share_one_queue() {
    let mut fs = MockFs::new();
    for i in 0..6 {
        fs.add_file(&format!("/data/many/f{}.bin", i), b"x");
    }
    let server = MockFtpServer::start(fs);

    let mut config = Config::default();
    config.download_policies.non_empty_dir_delete = NonEmptyDirPolicy::DeleteIt;
    let op = Arc::new(Operation::new(params_for(
        &server,
        OperationKind::Delete,
        "/data",
        "",
        &config,
    )));
    op.queue.add_item(Item::new(
        None,
        ItemState::Waiting,
        "/data",
        "many",
        ItemKind::DeleteExploreDir { is_top_level: true, is_hidden: false },
    ));

    let engine = Engine::start();
    engine.spawn_workers(&op, 2);

    assert!(wait_quiescent(&op, Duration::from_secs(15)));
    engine.shutdown(&op);

    assert_eq!(op.operation_state(), OperationState::SuccessfullyFinished);
    let fs = server.fs.lock().unwrap();
    // Everything including the emptied directory is gone.
    assert!(!fs.is_dir("/data/many"));
    assert!(fs.is_dir("/data"));
}
