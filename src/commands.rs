use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use indicatif::ProgressStyle;

use crate::cache::UploadListingCache;
use crate::cli::OperationOpts;
use crate::config::Config;
use crate::disk::DiskIo;
use crate::ftp::listing::{PathStyle, UnixListingParser};
use crate::item::{
    ChAttrs, CopyMoveExplore, CopyMoveFile, Item, ItemKind, ItemState, TgtFileState, UploadExplore,
    UploadFile,
};
use crate::opened_files::OpenedFiles;
use crate::operation::{Operation, OperationKind, OperationParams, OperationState, ServerParams};
use crate::operations_list::OperationsList;
use crate::queue::ItemView;
use crate::server::{Server, ServerCollection};
use crate::worker::{WorkerSpawnCtx, spawn_worker};

pub fn handle_create(config: &Config, alias: String, remote_host: String) -> Result<()> {
    let (username, address, port) = match crate::parse::parse_remote_host(&remote_host) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("new 命令参数错误: {}\n格式示例: fp new <alias> user@host[:port]", e);
            return Ok(());
        }
    };

    let mut collection = ServerCollection::read_from_storage(&config.server_file_path)?;
    if collection.get(&alias).is_some() {
        eprintln!("⚠️ 别名 '{}' 已存在", alias);
        return Ok(());
    }
    let server = Server {
        alias: Some(alias.clone()),
        username,
        address,
        port,
        ..Server::default()
    };
    collection.insert(&alias, server);
    collection.save_to_storage(&config.server_file_path)?;
    println!("✅ 已创建别名 '{}' 并保存到 {}", alias, config.server_file_path.display());
    Ok(())
}

pub fn handle_rename(config: &Config, alias: String, new_alias: String) -> Result<()> {
    let mut collection = ServerCollection::read_from_storage(&config.server_file_path)?;
    if collection.get(&alias).is_none() {
        eprintln!("❌ 别名 '{}' 不存在", alias);
        return Ok(());
    }
    if collection.get(&new_alias).is_some() {
        eprintln!("新别名 '{}' 已存在", new_alias);
        return Ok(());
    }

    if let Some(old) = collection.hosts().get(&alias).cloned() {
        collection.remove(&alias);
        let mut new_server = old.clone();
        new_server.alias = Some(new_alias.clone());
        collection.insert(&new_alias, new_server);
        collection.save_to_storage(&config.server_file_path)?;
        println!("已将别名 '{}' 重命名为 '{}'", alias, new_alias);
    }
    Ok(())
}

pub fn handle_list(config: &Config) -> Result<()> {
    let collection = ServerCollection::read_from_storage(&config.server_file_path)?;
    collection.show_table();
    Ok(())
}

pub fn handle_remove(config: &Config, alias: String) -> Result<()> {
    let mut collection = ServerCollection::read_from_storage(&config.server_file_path)?;
    if collection.get(&alias).is_none() {
        eprintln!("别名 '{}' 不存在", alias);
        return Ok(());
    }
    collection.remove(alias.as_str());
    collection.save_to_storage(&config.server_file_path)?;
    println!("✅ 已删除别名 '{}'", alias);
    Ok(())
}

fn load_server(config: &Config, alias: &str) -> Result<Server> {
    let collection = ServerCollection::read_from_storage(&config.server_file_path)?;
    collection
        .get(alias)
        .cloned()
        .ok_or_else(|| crate::EngineError::InvalidServerRecord(alias.to_string()).into())
}

fn server_params(server: &Server, config: &Config, opts: &OperationOpts) -> ServerParams {
    let use_passive = if opts.active {
        false
    } else {
        match server.passive_mode {
            Some(0) => false,
            Some(_) => true,
            None => config.use_passive_mode,
        }
    };
    ServerParams {
        host: server.address.clone(),
        port: server.port,
        user: server.username.clone(),
        password: server.password.clone(),
        account: server.account.clone(),
        proxy_script: server.proxy_script.clone(),
        proxy_host: None,
        proxy_port: None,
        proxy_user: None,
        proxy_password: None,
        init_commands: server.init_commands.clone(),
        list_command: server.list_command.clone(),
        server_system: None,
        use_passive_mode: use_passive,
        use_tls: server.use_tls,
        offer_compression: false,
        retry_login_without_asking: false,
    }
}

/// CLI retry overrides land on the operation parameters the workers read.
fn apply_operation_opts(params: &mut OperationParams, opts: &OperationOpts) {
    if let Some(n) = opts.retry {
        params.max_retries = n;
    }
    if let Some(ms) = opts.retry_backoff_ms {
        params.retry_delay_ms = ms.max(1);
    }
}

/// Split "alias:/a/b/c[/]" into (parent path, name, is_dir).
fn split_server_path(path: &str) -> Result<(String, String, bool)> {
    let is_dir = path.ends_with('/');
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("根目录不能作为操作对象: {}", path));
    }
    match trimmed.rfind('/') {
        Some(0) => Ok(("/".to_string(), trimmed[1..].to_string(), is_dir)),
        Some(pos) => Ok((trimmed[..pos].to_string(), trimmed[pos + 1..].to_string(), is_dir)),
        None => Err(anyhow::anyhow!("路径必须以 '/' 开头: {}", path)),
    }
}

pub fn handle_del(config: &Config, targets: Vec<String>, opts: OperationOpts) -> Result<()> {
    if targets.is_empty() {
        return Err(anyhow::anyhow!("del 需要至少一个 alias:/path 目标"));
    }
    let (alias, first_path) = crate::parse::parse_alias_and_path(&targets[0])?;
    let server = load_server(config, &alias)?;
    let (source_root, _, _) = split_server_path(&first_path)?;
    let mut params = OperationParams::from_config(
        OperationKind::Delete,
        server_params(&server, config, &opts),
        PathStyle::Unix,
        source_root,
        String::new(),
        config,
    );
    apply_operation_opts(&mut params, &opts);
    let op = Arc::new(Operation::new(params));

    let mut items = Vec::new();
    for target in &targets {
        let (a, path) = crate::parse::parse_alias_and_path(target)?;
        if a != alias {
            return Err(anyhow::anyhow!("所有目标必须使用同一个别名 ('{}' != '{}')", a, alias));
        }
        let (parent, name, is_dir) = split_server_path(&path)?;
        let hidden = name.starts_with('.');
        let kind = if is_dir {
            ItemKind::DeleteExploreDir { is_top_level: true, is_hidden: hidden }
        } else {
            ItemKind::DeleteFile { is_hidden: hidden }
        };
        items.push(Item::new(None, ItemState::Waiting, parent, name, kind));
    }
    op.queue.add_items(items);
    run_operation(config, op, &opts, "Delete")
}

pub fn handle_get(
    config: &Config,
    source: String,
    target: String,
    is_move: bool,
    opts: OperationOpts,
) -> Result<()> {
    let (alias, remote_path) = crate::parse::parse_alias_and_path(&source)?;
    let server = load_server(config, &alias)?;
    let (parent, name, is_dir) = split_server_path(&remote_path)?;
    let local_target = if target == "." || target == "./" {
        std::env::current_dir()?.to_string_lossy().to_string()
    } else {
        target
    };
    if !std::path::Path::new(&local_target).is_dir() {
        return Err(anyhow::anyhow!("本地目标必须是已存在的目录: {}", local_target));
    }

    let kind = if is_move { OperationKind::MoveDownload } else { OperationKind::CopyDownload };
    let mut params = OperationParams::from_config(
        kind,
        server_params(&server, config, &opts),
        PathStyle::Unix,
        parent.clone(),
        local_target.clone(),
        config,
    );
    apply_operation_opts(&mut params, &opts);
    let op = Arc::new(Operation::new(params));

    let item_kind = if is_dir {
        let payload = Box::new(CopyMoveExplore {
            tgt_path: local_target.clone(),
            tgt_name: name.clone(),
        });
        if is_move {
            ItemKind::MoveExploreDir(payload)
        } else {
            ItemKind::CopyExploreDir(payload)
        }
    } else {
        op.add_unknown_size();
        let payload = Box::new(CopyMoveFile {
            tgt_path: local_target.clone(),
            tgt_name: name.clone(),
            size: None,
            size_in_bytes: true,
            ascii_mode: op.params.ascii.ascii_mode_for(&name),
            ignore_ascii_for_binary: false,
            tgt_file_state: TgtFileState::Unknown,
            date_time: None,
        });
        if is_move {
            ItemKind::MoveFileOrFileLink(payload)
        } else {
            ItemKind::CopyFileOrFileLink(payload)
        }
    };
    op.queue.add_item(Item::new(None, ItemState::Waiting, parent, name, item_kind));
    run_operation(config, op, &opts, if is_move { "Download+Del" } else { "Download" })
}

pub fn handle_put(
    config: &Config,
    source: String,
    target: String,
    is_move: bool,
    opts: OperationOpts,
) -> Result<()> {
    let (alias, remote_path) = crate::parse::parse_alias_and_path(&target)?;
    let server = load_server(config, &alias)?;
    let remote_dir = remote_path.trim_end_matches('/').to_string();
    let remote_dir = if remote_dir.is_empty() { "/".to_string() } else { remote_dir };

    let src = std::path::Path::new(&source);
    if !src.exists() {
        return Err(anyhow::anyhow!("本地源不存在: {}", source));
    }
    let src_parent = src
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string());
    let src_name = src
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("无效本地源: {}", source))?;

    let kind = if is_move { OperationKind::MoveUpload } else { OperationKind::CopyUpload };
    let mut params = OperationParams::from_config(
        kind,
        server_params(&server, config, &opts),
        PathStyle::Unix,
        src_parent.clone(),
        remote_dir.clone(),
        config,
    );
    apply_operation_opts(&mut params, &opts);
    let op = Arc::new(Operation::new(params));

    let item_kind = if src.is_dir() {
        let payload = Box::new(UploadExplore {
            tgt_path: remote_dir.clone(),
            tgt_name: src_name.clone(),
        });
        if is_move {
            ItemKind::UploadMoveExploreDir(payload)
        } else {
            ItemKind::UploadCopyExploreDir(payload)
        }
    } else {
        let size = std::fs::metadata(src).ok().map(|m| m.len());
        match size {
            Some(b) => op.add_total_bytes(b),
            None => op.add_unknown_size(),
        }
        let payload = Box::new(UploadFile {
            tgt_path: remote_dir.clone(),
            tgt_name: src_name.clone(),
            size,
            size_in_bytes: true,
            ascii_mode: op.params.ascii.ascii_mode_for(&src_name),
            ignore_ascii_for_binary: false,
            autorename_phase: 0,
            renamed_name: None,
            size_with_crlf_eols: None,
            number_of_eols: None,
            tgt_file_state: TgtFileState::Unknown,
        });
        if is_move {
            ItemKind::UploadMoveFile(payload)
        } else {
            ItemKind::UploadCopyFile(payload)
        }
    };
    op.queue.add_item(Item::new(None, ItemState::Waiting, src_parent, src_name, item_kind));
    run_operation(config, op, &opts, if is_move { "Upload+Del" } else { "Upload" })
}

pub fn handle_chattr(
    config: &Config,
    target: String,
    mode: String,
    opts: OperationOpts,
) -> Result<()> {
    let (alias, remote_path) = crate::parse::parse_alias_and_path(&target)?;
    let server = load_server(config, &alias)?;
    let mode_bits = u32::from_str_radix(&mode, 8)
        .map_err(|_| anyhow::anyhow!("mode 必须是八进制数字，例如 644: {}", mode))?;
    if mode_bits > 0o777 {
        return Err(anyhow::anyhow!("mode 超出范围 (000-777): {}", mode));
    }
    let (parent, name, is_dir) = split_server_path(&remote_path)?;

    let mut params = OperationParams::from_config(
        OperationKind::ChangeAttrs,
        server_params(&server, config, &opts),
        PathStyle::Unix,
        parent.clone(),
        String::new(),
        config,
    );
    params.attr_mode = Some(mode_bits);
    apply_operation_opts(&mut params, &opts);
    let op = Arc::new(Operation::new(params));

    let attrs = Box::new(ChAttrs { mode: mode_bits, unknown_attrs: false, orig_rights: None });
    let item_kind = if is_dir {
        ItemKind::ChAttrsExploreDir { attrs }
    } else {
        ItemKind::ChAttrsFile { attrs }
    };
    op.queue.add_item(Item::new(None, ItemState::Waiting, parent, name, item_kind));
    run_operation(config, op, &opts, "ChAttrs")
}

/// Run one operation to quiescence: spawn the engine threads, pump progress
/// and prompt resolutions, then tear everything down and print the summary.
fn run_operation(
    config: &Config,
    op: Arc<Operation>,
    opts: &OperationOpts,
    action: &str,
) -> Result<()> {
    let disk = DiskIo::spawn();
    let cache = Arc::new(UploadListingCache::new());
    let opened = Arc::new(OpenedFiles::new());
    let ops_list = Arc::new(OperationsList::new());
    let parser = Arc::new(UnixListingParser::default());

    let op_uid = ops_list.add(op.clone());
    // Cross-operation admission: an upload target someone else mutates must
    // not be trusted from cache.
    if op.params.kind.is_upload() {
        let key = op.params.server.key();
        if !ops_list.can_make_changes_on_path(
            &key,
            &op.params.target_path,
            op.params.style,
            op_uid,
        ) {
            cache.report_unknown_change(&key, &op.params.target_path, op.params.style);
        }
    }

    let workers = opts
        .workers
        .unwrap_or(config.workers)
        .clamp(1, 32)
        .min(op.queue.counts().total.max(1) as usize);
    let buf_size = opts.buf_mib.map(|m| m.clamp(1, 8) * 1024 * 1024).unwrap_or(config.buf_size);
    let total_style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
    .map_err(|_| anyhow::anyhow!("无效的进度条模板"))?
    .progress_chars("=> ");
    let (mp, total_pb, header) = crate::util::init_progress_and_mp(opts.verbose, 0, &total_style);
    crate::util::set_startup_header(&header, action, workers, op.params.retry_delay_ms, buf_size);

    for id in 0..workers {
        let handle = spawn_worker(WorkerSpawnCtx {
            id: id as u32,
            op: op.clone(),
            disk: disk.clone(),
            cache: cache.clone(),
            opened: opened.clone(),
            parser: parser.clone(),
            ops_list: Some(ops_list.clone()),
        });
        op.add_worker(handle);
    }

    let start = Instant::now();
    let fail_on_prompt = opts.on_prompt == "fail";
    loop {
        std::thread::sleep(Duration::from_millis(200));
        // Batch mode cannot ask; prompts resolve per --on-prompt.
        while let Some(uid) = op.next_unseen_error() {
            if let Some(view) = op.queue.item_view(uid) {
                if !opts.quiet {
                    let _ = mp.println(format!(
                        "⚠️ {} {}: {}",
                        view.label, view.name, view.problem_text
                    ));
                }
                if !fail_on_prompt {
                    op.queue.skip_item(uid);
                }
            }
        }
        let progress = op.copy_progress();
        if progress.total > 0 {
            total_pb.set_length(progress.total);
            total_pb.set_position(progress.transferred.min(progress.total));
        } else {
            total_pb.set_position(progress.transferred);
        }
        let counts = op.queue.counts();
        if counts.is_quiescent() {
            break;
        }
        // With --on-prompt fail, unresolved prompts can leave delayed parents
        // with nothing runnable; that is as finished as this run gets.
        if fail_on_prompt && counts.ui_needed > 0 {
            let stalled = op
                .queue
                .list_items()
                .iter()
                .all(|v| !matches!(v.state, ItemState::Waiting | ItemState::Processing));
            if stalled {
                break;
            }
        }
    }

    op.stop_workers();
    op.join_workers();
    disk.shutdown();
    let _ = mp.clear();
    header.finish_and_clear();
    total_pb.finish_and_clear();

    let state = op.operation_state();
    let counts = op.queue.counts();
    let progress = op.copy_progress();
    let elapsed = start.elapsed().as_secs_f64();
    if !opts.quiet {
        crate::util::print_summary(
            progress.transferred,
            elapsed,
            counts.done as u64,
            counts.skipped as u64,
            (counts.failed + counts.ui_needed) as u64,
        );
    }

    // Failed and unresolved items land in the canonical logs directory.
    let failures: Vec<(String, String)> = op
        .queue
        .list_items()
        .into_iter()
        .filter(|view: &ItemView| view.state.is_error() && view.state != ItemState::Skipped)
        .map(|view| (format!("{}/{}", view.path.trim_end_matches('/'), view.name), view.problem_text))
        .collect();
    let mut failures_path = None;
    if !failures.is_empty() {
        failures_path = crate::util::write_failures_jsonl(
            config.logs_dir().map(|d| d.join("failures.jsonl")),
            &failures,
        );
        if !opts.quiet
            && let Some(ref p) = failures_path
        {
            println!("失败清单已写入: {}", p.display());
        }
    }

    if opts.json {
        let summary_obj = serde_json::json!({
            "action": action,
            "state": format!("{:?}", state),
            "total_bytes": progress.transferred,
            "elapsed_secs": elapsed,
            "done": counts.done,
            "skipped": counts.skipped,
            "failed": counts.failed + counts.ui_needed,
            "failures_path": failures_path.as_ref().map(|p| p.to_string_lossy().to_string()),
        });
        if let Ok(line) = serde_json::to_string(&summary_obj) {
            println!("{}", line);
        }
    }

    // Panel-style change notifications: with no panel attached, surface the
    // touched paths in the log.
    for changed in ops_list.remove(op_uid, true) {
        tracing::info!(
            "[op] path changed: {} (subdirs: {}, soft: {})",
            changed.path,
            changed.including_subdirs,
            changed.soft_refresh
        );
    }

    match state {
        OperationState::FinishedWithErrors => {
            Err(anyhow::anyhow!("操作完成，但存在失败项 (failed: {})", counts.failed + counts.ui_needed))
        }
        _ => Ok(()),
    }
}
