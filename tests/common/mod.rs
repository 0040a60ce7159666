//! In-process FTP server for end-to-end tests: a TcpListener plus an
//! in-memory tree, speaking just enough of the protocol for the engine's
//! command sequences (USER/PASS, SYST, TYPE, CWD/PWD, PASV, LIST, RETR,
//! STOR/APPE, REST, DELE, RMD, MKD, QUIT).

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Node {
    File(Vec<u8>),
    Dir,
}

/// Path-keyed tree; directories are explicit entries, children are found by
/// prefix. All paths are absolute, '/'-separated, no trailing slash.
pub struct MockFs {
    pub nodes: BTreeMap<String, Node>,
    /// Name whose first RETR is cut short (half the data, then the session
    /// dies) to exercise reconnect-and-resume.
    pub flaky: Option<String>,
    pub flaky_tripped: bool,
}

impl MockFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        MockFs { nodes, flaky: None, flaky_tripped: false }
    }

    pub fn add_dir(&mut self, path: &str) {
        let mut current = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            self.nodes.insert(current.clone(), Node::Dir);
        }
    }

    pub fn add_file(&mut self, path: &str, data: &[u8]) {
        if let Some(pos) = path.rfind('/')
            && pos > 0
        {
            self.add_dir(&path[..pos]);
        }
        self.nodes.insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(&normalize(path)), Some(Node::Dir))
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.nodes.remove(&normalize(path)).is_some()
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        let dir = normalize(dir);
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        self.nodes
            .iter()
            .filter(|(path, _)| {
                path.starts_with(&prefix)
                    && path.len() > prefix.len()
                    && !path[prefix.len()..].contains('/')
            })
            .map(|(path, node)| (path[prefix.len()..].to_string(), node.clone()))
            .collect()
    }

    fn has_children(&self, dir: &str) -> bool {
        !self.children(dir).is_empty()
    }

    fn listing_text(&self, dir: &str) -> String {
        let mut out = String::new();
        for (name, node) in self.children(dir) {
            match node {
                Node::Dir => {
                    out.push_str(&format!(
                        "drwxr-xr-x   2 ftp  ftp      4096 Jan  5 12:30 {}\r\n",
                        name
                    ));
                }
                Node::File(data) => {
                    out.push_str(&format!(
                        "-rw-r--r--   1 ftp  ftp  {:8} Jan  5 12:30 {}\r\n",
                        data.len(),
                        name
                    ));
                }
            }
        }
        out
    }
}

fn normalize(path: &str) -> String {
    if path == "/" {
        return path.to_string();
    }
    path.trim_end_matches('/').to_string()
}

fn join(cwd: &str, name: &str) -> String {
    if name.starts_with('/') {
        normalize(name)
    } else if cwd == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", normalize(cwd), name)
    }
}

pub struct MockFtpServer {
    pub addr: std::net::SocketAddr,
    pub fs: Arc<Mutex<MockFs>>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
}

impl MockFtpServer {
    pub fn start(fs: MockFs) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let fs = Arc::new(Mutex::new(fs));
        let stop = Arc::new(AtomicBool::new(false));
        let fs_thread = fs.clone();
        let stop_thread = stop.clone();
        let accept_thread = std::thread::spawn(move || {
            let mut sessions = Vec::new();
            while !stop_thread.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let fs = fs_thread.clone();
                        let stop = stop_thread.clone();
                        sessions.push(std::thread::spawn(move || {
                            let _ = serve_session(stream, fs, stop);
                        }));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Err(_) => break,
                }
            }
            for session in sessions {
                let _ = session.join();
            }
        });
        MockFtpServer { addr, fs, stop, accept_thread: Some(accept_thread) }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockFtpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_session(
    stream: TcpStream,
    fs: Arc<Mutex<MockFs>>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(300)))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut cwd = "/".to_string();
    let mut pending_data: Option<TcpListener> = None;
    let mut rest_offset: u64 = 0;

    writer.write_all(b"220 mock FTP ready\r\n")?;
    let mut line = String::new();
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
        let trimmed = line.trim_end();
        let (verb, arg) = match trimmed.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (trimmed.to_ascii_uppercase(), String::new()),
        };
        match verb.as_str() {
            "USER" => writer.write_all(b"331 password please\r\n")?,
            "PASS" => writer.write_all(b"230 logged in\r\n")?,
            "SYST" => writer.write_all(b"215 UNIX Type: L8\r\n")?,
            "TYPE" => writer.write_all(b"200 type set\r\n")?,
            "NOOP" => writer.write_all(b"200 ok\r\n")?,
            "CWD" => {
                let target = join(&cwd, &arg);
                if fs.lock().unwrap().is_dir(&target) {
                    cwd = target;
                    writer.write_all(b"250 directory changed\r\n")?;
                } else {
                    writer.write_all(b"550 no such directory\r\n")?;
                }
            }
            "PWD" => {
                writer.write_all(format!("257 \"{}\" is current\r\n", cwd).as_bytes())?;
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0")?;
                let addr = listener.local_addr()?;
                let port = addr.port();
                writer.write_all(
                    format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                        port >> 8,
                        port & 0xff
                    )
                    .as_bytes(),
                )?;
                pending_data = Some(listener);
            }
            "REST" => {
                rest_offset = arg.parse().unwrap_or(0);
                writer.write_all(b"350 restarting\r\n")?;
            }
            "LIST" => {
                let Some(listener) = pending_data.take() else {
                    writer.write_all(b"425 use PASV first\r\n")?;
                    continue;
                };
                let text = fs.lock().unwrap().listing_text(&cwd);
                writer.write_all(b"150 listing follows\r\n")?;
                let (mut data, _) = listener.accept()?;
                data.write_all(text.as_bytes())?;
                drop(data);
                writer.write_all(b"226 transfer complete\r\n")?;
            }
            "RETR" => {
                let Some(listener) = pending_data.take() else {
                    writer.write_all(b"425 use PASV first\r\n")?;
                    continue;
                };
                let full = join(&cwd, &arg);
                let (content, cut_short) = {
                    let mut fs = fs.lock().unwrap();
                    let cut = fs.flaky.as_deref() == Some(arg.as_str()) && !fs.flaky_tripped;
                    if cut {
                        fs.flaky_tripped = true;
                    }
                    (fs.file(&full), cut)
                };
                match content {
                    Some(bytes) => {
                        writer.write_all(b"150 sending\r\n")?;
                        let (mut data, _) = listener.accept()?;
                        let start = (rest_offset as usize).min(bytes.len());
                        if cut_short {
                            // Half the data, then the whole session dies.
                            let end = start + (bytes.len() - start) / 2;
                            data.write_all(&bytes[start..end])?;
                            drop(data);
                            return Ok(());
                        }
                        data.write_all(&bytes[start..])?;
                        drop(data);
                        rest_offset = 0;
                        writer.write_all(b"226 transfer complete\r\n")?;
                    }
                    None => {
                        rest_offset = 0;
                        writer.write_all(b"550 no such file\r\n")?;
                    }
                }
            }
            "STOR" | "APPE" => {
                let Some(listener) = pending_data.take() else {
                    writer.write_all(b"425 use PASV first\r\n")?;
                    continue;
                };
                writer.write_all(b"150 ready to receive\r\n")?;
                let (mut data, _) = listener.accept()?;
                let mut received = Vec::new();
                data.read_to_end(&mut received)?;
                drop(data);
                let full = join(&cwd, &arg);
                {
                    let mut fs = fs.lock().unwrap();
                    if verb == "APPE"
                        && let Some(mut existing) = fs.file(&full)
                    {
                        existing.extend_from_slice(&received);
                        fs.add_file(&full, &existing);
                    } else {
                        fs.add_file(&full, &received);
                    }
                }
                writer.write_all(b"226 stored\r\n")?;
            }
            "DELE" => {
                let full = join(&cwd, &arg);
                let removed = {
                    let mut fs = fs.lock().unwrap();
                    if fs.is_dir(&full) { false } else { fs.remove(&full) }
                };
                if removed {
                    writer.write_all(b"250 deleted\r\n")?;
                } else {
                    writer.write_all(b"550 delete failed\r\n")?;
                }
            }
            "RMD" => {
                let full = join(&cwd, &arg);
                let removed = {
                    let mut fs = fs.lock().unwrap();
                    if fs.is_dir(&full) && !fs.has_children(&full) {
                        fs.remove(&full)
                    } else {
                        false
                    }
                };
                if removed {
                    writer.write_all(b"250 directory removed\r\n")?;
                } else {
                    writer.write_all(b"550 rmdir failed\r\n")?;
                }
            }
            "MKD" => {
                let full = join(&cwd, &arg);
                let mut fs = fs.lock().unwrap();
                if fs.nodes.contains_key(&full) {
                    writer.write_all(b"550 already exists\r\n")?;
                } else {
                    fs.add_dir(&full);
                    writer.write_all(format!("257 \"{}\" created\r\n", full).as_bytes())?;
                }
            }
            "SITE" => writer.write_all(b"200 site ok\r\n")?,
            "QUIT" => {
                writer.write_all(b"221 bye\r\n")?;
                return Ok(());
            }
            _ => writer.write_all(b"502 not implemented\r\n")?,
        }
    }
}

/// Unique scratch directory for local targets/sources.
pub fn make_tmp_dir(tag: &str) -> std::path::PathBuf {
    let mut base = std::env::temp_dir();
    let uniq = format!(
        "fp_e2e_{}_{}_{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    );
    base.push(uniq);
    std::fs::create_dir(&base).expect("create tmp dir");
    base
}
