use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::Result;

use crate::EngineError;
use crate::ftp::reply::{Reply, read_reply_from};

/// Transfer type currently set on the control connection (TYPE A / TYPE I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Ascii,
    Binary,
}

impl TransferType {
    pub fn command(self) -> &'static str {
        match self {
            TransferType::Ascii => "TYPE A",
            TransferType::Binary => "TYPE I",
        }
    }
}

/// Timeouts applied to the control connection, host-configured.
#[derive(Debug, Clone, Copy)]
pub struct ControlTimeouts {
    pub connect: Duration,
    pub reply: Duration,
}

impl Default for ControlTimeouts {
    fn default() -> Self {
        ControlTimeouts { connect: Duration::from_secs(10), reply: Duration::from_secs(30) }
    }
}

/// One FTP control connection. Commands are strictly serial: the next command
/// is not written until the previous one's final reply arrived (or timed out).
///
/// The working directory and transfer type are cached so per-item sequences
/// can skip redundant CWD/TYPE commands.
pub struct ControlConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    pub addr: String,
    /// Greeting text, kept verbatim for the host's server-detection needs.
    pub first_reply: Option<String>,
    /// SYST answer, used as the listing-parser hint.
    pub server_system: Option<String>,
    working_dir: Option<String>,
    transfer_type: Option<TransferType>,
    /// MODE Z was offered and acknowledged (observed only, never used).
    pub compression_agreed: bool,
}

impl ControlConnection {
    /// Resolve the address and open the TCP stream. The greeting is NOT read
    /// here; connecting and greeting are separate phases for the worker state
    /// machine.
    pub fn connect(host: &str, port: u16, timeouts: ControlTimeouts) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let mut addrs = addr
            .to_socket_addrs()
            .map_err(|_| EngineError::NoAddress(addr.clone()))?;
        let sock = addrs.next().ok_or_else(|| EngineError::NoAddress(addr.clone()))?;
        let stream = TcpStream::connect_timeout(&sock, timeouts.connect).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                EngineError::ConnectTimeout(addr.clone())
            } else {
                EngineError::ConnectFailed(addr.clone(), e.to_string())
            }
        })?;
        stream.set_read_timeout(Some(timeouts.reply))?;
        stream.set_write_timeout(Some(timeouts.reply))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(ControlConnection {
            stream,
            reader,
            addr,
            first_reply: None,
            server_system: None,
            working_dir: None,
            transfer_type: None,
            compression_agreed: false,
        })
    }

    /// Read the server greeting (the very first reply after connect).
    pub fn read_greeting(&mut self) -> Result<Reply> {
        let reply = self.read_reply()?;
        self.first_reply = Some(reply.text.clone());
        Ok(reply)
    }

    /// Write one command line. Passwords are the caller's business to keep
    /// out of logs; everything else is traced.
    pub fn send(&mut self, line: &str) -> Result<()> {
        if line.starts_with("PASS ") {
            tracing::trace!("[ctrl] {} >> PASS ***", self.addr);
        } else {
            tracing::trace!("[ctrl] {} >> {}", self.addr, line);
        }
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        Ok(())
    }

    /// Read a single reply; may be a 1xx preliminary.
    pub fn read_reply(&mut self) -> Result<Reply> {
        let reply = read_reply_from(&mut self.reader)?;
        tracing::trace!("[ctrl] {} << {}", self.addr, reply.first_line());
        Ok(reply)
    }

    /// Send a command and wait for its final reply, skipping 1xx
    /// preliminaries. This is the workhorse of every scripted sequence.
    pub fn command(&mut self, line: &str) -> Result<Reply> {
        self.send(line)?;
        loop {
            let reply = self.read_reply()?;
            if !reply.is_preliminary() {
                return Ok(reply);
            }
        }
    }

    /// The connection was used for something that may have moved the working
    /// directory without us noticing (proxy scripts, init commands).
    pub fn invalidate_working_dir(&mut self) {
        self.working_dir = None;
    }

    /// Record a CWD issued outside `ensure_working_dir`.
    pub fn note_working_dir(&mut self, path: &str) {
        self.working_dir = Some(path.to_string());
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    pub fn transfer_type(&self) -> Option<TransferType> {
        self.transfer_type
    }

    /// Record a TYPE command issued outside `ensure_type`.
    pub fn note_transfer_type(&mut self, ty: TransferType) {
        self.transfer_type = Some(ty);
    }

    /// SYST; the answer seeds the listing-parser hint.
    pub fn query_system(&mut self) -> Result<Reply> {
        let reply = self.command("SYST")?;
        if reply.is_success() {
            let text = reply.first_line();
            self.server_system = Some(text.trim_start_matches(|c: char| c.is_ascii_digit() || c == ' ').to_string());
        }
        Ok(reply)
    }

    /// Polite shutdown; errors are ignored, the socket is going away anyway.
    pub fn quit(&mut self) {
        let _ = self.send("QUIT");
        let _ = self.read_reply();
    }

    /// Local address of the control socket; active-mode data connections bind
    /// to the same interface.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.stream.local_addr()?)
    }
}

/// Extract a "quoted path" from a 257 reply. Doubled quotes inside the path
/// are an escape for one literal quote.
pub fn extract_quoted_path(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_path_extraction() {
        assert_eq!(
            extract_quoted_path("257 \"/home/joe\" is current directory.\r\n").as_deref(),
            Some("/home/joe")
        );
        assert_eq!(
            extract_quoted_path("257 \"/odd\"\"name\" created.\r\n").as_deref(),
            Some("/odd\"name")
        );
        assert_eq!(extract_quoted_path("257 no quotes here\r\n"), None);
        assert_eq!(extract_quoted_path("257 \"unterminated\r\n"), None);
    }

    #[test]
    fn transfer_type_commands() {
        assert_eq!(TransferType::Ascii.command(), "TYPE A");
        assert_eq!(TransferType::Binary.command(), "TYPE I");
    }
}
