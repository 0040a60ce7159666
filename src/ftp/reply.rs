use std::io::BufRead;

use anyhow::Result;

use crate::EngineError;

/// Reply class derived from the first digit of the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 1xx — command accepted, more to come (e.g. 150 before a transfer).
    Preliminary,
    /// 2xx — completed successfully.
    Success,
    /// 3xx — accepted, the dialog continues (e.g. 331 after USER).
    Intermediate,
    /// 4xx — transient failure, retry may help.
    TransientError,
    /// 5xx — permanent failure.
    PermanentError,
}

/// One server reply: the final 3-digit code and the verbatim text of every
/// line (multi-line replies included, kept exactly as received).
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn class(&self) -> ReplyClass {
        match self.code / 100 {
            1 => ReplyClass::Preliminary,
            2 => ReplyClass::Success,
            3 => ReplyClass::Intermediate,
            4 => ReplyClass::TransientError,
            _ => ReplyClass::PermanentError,
        }
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == ReplyClass::Preliminary
    }

    pub fn is_success(&self) -> bool {
        self.class() == ReplyClass::Success
    }

    pub fn is_intermediate(&self) -> bool {
        self.class() == ReplyClass::Intermediate
    }

    pub fn is_transient_error(&self) -> bool {
        self.class() == ReplyClass::TransientError
    }

    /// First line without the trailing CRLF, for compact log lines.
    pub fn first_line(&self) -> &str {
        self.text.lines().next().unwrap_or("")
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.first_line())
    }
}

/// Parse "dddX..." into (code, is-multiline-opener). Returns None for lines
/// that do not start a reply.
fn parse_code(line: &str) -> Option<(u16, bool)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code: u16 = line[..3].parse().ok()?;
    match bytes.get(3) {
        Some(b'-') => Some((code, true)),
        Some(b' ') | None | Some(b'\r') | Some(b'\n') => Some((code, false)),
        _ => None,
    }
}

/// Read one complete reply (single- or multi-line) from the control stream.
/// A read of zero bytes means the connection closed; a timeout surfaces as
/// `ConnectionClosed { timed_out: true }` so the worker can decide between
/// reconnect and reporting the item error.
pub fn read_reply_from<R: BufRead>(reader: &mut R) -> Result<Reply> {
    let mut line = String::new();
    let n = read_line_mapped(reader, &mut line)?;
    if n == 0 {
        return Err(EngineError::ConnectionClosed { timed_out: false }.into());
    }
    let Some((code, multiline)) = parse_code(&line) else {
        return Err(EngineError::MalformedReply(line.trim_end().to_string()).into());
    };
    let mut text = line.clone();
    if multiline {
        loop {
            line.clear();
            let n = read_line_mapped(reader, &mut line)?;
            if n == 0 {
                return Err(EngineError::ConnectionClosed { timed_out: false }.into());
            }
            text.push_str(&line);
            if let Some((end_code, false)) = parse_code(&line)
                && end_code == code
            {
                break;
            }
        }
    }
    Ok(Reply { code, text })
}

fn read_line_mapped<R: BufRead>(reader: &mut R, line: &mut String) -> Result<usize> {
    match reader.read_line(line) {
        Ok(n) => Ok(n),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Err(EngineError::ConnectionClosed { timed_out: true }.into())
        }
        Err(e) => Err(anyhow::Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn single_line_reply() {
        let mut input = Cursor::new(b"220 Service ready\r\n".to_vec());
        let reply = read_reply_from(&mut input).unwrap();
        assert_eq!(reply.code, 220);
        assert!(reply.is_success());
        assert_eq!(reply.first_line(), "220 Service ready");
    }

    #[test]
    fn multi_line_reply_keeps_all_lines() {
        let raw = b"211-Features:\r\n SIZE\r\n REST STREAM\r\n211 End\r\n".to_vec();
        let mut input = Cursor::new(raw);
        let reply = read_reply_from(&mut input).unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.text.lines().count(), 4);
    }

    #[test]
    fn embedded_other_codes_do_not_terminate_multiline() {
        let raw = b"226-Transfer summary:\r\n150 bytes in 1 file\r\n226 Done\r\n".to_vec();
        let mut input = Cursor::new(raw);
        let reply = read_reply_from(&mut input).unwrap();
        assert_eq!(reply.code, 226);
        assert!(reply.text.contains("150 bytes"));
    }

    #[test]
    fn garbage_is_malformed() {
        let mut input = Cursor::new(b"hello there\r\n".to_vec());
        let err = read_reply_from(&mut input).unwrap_err();
        assert!(err.downcast_ref::<EngineError>().is_some());
    }

    #[test]
    fn eof_maps_to_connection_closed() {
        let mut input = Cursor::new(Vec::new());
        let err = read_reply_from(&mut input).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::ConnectionClosed { timed_out }) => assert!(!timed_out),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn classes_cover_all_digits() {
        for (code, class) in [
            (150u16, ReplyClass::Preliminary),
            (226, ReplyClass::Success),
            (331, ReplyClass::Intermediate),
            (426, ReplyClass::TransientError),
            (550, ReplyClass::PermanentError),
        ] {
            assert_eq!(Reply { code, text: String::new() }.class(), class);
        }
    }
}
