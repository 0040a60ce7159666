use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::Result;
use regex::Regex;

use crate::EngineError;

/// Lifecycle of a data connection, surfaced in the worker status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataConnState {
    DoesNotExist,
    OnlyAllocated,
    WaitingForConnection,
    TransferringData,
    TransferFinished,
}

/// Timeouts bounding data-connection setup, host-configured.
#[derive(Debug, Clone, Copy)]
pub struct DataTimeouts {
    /// Passive dial / active accept.
    pub establish: Duration,
    /// First byte after the transfer command.
    pub start: Duration,
}

impl Default for DataTimeouts {
    fn default() -> Self {
        DataTimeouts { establish: Duration::from_secs(20), start: Duration::from_secs(30) }
    }
}

/// Parse the (h1,h2,h3,h4,p1,p2) tuple out of a 227 PASV reply.
pub fn parse_pasv_reply(text: &str) -> Result<SocketAddr> {
    let re = Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})")
        .expect("valid pasv regex");
    let caps = re
        .captures(text)
        .ok_or_else(|| EngineError::PassiveReplyUnparsable(text.trim_end().to_string()))?;
    let mut oct = [0u8; 6];
    for (i, slot) in oct.iter_mut().enumerate() {
        *slot = caps[i + 1]
            .parse::<u16>()
            .ok()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| EngineError::PassiveReplyUnparsable(text.trim_end().to_string()))?;
    }
    let ip = IpAddr::V4(Ipv4Addr::new(oct[0], oct[1], oct[2], oct[3]));
    let port = u16::from(oct[4]) << 8 | u16::from(oct[5]);
    Ok(SocketAddr::new(ip, port))
}

/// Build the PORT argument for an active-mode listen address.
pub fn format_port_argument(addr: &SocketAddr) -> Result<String> {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            let p = addr.port();
            Ok(format!("{},{},{},{},{},{}", o[0], o[1], o[2], o[3], p >> 8, p & 0xff))
        }
        IpAddr::V6(_) => Err(EngineError::ListenFailed("PORT needs an IPv4 address".into()).into()),
    }
}

/// A data connection being set up: either we dial the server (passive) or we
/// listen and the server dials us (active).
pub enum PendingData {
    Passive { target: SocketAddr },
    Active { listener: TcpListener },
}

impl PendingData {
    /// Passive mode: remember the server-announced endpoint from the PASV reply.
    pub fn passive(pasv_reply_text: &str) -> Result<Self> {
        Ok(PendingData::Passive { target: parse_pasv_reply(pasv_reply_text)? })
    }

    /// Active mode: open a listen socket on the control connection's local
    /// interface with an OS-assigned port.
    pub fn active(local_ip: IpAddr) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(local_ip, 0))
            .map_err(|e| EngineError::ListenFailed(e.to_string()))?;
        Ok(PendingData::Active { listener })
    }

    /// Address to advertise with PORT (active mode only).
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match self {
            PendingData::Active { listener } => listener.local_addr().ok(),
            PendingData::Passive { .. } => None,
        }
    }

    /// Establish the stream: dial (passive) or accept (active), bounded by
    /// the establish timeout.
    pub fn establish(self, timeouts: DataTimeouts) -> Result<DataStream> {
        let stream = match self {
            PendingData::Passive { target } => {
                TcpStream::connect_timeout(&target, timeouts.establish)
                    .map_err(|_| EngineError::DataConnectTimeout)?
            }
            PendingData::Active { listener } => accept_with_deadline(&listener, timeouts.establish)?,
        };
        stream.set_read_timeout(Some(timeouts.start))?;
        stream.set_write_timeout(Some(timeouts.start))?;
        Ok(DataStream { stream, bytes_moved: 0, state: DataConnState::TransferringData })
    }
}

fn accept_with_deadline(listener: &TcpListener, timeout: Duration) -> Result<TcpStream> {
    // Poll-accept: the listener has no native accept timeout.
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _peer)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(EngineError::DataConnectTimeout.into());
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(anyhow::Error::from(e)),
        }
    }
}

/// An established data stream. Reads and writes move whole flush-buffer
/// chunks; the worker suspends between chunks to run disk work.
#[derive(Debug)]
pub struct DataStream {
    stream: TcpStream,
    bytes_moved: u64,
    state: DataConnState,
}

impl DataStream {
    /// Read up to `buf.len()` bytes. Ok(0) = orderly close (end of transfer).
    /// A timeout before the first byte maps to `DataStartTimeout`.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => {
                self.state = DataConnState::TransferFinished;
                Ok(0)
            }
            Ok(n) => {
                self.bytes_moved += n as u64;
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if self.bytes_moved == 0 {
                    Err(EngineError::DataStartTimeout.into())
                } else {
                    Err(EngineError::ConnectionClosed { timed_out: true }.into())
                }
            }
            Err(e) => Err(anyhow::Error::from(e)),
        }
    }

    pub fn write_chunk(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        self.bytes_moved += buf.len() as u64;
        Ok(())
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved
    }

    pub fn state(&self) -> DataConnState {
        self.state
    }

    /// Close the sending side so the server sees EOF on an upload.
    pub fn finish_upload(&mut self) -> Result<()> {
        self.state = DataConnState::TransferFinished;
        self.stream.shutdown(std::net::Shutdown::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_parses_ip_and_port() {
        let addr =
            parse_pasv_reply("227 Entering Passive Mode (192,168,1,9,19,137).\r\n").unwrap();
        assert_eq!(addr.ip().to_string(), "192.168.1.9");
        assert_eq!(addr.port(), 19 * 256 + 137);
    }

    #[test]
    fn pasv_reply_without_tuple_fails() {
        assert!(parse_pasv_reply("227 whatever\r\n").is_err());
        assert!(parse_pasv_reply("227 (300,1,1,1,1,1)\r\n").is_err());
    }

    #[test]
    fn port_argument_round_trips() {
        let addr: SocketAddr = "10.0.0.2:4040".parse().unwrap();
        assert_eq!(format_port_argument(&addr).unwrap(), "10,0,0,2,15,200");
    }

    #[test]
    fn active_listen_accepts_within_deadline() {
        let pending = PendingData::active(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let addr = pending.listen_addr().unwrap();
        let dialer = std::thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(b"ping").unwrap();
        });
        let timeouts =
            DataTimeouts { establish: Duration::from_secs(5), start: Duration::from_secs(5) };
        let mut stream = pending.establish(timeouts).unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        dialer.join().unwrap();
    }

    #[test]
    fn active_listen_times_out_without_peer() {
        let pending = PendingData::active(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let timeouts =
            DataTimeouts { establish: Duration::from_millis(80), start: Duration::from_secs(1) };
        let err = pending.establish(timeouts).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::DataConnectTimeout) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
