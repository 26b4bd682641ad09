use crate::error::{PslError, Result};
use crate::sinc::{self, Message, LENGTH_PREFIX};
use log::{debug, info};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// How long the receive worker blocks before re-checking its shutdown flag.
pub const RECEIVE_POLL: Duration = Duration::from_millis(100);

pub const DEFAULT_PORT: u16 = 8756;

/// One TCP connection to a module.
///
/// Writes go through `send`, which callers serialize with the module's
/// send-lock. Reads happen only on the `FrameReader` handed to the receive
/// worker.
#[derive(Debug)]
pub struct Transport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: TcpStream,
}

impl Transport {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addrs = (host, port).to_socket_addrs()?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(timeout))?;
                    info!("connected to {host}:{port} ({addr})");
                    return Ok(Self {
                        host: host.to_string(),
                        port,
                        timeout,
                        stream,
                    });
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => PslError::Io(e),
            None => PslError::BadArgument(format!("'{host}' did not resolve to an address")),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        let frame = sinc::encode(message)?;
        (&self.stream).write_all(&frame)?;
        Ok(())
    }

    /// A reader on a clone of the stream, for the receive worker.
    pub fn reader(&self) -> Result<FrameReader> {
        FrameReader::new(self.stream.try_clone()?, RECEIVE_POLL, self.timeout)
    }

    pub fn disconnect(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => {
                info!("disconnected from {}:{}", self.host, self.port);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct FrameReader {
    stream: TcpStream,
    poll: Duration,
    timeout: Duration,
}

impl FrameReader {
    pub fn new(stream: TcpStream, poll: Duration, timeout: Duration) -> Result<Self> {
        stream.set_read_timeout(Some(poll))?;
        Ok(Self {
            stream,
            poll,
            timeout,
        })
    }

    /// Read one message.
    ///
    /// Returns `Ok(None)` when nothing arrived within the poll interval. Once
    /// the first byte of a frame is in, the rest must arrive within the full
    /// timeout. A complete frame that fails to decode yields `PslError::Decode`
    /// and leaves the stream positioned at the next frame.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        match self.stream.read(&mut prefix[..1]) {
            Ok(0) => {
                return Err(PslError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )))
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        self.stream.set_read_timeout(Some(self.timeout))?;
        let frame = self.read_rest(&mut prefix);
        self.stream.set_read_timeout(Some(self.poll))?;
        let frame = frame?;
        sinc::decode(&frame).map(Some)
    }

    fn read_rest(&mut self, prefix: &mut [u8; LENGTH_PREFIX]) -> Result<Vec<u8>> {
        self.stream.read_exact(&mut prefix[1..])?;
        let len = match sinc::frame_len(*prefix) {
            Ok(len) => len,
            // A bad length means the stream is out of sync; treat it as fatal.
            Err(e) => return Err(PslError::Protocol(e.to_string())),
        };
        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame)?;
        Ok(frame)
    }
}
