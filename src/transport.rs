//! Raw transport: DNS resolution, TCP connect, and optional TLS upgrade.
//!
//! This module has no knowledge of the PostgreSQL wire format; it hands a
//! connected (and, if applicable, TLS-wrapped) stream to
//! [`crate::buffer::FramedBuffer`].

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::opts::SslMode;

/// A connected transport stream, plain or TLS.
pub enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "sync-tls")]
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Stream {
    /// Whether this stream is already TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        match self {
            Stream::Plain(_) => false,
            #[cfg(feature = "sync-tls")]
            Stream::Tls(_) => true,
        }
    }

    fn tcp_ref(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.get_ref(),
        }
    }

    /// Upgrade a plain stream to TLS in place.
    #[cfg(feature = "sync-tls")]
    pub fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        match self {
            Stream::Plain(tcp) => {
                let connector = native_tls::TlsConnector::new()?;
                let tls = connector.connect(host, tcp).map_err(|e| match e {
                    native_tls::HandshakeError::Failure(e) => Error::Tls(e),
                    native_tls::HandshakeError::WouldBlock(_) => {
                        Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "TLS handshake would block"))
                    }
                })?;
                Ok(Stream::Tls(Box::new(tls)))
            }
            Stream::Tls(_) => Err(Error::InvalidUsage("stream is already TLS".into())),
        }
    }

    /// True if the peer address is loopback (used by feature detection and
    /// diagnostics, not a connection decision).
    pub fn is_loopback(&self) -> bool {
        self.tcp_ref()
            .peer_addr()
            .map(|addr| addr.ip().is_loopback())
            .unwrap_or(false)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// Resolve `host:port` and attempt a TCP connect against each candidate
/// address, partitioning the remaining timeout budget evenly across the
/// addresses left to try (`remaining / addresses_left`), so one slow/dead
/// address can't consume the whole budget.
pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;

    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}:{port}"),
        )));
    }

    let mut last_err = None;
    let total = addrs.len();
    for (i, addr) in addrs.into_iter().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout(format!(
                "connecting to {host}:{port} exceeded the configured timeout"
            )));
        }
        let addresses_left = total - i;
        let per_addr_budget = remaining / u32::try_from(addresses_left).unwrap_or(1);

        match TcpStream::connect_timeout(&addr, per_addr_budget) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(Error::Io)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::TimedOut, "connection attempts exhausted")
    })))
}

/// Open a [`Stream`] to `host:port`, performing the in-band TLS upgrade
/// dictated by `ssl_mode`:
///
/// - `Disable`: plain TCP only.
/// - `Prefer`: attempt the SSLRequest negotiation; fall back to plain TCP if
///   the server replies `N` (or the feature isn't compiled in).
/// - `Require`: attempt the SSLRequest negotiation; fail if the server
///   replies `N`.
///
/// The SSLRequest byte-exchange itself happens one level up, in
/// [`crate::connector::Connector::open`], because it needs to share the
/// framed buffer's read path; this function only performs the raw connect.
pub fn raw_open(host: &str, port: u16, timeout: Duration) -> Result<Stream> {
    let tcp = connect_tcp(host, port, timeout)?;
    Ok(Stream::Plain(tcp))
}

/// Whether a given [`SslMode`] requires the connection to fail outright if
/// TLS negotiation is refused by the server.
pub fn ssl_required(mode: SslMode) -> bool {
    matches!(mode, SslMode::Require)
}

/// Whether a given [`SslMode`] should attempt TLS at all.
pub fn ssl_attempted(mode: SslMode) -> bool {
    !matches!(mode, SslMode::Disable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connects_to_a_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let stream = connect_tcp("127.0.0.1", addr.port(), Duration::from_secs(2)).unwrap();
        assert!(stream.peer_addr().is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn ssl_mode_predicates() {
        assert!(!ssl_attempted(SslMode::Disable));
        assert!(ssl_attempted(SslMode::Prefer));
        assert!(!ssl_required(SslMode::Prefer));
        assert!(ssl_required(SslMode::Require));
    }
}
