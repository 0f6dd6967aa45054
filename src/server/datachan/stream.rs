//! The byte stream of a data connection, plain or TLS.

use super::ports::PortReservation;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// The byte stream of a data connection, in the clear or wrapped in TLS.
#[derive(Debug)]
pub enum DataStream {
    /// A plain TCP connection.
    Plain(TcpStream),
    /// A TLS session over TCP with the handshake already completed.
    Tls(Box<TlsStream<TcpStream>>),
}

impl DataStream {
    /// Tells whether the stream is encrypted.
    pub fn is_secure(&self) -> bool {
        matches!(self, DataStream::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            DataStream::Plain(s) => s,
            DataStream::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for DataStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An open data connection, ready for one transfer.
///
/// A connection made through a passive port keeps that port reserved until the connection is
/// dropped.
#[derive(Debug)]
pub struct DataConnection {
    stream: DataStream,
    peer: SocketAddr,
    local: SocketAddr,
    _reservation: Option<PortReservation>,
}

impl DataConnection {
    pub(crate) fn new(stream: DataStream, reservation: Option<PortReservation>) -> io::Result<DataConnection> {
        let tcp = stream.tcp();
        let peer = tcp.peer_addr()?;
        let local = tcp.local_addr()?;
        Ok(DataConnection {
            stream,
            peer,
            local,
            _reservation: reservation,
        })
    }

    /// The client side address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The server side address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Tells whether the connection is encrypted.
    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    /// The stream to read from or write to.
    pub fn stream(&mut self) -> &mut DataStream {
        &mut self.stream
    }
}
