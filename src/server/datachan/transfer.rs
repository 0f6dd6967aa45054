//! Moves file and listing bytes over an open data connection.

use super::error::{DataChanError, DataChanErrorKind};
use super::stream::DataConnection;
use crate::options::{DataType, DEFAULT_TRANSFER_BUFFER_SIZE};
use crate::server::session::ActivityTracker;

use bytes::{BufMut, BytesMut};
use slog::Logger;
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// A failed transfer and how many bytes made it across before it failed.
#[derive(Debug, Error)]
#[error("transfer failed after {bytes} bytes")]
pub struct TransferError {
    bytes: u64,
    #[source]
    source: DataChanError,
}

impl TransferError {
    /// The bytes transferred before the failure.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// What went wrong.
    pub fn kind(&self) -> DataChanErrorKind {
        self.source.kind()
    }

    /// The underlying data channel error.
    pub fn into_inner(self) -> DataChanError {
        self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToClient,
    FromClient,
}

impl Direction {
    // Which side failed decides between a network (426) and a local (451) error.
    fn read_error(self) -> DataChanErrorKind {
        match self {
            Direction::ToClient => DataChanErrorKind::LocalError,
            Direction::FromClient => DataChanErrorKind::TransferFailed,
        }
    }

    fn write_error(self) -> DataChanErrorKind {
        match self {
            Direction::ToClient => DataChanErrorKind::TransferFailed,
            Direction::FromClient => DataChanErrorKind::LocalError,
        }
    }
}

/// Copies bytes between a data connection and a local source or sink.
///
/// Every call moves data in one direction, counts the bytes and closes the data connection
/// whatever the outcome. The session's activity timestamp is refreshed for every chunk so that a
/// long transfer does not make the control connection look idle. A peer that stops reading or
/// sending for longer than the idle timeout fails the transfer.
#[derive(Debug, Clone)]
pub struct DataTransferEngine {
    buffer_size: usize,
    max_rate: Option<u64>,
    idle_timeout: Option<Duration>,
    logger: Logger,
}

impl DataTransferEngine {
    /// Creates an engine with the default buffer size and no rate limit.
    pub fn new(logger: Logger) -> DataTransferEngine {
        DataTransferEngine {
            buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
            max_rate: None,
            idle_timeout: None,
            logger,
        }
    }

    /// Sets the size of the chunks data is copied in.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Limits transfers to `bytes_per_sec`. `None` or 0 means unlimited.
    pub fn max_rate(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.max_rate = bytes_per_sec.filter(|r| *r > 0);
        self
    }

    /// Fails a transfer when the data connection makes no progress for `timeout`. Zero means
    /// no limit.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Sends everything `source` yields to the client, as for RETR.
    pub async fn transfer_to_client<R>(
        &self,
        mut conn: DataConnection,
        mut source: R,
        data_type: DataType,
        activity: &ActivityTracker,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.pump(Direction::ToClient, &mut source, conn.stream(), data_type, activity, cancel).await;
        self.finish(conn, result).await
    }

    /// Stores everything the client sends in `sink`, as for STOR.
    pub async fn transfer_from_client<W>(
        &self,
        mut conn: DataConnection,
        mut sink: W,
        data_type: DataType,
        activity: &ActivityTracker,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.pump(Direction::FromClient, conn.stream(), &mut sink, data_type, activity, cancel).await;
        self.finish(conn, result).await
    }

    /// Sends a text, such as a directory listing, to the client.
    pub async fn send_text(&self, conn: DataConnection, text: &str, activity: &ActivityTracker, cancel: &CancellationToken) -> Result<u64, TransferError> {
        self.transfer_to_client(conn, text.as_bytes(), DataType::Binary, activity, cancel).await
    }

    async fn finish(&self, mut conn: DataConnection, result: Result<u64, TransferError>) -> Result<u64, TransferError> {
        if let Err(e) = within(self.idle_timeout, conn.stream().shutdown()).await {
            slog::debug!(self.logger, "Error closing data connection"; "peer" => %conn.peer_addr(), "error" => %e);
        }
        match &result {
            Ok(bytes) => slog::debug!(self.logger, "Transfer complete"; "peer" => %conn.peer_addr(), "bytes" => bytes),
            Err(e) => slog::info!(self.logger, "Transfer failed"; "peer" => %conn.peer_addr(), "bytes" => e.bytes(), "kind" => %e.kind()),
        }
        result
    }

    async fn pump<R, W>(
        &self,
        direction: Direction,
        reader: &mut R,
        writer: &mut W,
        data_type: DataType,
        activity: &ActivityTracker,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut converted = BytesMut::with_capacity(self.buffer_size * 2);
        let mut ascii = AsciiConverter::new(direction);
        let started = Instant::now();
        let mut bytes: u64 = 0;
        // Only the data connection side is bounded; local sources and sinks take as long as they take.
        let (read_limit, write_limit) = match direction {
            Direction::ToClient => (None, self.idle_timeout),
            Direction::FromClient => (self.idle_timeout, None),
        };
        let failed = |bytes, kind, e: io::Error| TransferError {
            bytes,
            source: DataChanError::new(kind, e),
        };
        let aborted = |bytes| TransferError {
            bytes,
            source: DataChanErrorKind::Aborted.into(),
        };

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(aborted(bytes)),
                read = within(read_limit, reader.read(&mut buf)) => read.map_err(|e| failed(bytes, direction.read_error(), e))?,
            };
            let chunk: &[u8] = if n == 0 {
                if data_type == DataType::Ascii {
                    converted.clear();
                    ascii.finish(&mut converted);
                    &converted
                } else {
                    &[]
                }
            } else if data_type == DataType::Ascii {
                converted.clear();
                ascii.convert(&buf[..n], &mut converted);
                &converted
            } else {
                &buf[..n]
            };
            if !chunk.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(aborted(bytes)),
                    written = within(write_limit, writer.write_all(chunk)) => written.map_err(|e| failed(bytes, direction.write_error(), e))?,
                }
            }
            if n == 0 {
                break;
            }
            bytes += n as u64;
            activity.touch();
            self.throttle(bytes, started).await;
        }
        within(write_limit, writer.flush()).await.map_err(|e| failed(bytes, direction.write_error(), e))?;
        Ok(bytes)
    }

    async fn throttle(&self, bytes: u64, started: Instant) {
        let Some(rate) = self.max_rate else {
            return;
        };
        let due = Duration::from_secs_f64(bytes as f64 / rate as f64);
        let elapsed = started.elapsed();
        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }
}

async fn within<T, F>(limit: Option<Duration>, op: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "data connection idle timeout"))),
        None => op.await,
    }
}

// Converts line endings of ASCII mode transfers: LF becomes CRLF towards the client, CRLF becomes
// LF from the client. A CR at the end of a chunk is held back until the next byte is known.
#[derive(Debug)]
struct AsciiConverter {
    direction: Direction,
    last_was_cr: bool,
}

impl AsciiConverter {
    fn new(direction: Direction) -> AsciiConverter {
        AsciiConverter { direction, last_was_cr: false }
    }

    fn convert(&mut self, input: &[u8], out: &mut BytesMut) {
        match self.direction {
            Direction::ToClient => {
                for &b in input {
                    if b == b'\n' && !self.last_was_cr {
                        out.put_u8(b'\r');
                    }
                    out.put_u8(b);
                    self.last_was_cr = b == b'\r';
                }
            }
            Direction::FromClient => {
                for &b in input {
                    if self.last_was_cr && b != b'\n' {
                        out.put_u8(b'\r');
                    }
                    self.last_was_cr = b == b'\r';
                    if !self.last_was_cr {
                        out.put_u8(b);
                    }
                }
            }
        }
    }

    fn finish(&mut self, out: &mut BytesMut) {
        if self.direction == Direction::FromClient && self.last_was_cr {
            out.put_u8(b'\r');
        }
        self.last_was_cr = false;
    }
}
