use bytes::{BufMut, Bytes, BytesMut};
use std::marker::Unpin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::error::Error;
use super::response::Response;
use super::settings::Settings;

/// A single SCGI connection.
///
/// Wraps the accepted stream with a read-ahead buffer. Bytes read past
/// the end of the header block stay buffered and are handed out as the
/// start of the body. Every read and write is bounded by the timeouts
/// from `Settings`.
pub struct Connection<S>
{
    stream: S,
    buffer: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration
}

impl<S> Connection<S>
{
    pub fn new(stream: S, settings: &Settings) -> Connection<S>
    {
        Connection{stream,
                   buffer: BytesMut::new(),
                   read_timeout: settings.read_timeout,
                   write_timeout: settings.write_timeout
        }
    }

    /// Bytes read from the stream but not consumed yet
    pub fn buffered(&self) -> &[u8]
    {
        &self.buffer
    }

    pub fn get_ref(&self) -> &S
    {
        &self.stream
    }

    pub fn into_inner(self) -> S
    {
        self.stream
    }
}

impl<S> Connection<S>
    where S: AsyncRead + Unpin
{
    /// Perform one read of at most `max` bytes into the buffer.
    /// Returns the number of bytes read, 0 at end of stream.
    pub async fn fill(&mut self, max: usize) -> Result<usize, Error>
    {
        self.buffer.reserve(max);
        let mut limited = (&mut self.buffer).limit(max);
        match timeout(self.read_timeout,
                      self.stream.read_buf(&mut limited)).await {
            Err(_) => Err(Error::timeout("Read")),
            Ok(res) => Ok(res?)
        }
    }

    /// Take exactly `len` bytes, reading more from the stream as
    /// needed. A stream that ends early fails with `UnexpectedEnd`.
    pub async fn read_exact_bytes(&mut self, len: usize) -> Result<Bytes, Error>
    {
        if self.buffer.len() < len {
            self.buffer.reserve(len - self.buffer.len());
        }
        while self.buffer.len() < len {
            let want = len - self.buffer.len();
            if self.fill(want).await? == 0 {
                return Err(Error::UnexpectedEnd);
            }
        }
        Ok(self.buffer.split_to(len).freeze())
    }
}

impl<S> Connection<S>
    where S: AsyncWrite + Unpin
{
    pub async fn write_response(&mut self, resp: &Response) -> Result<(), Error>
    {
        resp.write(&mut self.stream, self.write_timeout).await
    }

    /// Close the write side, bounded by the write timeout
    pub async fn shutdown(&mut self) -> Result<(), Error>
    {
        match timeout(self.write_timeout, self.stream.shutdown()).await {
            Err(_) => Err(Error::timeout("Shutdown")),
            Ok(res) => Ok(res?)
        }
    }
}

#[cfg(test)]
use tokio::runtime::Runtime;

#[test]
fn test_read_exact_fragmented()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let input = (&b"abc"[..]).chain(&b"de"[..]).chain(&b"fghij"[..]);
        let mut conn = Connection::new(input, &Settings::new());
        let first = conn.read_exact_bytes(4).await.unwrap();
        assert_eq!(&first[..], b"abcd");
        let second = conn.read_exact_bytes(5).await.unwrap();
        assert_eq!(&second[..], b"efghi");
        assert!(matches!(conn.read_exact_bytes(2).await,
                         Err(Error::UnexpectedEnd)));
    });
}

#[test]
fn test_fill_respects_limit()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut conn = Connection::new(&b"0123456789"[..], &Settings::new());
        assert_eq!(conn.fill(3).await.unwrap(), 3);
        assert_eq!(conn.buffered(), b"012");
        assert_eq!(conn.fill(100).await.unwrap(), 7);
        assert_eq!(conn.fill(100).await.unwrap(), 0);
    });
}

#[test]
fn test_read_timeout()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let settings = Settings{read_timeout: Duration::from_millis(50),
                                ..Settings::new()};
        // keep the other end open but silent
        let (client, server) = tokio::io::duplex(64);
        let mut conn = Connection::new(server, &settings);
        let err = conn.read_exact_bytes(1).await.unwrap_err();
        assert!(err.is_timeout());
        drop(client);
    });
}
