//! Newline-delimited JSON transport
//!
//! Every message is one compact JSON value followed by a single `\n`.
//! Incoming bytes are accumulated per connection in a bounded buffer; a
//! line longer than the bound, terminated or not, is a fatal protocol
//! error for that connection.

use std::io;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::common::{Error, Result};

/// Default maximum frame size (100 KB)
pub const DEFAULT_MAX_FRAME: usize = 100 * 1024;

/// Accumulates raw bytes and hands out complete newline-terminated frames
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl LineFramer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame,
        }
    }

    /// Append received bytes
    ///
    /// Fails once the unterminated tail of the buffer exceeds the maximum
    /// frame size.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        let tail = match self.buffer.iter().rposition(|&b| b == b'\n') {
            Some(newline) => self.buffer.len() - newline - 1,
            None => self.buffer.len(),
        };
        if tail > self.max_frame {
            return Err(Error::FrameTooLarge(self.max_frame));
        }
        Ok(())
    }

    /// Take the next complete frame, without its newline
    ///
    /// A terminated frame longer than the maximum is as fatal as an
    /// unterminated one, however the bytes were split across reads.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        if end > self.max_frame {
            return Err(Error::FrameTooLarge(self.max_frame));
        }
        let mut frame: Vec<u8> = self.buffer.drain(..=end).collect();
        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        Ok(Some(frame))
    }

    /// Bytes received but not yet framed
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Serialize a value compactly and write it as one line
pub async fn send_message<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut data = serde_json::to_vec(value)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line and decode it as JSON
///
/// Returns `UnexpectedEof` as an IO error when the stream ends first.
pub async fn recv_message<R, T>(reader: &mut R, max_frame: usize) -> Result<T>
where
    R: AsyncBufRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    if line.len() > max_frame {
        return Err(Error::FrameTooLarge(max_frame));
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Create the listener for incoming runner connections
pub async fn create_listener<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a running step server
pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[test]
    fn test_frames_split_across_pushes() {
        let mut framer = LineFramer::new(DEFAULT_MAX_FRAME);
        framer.push(b"[\"end_sc").unwrap();
        assert!(framer.next_frame().unwrap().is_none());

        framer.push(b"enario\"]\n[\"beg").unwrap();
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"[\"end_scenario\"]");
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.pending(), 5);
    }

    #[test]
    fn test_several_frames_in_one_push() {
        let mut framer = LineFramer::new(DEFAULT_MAX_FRAME);
        framer.push(b"[1]\n[2]\r\n[3]\n").unwrap();
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"[1]");
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"[2]");
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"[3]");
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let mut framer = LineFramer::new(8);
        framer.push(b"0123").unwrap();
        let err = framer.push(b"456789").unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(8)));
    }

    #[test]
    fn test_oversized_frame_in_one_push_is_fatal() {
        let mut framer = LineFramer::new(8);
        framer.push(b"[1]\n0123456789\n").unwrap();
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"[1]");
        let err = framer.next_frame().unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(8)));

        let mut framer = LineFramer::new(8);
        framer.push(b"01234567\n").unwrap();
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"01234567");
    }

    #[test]
    fn test_unterminated_tail_is_bounded() {
        let mut framer = LineFramer::new(8);
        framer.push(b"[1]\n0123456789").unwrap_err();

        let mut framer = LineFramer::new(8);
        framer.push(b"[1]\n[2]\n[3]\n").unwrap();
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"[1]");
    }

    #[tokio::test]
    async fn test_send_message_appends_newline() {
        let mut output = Vec::new();
        send_message(&mut output, &json!(["success"])).await.unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "[\"success\"]\n");
    }

    #[tokio::test]
    async fn test_recv_message() {
        let data = b"[\"success\",[]]\n[\"fail\"]\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(data));

        let first: Value = recv_message(&mut reader, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(first, json!(["success", []]));
        let second: Value = recv_message(&mut reader, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(second, json!(["fail"]));

        let eof = recv_message::<_, Value>(&mut reader, DEFAULT_MAX_FRAME).await;
        assert!(matches!(eof, Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
