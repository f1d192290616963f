use std::io;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const DELIMITER: u8 = b'\n';

/// Frames longer than this are discarded instead of buffered forever.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

pub fn encode<T>(message: &T) -> io::Result<Vec<u8>>
where
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(DELIMITER);
    Ok(encoded)
}

/// Splits `buffer` on the delimiter and parses every complete segment.
///
/// Returns the decoded messages in order plus the trailing bytes after the
/// last delimiter, which belong to a frame that has not fully arrived yet.
pub fn decode_stream<T>(buffer: &[u8]) -> (Vec<T>, &[u8])
where
    T: DeserializeOwned,
{
    let mut messages = Vec::new();
    let mut rest = buffer;

    while let Some(pos) = rest.iter().position(|&byte| byte == DELIMITER) {
        if let Some(message) = parse_segment(&rest[..pos]) {
            messages.push(message);
        }
        rest = &rest[pos + 1..];
    }

    (messages, rest)
}

fn parse_segment<T>(segment: &[u8]) -> Option<T>
where
    T: DeserializeOwned,
{
    let segment = segment.strip_suffix(b"\r").unwrap_or(segment);
    if segment.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    match serde_json::from_slice(segment) {
        Ok(message) => Some(message),
        Err(error) => {
            debug!(%error, len = segment.len(), "discarding malformed frame");
            None
        }
    }
}

/// Accumulates bytes from a stream and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
    // Set while skipping the tail of an oversized frame.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
            discarding: false,
        }
    }

    pub fn feed<T>(&mut self, bytes: &[u8]) -> Vec<T>
    where
        T: DeserializeOwned,
    {
        let mut messages = Vec::new();
        let mut input = bytes;

        while !input.is_empty() {
            match input.iter().position(|&byte| byte == DELIMITER) {
                Some(pos) => {
                    let (head, tail) = (&input[..pos], &input[pos + 1..]);
                    if self.discarding {
                        self.discarding = false;
                    } else if self.buffer.len() + head.len() > self.max_frame_len {
                        debug!(
                            len = self.buffer.len() + head.len(),
                            limit = self.max_frame_len,
                            "discarding oversized frame"
                        );
                    } else if self.buffer.is_empty() {
                        messages.extend(parse_segment(head));
                    } else {
                        self.buffer.extend_from_slice(head);
                        messages.extend(parse_segment(&self.buffer));
                    }
                    self.buffer.clear();
                    input = tail;
                }
                None => {
                    if !self.discarding {
                        if self.buffer.len() + input.len() > self.max_frame_len {
                            debug!(limit = self.max_frame_len, "frame exceeds limit, skipping");
                            self.buffer.clear();
                            self.discarding = true;
                        } else {
                            self.buffer.extend_from_slice(input);
                        }
                    }
                    input = &[];
                }
            }
        }

        messages
    }
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode(message)?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
