//! Octet-counted syslog frame decoding
//! Splits a log drain request body into individual RFC 5424 records

use std::borrow::Cow;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Upper bound for a single framed message.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Number of header fields preceding the message body.
const HEADER_FIELDS: usize = 6;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid frame length prefix: {0}")]
    InvalidLength(String),

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    TooLong(usize),

    #[error("truncated frame: expected {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },

    #[error("malformed syslog header: expected {HEADER_FIELDS} fields, found {0}")]
    MalformedHeader(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Syslog header of one frame. Fields borrow from the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub prival_version: Bytes,
    pub timestamp: Bytes,
    pub hostname: Bytes,
    pub app_name: Bytes,
    pub proc_id: Bytes,
    pub msg_id: Bytes,
}

impl FrameHeader {
    pub fn prival_version_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.prival_version)
    }

    pub fn timestamp_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.timestamp)
    }

    pub fn hostname_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.hostname)
    }

    pub fn app_name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.app_name)
    }

    pub fn proc_id_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.proc_id)
    }

    pub fn msg_id_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.msg_id)
    }
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl LogFrame {
    /// Parse a complete syslog message (without its length prefix).
    pub fn parse(message: Bytes) -> Result<Self, FrameError> {
        let mut fields: Vec<Bytes> = Vec::with_capacity(HEADER_FIELDS);
        let mut rest = message;

        while fields.len() < HEADER_FIELDS {
            match rest.iter().position(|&b| b == b' ') {
                Some(idx) => {
                    let field = rest.split_to(idx);
                    rest.advance(1);
                    fields.push(field);
                }
                None if !rest.is_empty() => {
                    fields.push(std::mem::take(&mut rest));
                }
                None => break,
            }
        }

        if fields.len() < HEADER_FIELDS {
            return Err(FrameError::MalformedHeader(fields.len()));
        }

        let mut it = fields.into_iter();
        let mut next = || it.next().unwrap_or_default();
        let header = FrameHeader {
            prival_version: next(),
            timestamp: next(),
            hostname: next(),
            app_name: next(),
            proc_id: next(),
            msg_id: next(),
        };

        Ok(LogFrame { header, body: rest })
    }

}

/// Decoder for `<length> <syslog message>` framing (RFC 6587 octet counting).
#[derive(Debug, Clone)]
pub struct SyslogFrameCodec {
    max_length: usize,
}

impl SyslogFrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    fn max_prefix_digits(&self) -> usize {
        self.max_length.to_string().len()
    }
}

impl Default for SyslogFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SyslogFrameCodec {
    type Item = LogFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogFrame>, FrameError> {
        // Separators between frames (drains often append a newline).
        let skip = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(skip);
        if src.is_empty() {
            return Ok(None);
        }

        let space = match src.iter().position(|&b| b == b' ') {
            Some(idx) => idx,
            None if src.len() > self.max_prefix_digits() => {
                return Err(FrameError::InvalidLength(
                    String::from_utf8_lossy(&src[..self.max_prefix_digits()]).into_owned(),
                ));
            }
            None => return Ok(None),
        };

        let prefix = &src[..space];
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return Err(FrameError::InvalidLength(String::from_utf8_lossy(prefix).into_owned()));
        }

        let len: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FrameError::InvalidLength(String::from_utf8_lossy(prefix).into_owned()))?;
        if len > self.max_length {
            return Err(FrameError::TooLong(len));
        }

        let needed = space + 1 + len;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(space + 1);
        let message = src.split_to(len).freeze();
        LogFrame::parse(message).map(Some)
    }
}

/// Lazy iterator over the frames of one request body.
///
/// Stops at the first malformed or truncated frame; frames yielded before
/// that point stay valid. [`FrameReader::into_error`] tells why iteration ended early.
pub struct FrameReader {
    buf: BytesMut,
    codec: SyslogFrameCodec,
    error: Option<FrameError>,
    finished: bool,
}

impl FrameReader {
    pub fn new(body: Bytes) -> Self {
        Self::with_codec(body, SyslogFrameCodec::new())
    }

    /// Takes the body without copying when this is its only handle.
    pub fn with_codec(body: Bytes, codec: SyslogFrameCodec) -> Self {
        let buf = body
            .try_into_mut()
            .unwrap_or_else(|shared| BytesMut::from(&shared[..]));
        Self {
            buf,
            codec,
            error: None,
            finished: false,
        }
    }

    pub fn into_error(self) -> Option<FrameError> {
        self.error
    }

    fn stop(&mut self, err: FrameError) {
        warn!(error = %err, "stopping frame decoding for this batch");
        self.error = Some(err);
        self.finished = true;
    }
}

impl Iterator for FrameReader {
    type Item = LogFrame;

    fn next(&mut self) -> Option<LogFrame> {
        if self.finished {
            return None;
        }

        match self.codec.decode(&mut self.buf) {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                if !self.buf.is_empty() {
                    // Data left that the codec cannot complete: the body ended mid-frame.
                    let available = self.buf.len();
                    let expected = self
                        .buf
                        .iter()
                        .position(|&b| b == b' ')
                        .and_then(|idx| std::str::from_utf8(&self.buf[..idx]).ok())
                        .and_then(|s| s.parse::<usize>().ok())
                        .unwrap_or(available);
                    self.stop(FrameError::Truncated { expected, available });
                } else {
                    debug!("frame decoding reached end of batch");
                    self.finished = true;
                }
                None
            }
            Err(err) => {
                self.stop(err);
                None
            }
        }
    }
}
