//! Heartbeat wire format between a worker and its supervisor.
//!
//! A worker writes one JSON object per line on its stdout:
//!
//! | Line                                     | Meaning                        |
//! |------------------------------------------|--------------------------------|
//! | `{"event":"ready","port":P,"pid":N}`     | listening on `127.0.0.1:P`     |
//! | `{"event":"busy"}`                       | a request started              |
//! | `{"event":"idle"}`                       | the request finished           |
//!
//! Lines are framed by [`HeartbeatCodec`]. The line cap keeps a handler that
//! prints to stdout from making the supervisor buffer without bound.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum heartbeat line length: 64 KiB.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// One heartbeat emitted by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Heartbeat {
    /// The worker is accepting on its loopback port.
    Ready {
        /// Loopback port the worker listens on.
        port: u16,
        /// Worker process id.
        pid: u32,
    },
    /// A request started.
    Busy,
    /// The in-flight request completed.
    Idle,
}

/// Parse one heartbeat line.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the line is not a known heartbeat.
pub fn parse_line(line: &str) -> Result<Option<Heartbeat>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|err| AppError::Protocol(format!("malformed heartbeat {trimmed:?}: {err}")))
}

/// One non-blank line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed heartbeat.
    Beat(Heartbeat),
    /// Anything else the worker printed.
    Stray(String),
}

impl Frame {
    fn from_line(line: String) -> Option<Self> {
        match parse_line(&line) {
            Ok(Some(beat)) => Some(Self::Beat(beat)),
            Ok(None) => None,
            Err(_) => Some(Self::Stray(line)),
        }
    }
}

/// Newline-delimited heartbeat codec, capped at [`MAX_LINE_BYTES`] per line.
///
/// Blank lines are dropped while decoding. A line over the cap is an error
/// and ends the stream; other undecodable lines come out as
/// [`Frame::Stray`].
#[derive(Debug)]
pub struct HeartbeatCodec {
    lines: LinesCodec,
}

impl HeartbeatCodec {
    /// Codec enforcing [`MAX_LINE_BYTES`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }
}

impl Default for HeartbeatCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HeartbeatCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        while let Some(line) = self.lines.decode(src).map_err(codec_error)? {
            if let Some(frame) = Frame::from_line(line) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        while let Some(line) = self.lines.decode_eof(src).map_err(codec_error)? {
            if let Some(frame) = Frame::from_line(line) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

impl Encoder<Heartbeat> for HeartbeatCodec {
    type Error = AppError;

    fn encode(&mut self, beat: Heartbeat, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&beat)
            .map_err(|err| AppError::Protocol(format!("cannot encode heartbeat: {err}")))?;
        self.lines.encode(line, dst).map_err(codec_error)
    }
}

fn codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
            "heartbeat line longer than {MAX_LINE_BYTES} bytes"
        )),
        LinesCodecError::Io(io_err) => AppError::Io(format!("worker stdout: {io_err}")),
    }
}
