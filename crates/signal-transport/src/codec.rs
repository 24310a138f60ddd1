//! Wire codec for signaling messages.
//!
//! Each logical message is the UTF-8 JSON of a session description
//! (`{"type": "offer"|"answer", "sdp": ...}`) or an ICE candidate
//! (`{"candidate": ..., "sdpMid": ..., "sdpMLineIndex": ...}`), optionally
//! deflate+base64 compressed, and — on stream sockets — terminated by a
//! caller-supplied delimiter. The [`Decoder`] owns the per-connection
//! partial buffer: a transport delivery may carry zero, one, or several
//! messages, or a truncated tail, and message boundaries must still be
//! recoverable.

use std::io::Write;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::FrameConfig;

/// A partial that grows past this without parsing is not a split message,
/// it is garbage; drop it so one corrupt peer cannot wedge the pipeline.
pub const MAX_PARTIAL_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// A session description proposed or accepted by one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl Description {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network path proposal for the direct media link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Everything that travels over the signaling channel, dispatched by kind
/// once decoded (never by ad hoc field probing downstream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalMessage {
    Description(Description),
    Candidate(Candidate),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message: {reason}")]
    Malformed { reason: String },
}

impl CodecError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// One decode pass: the complete messages recovered, in order, plus any
/// chunks that had to be dropped as malformed. Malformed chunks never stop
/// later messages from decoding.
#[derive(Debug, Default)]
pub struct DecodeOutput {
    pub messages: Vec<SignalMessage>,
    pub errors: Vec<CodecError>,
}

enum SegmentError {
    /// Plausibly a message split across deliveries; keep the bytes.
    Incomplete,
    /// Structurally invalid; dropping it is the only safe recovery.
    Malformed(String),
}

/// Per-connection decoder. Owns the partial buffer exclusively; never share
/// one decoder across connections.
#[derive(Debug)]
pub struct Decoder {
    config: FrameConfig,
    partial: Vec<u8>,
}

impl Decoder {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            partial: Vec::new(),
        }
    }

    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    pub fn reset(&mut self) {
        self.partial.clear();
    }

    /// Fold a raw transport delivery into the buffer and pull out every
    /// complete message.
    pub fn decode(&mut self, raw: &[u8]) -> DecodeOutput {
        let mut data = std::mem::take(&mut self.partial);
        data.extend_from_slice(raw);

        let mut out = DecodeOutput::default();
        match self.config.delimiter.clone() {
            Some(delimiter) if !delimiter.is_empty() => {
                self.decode_delimited(data, delimiter.as_bytes(), &mut out)
            }
            _ => self.decode_single(data, &mut out),
        }
        out
    }

    /// Stream mode: every delimiter-terminated segment is complete by
    /// construction, so a segment that fails to parse is malformed, not
    /// partial. The unterminated tail becomes the new partial.
    fn decode_delimited(&mut self, data: Vec<u8>, delimiter: &[u8], out: &mut DecodeOutput) {
        let mut start = 0;
        while let Some(pos) = find(&data[start..], delimiter) {
            let segment = &data[start..start + pos];
            start += pos + delimiter.len();
            if segment.is_empty() {
                continue;
            }
            match parse_segment(segment, self.config.compression) {
                Ok(message) => out.messages.push(message),
                Err(SegmentError::Incomplete) => out
                    .errors
                    .push(CodecError::malformed("truncated segment inside frame")),
                Err(SegmentError::Malformed(reason)) => {
                    out.errors.push(CodecError::malformed(reason))
                }
            }
        }
        self.partial = data[start..].to_vec();
        self.enforce_partial_cap(out);
    }

    /// Datagram mode (or stream without a delimiter): the accumulated bytes
    /// are one candidate message. An incomplete parse keeps the bytes for
    /// the next delivery; a malformed one resets the buffer.
    fn decode_single(&mut self, data: Vec<u8>, out: &mut DecodeOutput) {
        match parse_segment(&data, self.config.compression) {
            Ok(message) => out.messages.push(message),
            Err(SegmentError::Incomplete) => {
                trace!(
                    target: "signal_transport::codec",
                    buffered = data.len(),
                    "incomplete message retained"
                );
                self.partial = data;
                self.enforce_partial_cap(out);
            }
            Err(SegmentError::Malformed(reason)) => out.errors.push(CodecError::malformed(reason)),
        }
    }

    fn enforce_partial_cap(&mut self, out: &mut DecodeOutput) {
        if self.partial.len() > MAX_PARTIAL_BYTES {
            out.errors.push(CodecError::malformed(format!(
                "partial buffer overflowed at {} bytes",
                self.partial.len()
            )));
            self.partial.clear();
        }
    }
}

fn parse_segment(segment: &[u8], compression: bool) -> Result<SignalMessage, SegmentError> {
    let plain;
    let bytes: &[u8] = if compression {
        // A truncated compressed chunk fails either the base64 or the
        // inflate stage; both are classified as incomplete and resolved by
        // the partial cap if they never complete.
        let packed = BASE64
            .decode(segment)
            .map_err(|_| SegmentError::Incomplete)?;
        plain = decompress(&packed).map_err(|_| SegmentError::Incomplete)?;
        &plain
    } else {
        segment
    };

    serde_json::from_slice::<SignalMessage>(bytes).map_err(|err| {
        if err.is_eof() {
            SegmentError::Incomplete
        } else {
            SegmentError::Malformed(err.to_string())
        }
    })
}

/// Encode one message: JSON, then the same shaping [`frame_payload`]
/// applies. Inverse of one [`Decoder::decode`] chunk.
pub fn encode(message: &SignalMessage, config: &FrameConfig) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(message)
        .map_err(|err| CodecError::malformed(format!("serialize: {err}")))?;
    frame_payload(&json, config)
}

/// Shape an already-serialized payload for the wire: compress when
/// configured, then append the delimiter.
pub fn frame_payload(payload: &[u8], config: &FrameConfig) -> Result<Bytes, CodecError> {
    let mut body = if config.compression {
        BASE64.encode(compress(payload)?).into_bytes()
    } else {
        payload.to_vec()
    };
    if let Some(delimiter) = &config.delimiter {
        body.extend_from_slice(delimiter.as_bytes());
    }
    Ok(Bytes::from(body))
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|err| CodecError::malformed(format!("compress: {err}")))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder
        .write_all(data)
        .and_then(|_| decoder.finish())
        .map_err(|err| CodecError::malformed(format!("decompress: {err}")))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
