//! WebSocket wire protocol spoken with the browser terminal.
//!
//! Wire format: `[tag: ASCII byte][payload: bytes]`, one message per
//! WebSocket frame.
//!
//! Before the tagged protocol starts, the client sends one JSON handshake
//! document ([`InitMessage`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mux::{Layout, ModeState};

/// WebSocket subprotocol negotiated on upgrade.
pub const SUBPROTOCOL: &str = "webtty";

/// Client → server message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientTag {
    Unknown = b'0',
    Input = b'1',
    Ping = b'2',
    ResizeTerminal = b'3',
    SetEncoding = b'4',

    // Multiplexer control
    SelectPane = b'5',
    SelectWindow = b'6',
    SplitPane = b'7',
    ClosePane = b'8',
    CopyMode = b'9',
    ScrollUp = b'B',
    ScrollDown = b'C',
    NewWindow = b'D',
    SwitchSession = b'E',
}

impl ClientTag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Self::Unknown),
            b'1' => Some(Self::Input),
            b'2' => Some(Self::Ping),
            b'3' => Some(Self::ResizeTerminal),
            b'4' => Some(Self::SetEncoding),
            b'5' => Some(Self::SelectPane),
            b'6' => Some(Self::SelectWindow),
            b'7' => Some(Self::SplitPane),
            b'8' => Some(Self::ClosePane),
            b'9' => Some(Self::CopyMode),
            b'B' => Some(Self::ScrollUp),
            b'C' => Some(Self::ScrollDown),
            b'D' => Some(Self::NewWindow),
            b'E' => Some(Self::SwitchSession),
            _ => None,
        }
    }
}

/// Server → client message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerTag {
    Unknown = b'0',
    Output = b'1',
    Pong = b'2',
    SetWindowTitle = b'3',
    SetPreferences = b'4',
    SetReconnect = b'5',
    SetBufferSize = b'6',
    LayoutUpdate = b'7',
    ModeUpdate = b'9',
    /// Reserved; never emitted.
    SessionInfo = b'A',
}

impl ServerTag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Self::Unknown),
            b'1' => Some(Self::Output),
            b'2' => Some(Self::Pong),
            b'3' => Some(Self::SetWindowTitle),
            b'4' => Some(Self::SetPreferences),
            b'5' => Some(Self::SetReconnect),
            b'6' => Some(Self::SetBufferSize),
            b'7' => Some(Self::LayoutUpdate),
            b'9' => Some(Self::ModeUpdate),
            b'A' => Some(Self::SessionInfo),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type: {0}")]
    UnknownTag(char),

    #[error("invalid resize request: {0}")]
    InvalidResize(#[source] serde_json::Error),

    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),

    #[error("invalid input payload: {0}")]
    InvalidInput(#[from] base64::DecodeError),

    #[error("invalid handshake: {0}")]
    Handshake(#[source] serde_json::Error),

    #[error("payload is not valid UTF-8")]
    NotUtf8,
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub tag: ServerTag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: ServerTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    fn json<T: Serialize>(tag: ServerTag, msg: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(tag, serde_json::to_vec(msg)?))
    }

    /// Terminal output, always base64 on the wire.
    pub fn output(data: &[u8]) -> Self {
        Self::new(ServerTag::Output, BASE64.encode(data))
    }

    pub fn pong() -> Self {
        Self::new(ServerTag::Pong, Bytes::new())
    }

    pub fn window_title(title: &str) -> Self {
        Self::new(ServerTag::SetWindowTitle, title.to_string())
    }

    pub fn preferences<T: Serialize>(prefs: &T) -> Result<Self, serde_json::Error> {
        Self::json(ServerTag::SetPreferences, prefs)
    }

    pub fn reconnect(seconds: u64) -> Self {
        Self::new(ServerTag::SetReconnect, seconds.to_string())
    }

    pub fn buffer_size(bytes: usize) -> Self {
        Self::new(ServerTag::SetBufferSize, bytes.to_string())
    }

    pub fn layout(layout: &Layout) -> Result<Self, serde_json::Error> {
        Self::json(ServerTag::LayoutUpdate, layout)
    }

    pub fn mode(mode: &ModeState) -> Result<Self, serde_json::Error> {
        Self::json(ServerTag::ModeUpdate, mode)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.tag as u8);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Encode as a text frame. Every server payload is ASCII or JSON.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.encode()).into_owned()
    }

    /// Decode a server message (used by clients and tests).
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = data.split_first().ok_or(ProtocolError::Empty)?;
        let tag = ServerTag::from_u8(tag).ok_or(ProtocolError::UnknownTag(tag as char))?;
        Ok(Self::new(tag, Bytes::copy_from_slice(payload)))
    }

    /// Parse the payload as JSON.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// How `Input` payloads are encoded by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// Raw bytes.
    #[default]
    Null,
    Base64,
}

impl Encoding {
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name.trim() {
            "base64" => Ok(Self::Base64),
            "null" | "" => Ok(Self::Null),
            other => Err(ProtocolError::UnknownEncoding(other.to_string())),
        }
    }

    pub fn decode(self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        match self {
            Self::Null => Ok(Bytes::copy_from_slice(payload)),
            Self::Base64 => Ok(Bytes::from(BASE64.decode(payload)?)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub columns: u16,
    pub rows: u16,
}

/// A multiplexer-control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxRequest {
    SelectPane(String),
    SelectWindow(String),
    SplitPane { horizontal: bool },
    ClosePane(String),
    CopyMode { enter: bool },
    ScrollUp(u32),
    ScrollDown(u32),
    NewWindow,
    SwitchSession(String),
}

impl MuxRequest {
    pub fn tag(&self) -> u8 {
        let tag = match self {
            Self::SelectPane(_) => ClientTag::SelectPane,
            Self::SelectWindow(_) => ClientTag::SelectWindow,
            Self::SplitPane { .. } => ClientTag::SplitPane,
            Self::ClosePane(_) => ClientTag::ClosePane,
            Self::CopyMode { .. } => ClientTag::CopyMode,
            Self::ScrollUp(_) => ClientTag::ScrollUp,
            Self::ScrollDown(_) => ClientTag::ScrollDown,
            Self::NewWindow => ClientTag::NewWindow,
            Self::SwitchSession(_) => ClientTag::SwitchSession,
        };
        tag as u8
    }
}

/// A decoded client → server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Still in the negotiated encoding; see [`Encoding::decode`].
    Input(Bytes),
    Ping,
    Resize(ResizeRequest),
    SetEncoding(Encoding),
    Mux(MuxRequest),
}

fn text(payload: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(payload)
        .map(str::to_string)
        .map_err(|_| ProtocolError::NotUtf8)
}

/// Line count for scroll requests; anything missing or non-positive is 1.
fn scroll_lines(payload: &[u8]) -> u32 {
    std::str::from_utf8(payload)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|&n| n > 0)
        .map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

impl ClientMessage {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&byte, payload) = data.split_first().ok_or(ProtocolError::Empty)?;
        let tag = ClientTag::from_u8(byte).ok_or(ProtocolError::UnknownTag(byte as char))?;

        let msg = match tag {
            ClientTag::Unknown => return Err(ProtocolError::UnknownTag(byte as char)),
            ClientTag::Input => Self::Input(Bytes::copy_from_slice(payload)),
            ClientTag::Ping => Self::Ping,
            ClientTag::ResizeTerminal => Self::Resize(
                serde_json::from_slice(payload).map_err(ProtocolError::InvalidResize)?,
            ),
            ClientTag::SetEncoding => Self::SetEncoding(Encoding::parse(&text(payload)?)?),
            ClientTag::SelectPane => Self::Mux(MuxRequest::SelectPane(text(payload)?)),
            ClientTag::SelectWindow => Self::Mux(MuxRequest::SelectWindow(text(payload)?)),
            ClientTag::SplitPane => Self::Mux(MuxRequest::SplitPane {
                horizontal: payload == b"h",
            }),
            ClientTag::ClosePane => Self::Mux(MuxRequest::ClosePane(text(payload)?)),
            ClientTag::CopyMode => Self::Mux(MuxRequest::CopyMode {
                enter: payload == b"1",
            }),
            ClientTag::ScrollUp => Self::Mux(MuxRequest::ScrollUp(scroll_lines(payload))),
            ClientTag::ScrollDown => Self::Mux(MuxRequest::ScrollDown(scroll_lines(payload))),
            ClientTag::NewWindow => Self::Mux(MuxRequest::NewWindow),
            ClientTag::SwitchSession => Self::Mux(MuxRequest::SwitchSession(text(payload)?)),
        };
        Ok(msg)
    }
}

// ── Handshake ──────────────────────────────────────────────────────

/// First payload on a new socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(rename = "AuthToken", default)]
    pub auth_token: String,
    #[serde(rename = "Arguments", default)]
    pub arguments: String,
}

impl InitMessage {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Handshake)
    }

    /// Every `arg=` value from the `Arguments` query string, in order.
    pub fn args(&self) -> Vec<String> {
        query_args(&self.arguments)
    }
}

fn query_args(query: &str) -> Vec<String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "arg")
        .map(|(_, value)| percent_decode(value))
        .collect()
}

fn hex_digit(b: &u8) -> Option<u8> {
    (*b as char).to_digit(16).map(|d| d as u8)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match (
                bytes.get(i + 1).and_then(hex_digit),
                bytes.get(i + 2).and_then(hex_digit),
            ) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ── Clipboard interception ─────────────────────────────────────────

const OSC52_START: &[u8] = b"\x1b]52;";

/// Dangling sequences longer than this are passed through unmodified.
pub const MAX_CLIPBOARD_PENDING: usize = 1024 * 1024;

/// Output after clipboard sequences have been removed.
#[derive(Debug, Default, PartialEq)]
pub struct Intercepted {
    pub output: Bytes,
    /// Decoded clipboard payloads, in stream order.
    pub clipboard: Vec<Bytes>,
}

/// Strips OSC 52 clipboard sequences out of terminal output.
///
/// A sequence split across reads is held back until its terminator
/// (BEL or ST) arrives.
#[derive(Debug, Default)]
pub struct ClipboardInterceptor {
    pending: BytesMut,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position and length of the first BEL or `ESC \`.
fn find_terminator(data: &[u8]) -> Option<(usize, usize)> {
    data.iter().enumerate().find_map(|(i, &b)| match b {
        0x07 => Some((i, 1)),
        0x1b if data.get(i + 1) == Some(&b'\\') => Some((i, 2)),
        _ => None,
    })
}

/// Length of the longest suffix of `data` that could start a sequence.
fn partial_start(data: &[u8]) -> usize {
    (1..OSC52_START.len())
        .rev()
        .find(|&n| data.len() >= n && data.ends_with(&OSC52_START[..n]))
        .unwrap_or(0)
}

impl ClipboardInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Intercepted {
        self.pending.extend_from_slice(chunk);
        let data = self.pending.split().freeze();

        let mut output = BytesMut::with_capacity(data.len());
        let mut clipboard = Vec::new();
        let mut rest = &data[..];

        loop {
            let Some(start) = find(rest, OSC52_START) else {
                let keep = partial_start(rest);
                output.extend_from_slice(&rest[..rest.len() - keep]);
                self.pending.extend_from_slice(&rest[rest.len() - keep..]);
                break;
            };
            output.extend_from_slice(&rest[..start]);
            let body_start = start + OSC52_START.len();

            let Some((end, term_len)) = find_terminator(&rest[body_start..]) else {
                let dangling = &rest[start..];
                if dangling.len() > MAX_CLIPBOARD_PENDING {
                    output.extend_from_slice(dangling);
                } else {
                    self.pending.extend_from_slice(dangling);
                }
                break;
            };

            let body = &rest[body_start..body_start + end];
            let encoded = body
                .iter()
                .position(|&b| b == b';')
                .map_or(body, |i| &body[i + 1..]);
            if encoded != b"?" {
                match BASE64.decode(encoded) {
                    Ok(decoded) => clipboard.push(Bytes::from(decoded)),
                    Err(e) => tracing::debug!(error = %e, "ignoring undecodable clipboard sequence"),
                }
            }
            rest = &rest[body_start + end + term_len..];
        }

        Intercepted {
            output: output.freeze(),
            clipboard,
        }
    }

    /// Release anything still held back, unmodified.
    pub fn flush(&mut self) -> Bytes {
        self.pending.split().freeze()
    }
}
