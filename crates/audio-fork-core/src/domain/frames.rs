//! Transport-neutral frame types.
//!
//! The bridge never speaks to a socket library directly; transports translate
//! their own message types into these.

/// Payload type of a WebSocket data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// One wire-level piece of an inbound data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFragment {
    /// Kind of the message.  Only meaningful on the first fragment.
    pub kind: PayloadKind,
    pub payload: Vec<u8>,
    pub is_first: bool,
    pub is_final: bool,
    /// Bytes the sender announced are still to come, or 0 when unknown.
    pub remaining: usize,
}

impl InboundFragment {
    /// A message that arrived in a single piece.
    pub fn whole(kind: PayloadKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            is_first: true,
            is_final: true,
            remaining: 0,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::whole(PayloadKind::Text, text.as_bytes().to_vec())
    }

    /// Splits `payload` into `parts` fragments of roughly equal size, with the
    /// `remaining` hint filled in on each.
    pub fn split(kind: PayloadKind, payload: &[u8], parts: usize) -> Vec<Self> {
        let parts = parts.max(1);
        let chunk = ((payload.len() + parts - 1) / parts).max(1);
        let mut out = Vec::with_capacity(parts);
        let mut offset = 0;
        for i in 0..parts {
            let end = if i + 1 == parts {
                payload.len()
            } else {
                (offset + chunk).min(payload.len())
            };
            out.push(Self {
                kind,
                payload: payload[offset..end].to_vec(),
                is_first: i == 0,
                is_final: i + 1 == parts,
                remaining: payload.len() - end,
            });
            offset = end;
        }
        out
    }
}

/// A frame the bridge asks a transport to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    /// Starts the closing handshake.
    Close,
}

impl OutboundFrame {
    /// Payload size in bytes, used to detect short writes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) | Self::Ping(bytes) => bytes.len(),
            Self::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Close => "close",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
