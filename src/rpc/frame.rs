//! Transport-neutral WebSocket frames.
//!
//! Downstream frames arrive as axum messages and upstream frames as
//! tungstenite messages. Both are mapped onto [`Frame`] so middleware never
//! depends on either transport.

use axum::body::Bytes;
use axum::extract::ws;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Close code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn into_upstream(self) -> tungstenite::protocol::CloseFrame {
        tungstenite::protocol::CloseFrame {
            code: CloseCode::from(self.code),
            reason: self.reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Close(_) => "close",
        }
    }

    /// Frames that are relayed verbatim instead of being decoded.
    pub fn is_passthrough(&self) -> bool {
        !matches!(self, Frame::Text(_))
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Frame::Close(_))
    }

    /// Map an upstream message. Raw tungstenite frames have no equivalent.
    pub fn from_upstream(msg: tungstenite::Message) -> Option<Self> {
        Some(match msg {
            tungstenite::Message::Text(t) => Frame::Text(t.as_str().to_owned()),
            tungstenite::Message::Binary(b) => Frame::Binary(b),
            tungstenite::Message::Ping(b) => Frame::Ping(b),
            tungstenite::Message::Pong(b) => Frame::Pong(b),
            tungstenite::Message::Close(cf) => Frame::Close(cf.map(|cf| CloseReason {
                code: u16::from(cf.code),
                reason: cf.reason.as_str().to_owned(),
            })),
            tungstenite::Message::Frame(_) => return None,
        })
    }

    pub fn into_upstream(self) -> tungstenite::Message {
        match self {
            Frame::Text(t) => tungstenite::Message::Text(t.into()),
            Frame::Binary(b) => tungstenite::Message::Binary(b),
            Frame::Ping(b) => tungstenite::Message::Ping(b),
            Frame::Pong(b) => tungstenite::Message::Pong(b),
            Frame::Close(reason) => tungstenite::Message::Close(reason.map(CloseReason::into_upstream)),
        }
    }
}

impl From<ws::Message> for Frame {
    fn from(msg: ws::Message) -> Self {
        match msg {
            ws::Message::Text(t) => Frame::Text(t.as_str().to_owned()),
            ws::Message::Binary(b) => Frame::Binary(b),
            ws::Message::Ping(b) => Frame::Ping(b),
            ws::Message::Pong(b) => Frame::Pong(b),
            ws::Message::Close(cf) => Frame::Close(cf.map(|cf| CloseReason {
                code: cf.code,
                reason: cf.reason.as_str().to_owned(),
            })),
        }
    }
}

impl From<Frame> for ws::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => ws::Message::Text(t.into()),
            Frame::Binary(b) => ws::Message::Binary(b),
            Frame::Ping(b) => ws::Message::Ping(b),
            Frame::Pong(b) => ws::Message::Pong(b),
            Frame::Close(reason) => ws::Message::Close(reason.map(|r| ws::CloseFrame {
                code: r.code,
                reason: r.reason.into(),
            })),
        }
    }
}
