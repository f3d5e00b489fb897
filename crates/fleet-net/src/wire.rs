//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Wire envelopes and the per-connection outbound queue handle."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use fleet_msg::{Message, MessagingError};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};

/// Payload kind of a [`WsMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Text,
    Binary,
}

/// A data frame handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 frame; the dispatch layer always uses this for JSON messages.
    Text(String),
    /// Opaque binary frame.
    Binary(Vec<u8>),
}

impl WsMessage {
    /// JSON-encode `msg` into a text frame.
    pub fn from_message(msg: &Message) -> Result<Self> {
        let json = serde_json::to_string(msg).map_err(MessagingError::from)?;
        Ok(WsMessage::Text(json))
    }

    pub fn msg_type(&self) -> MsgType {
        match self {
            WsMessage::Text(_) => MsgType::Text,
            WsMessage::Binary(_) => MsgType::Binary,
        }
    }

    /// Raw frame bytes.
    pub fn value(&self) -> &[u8] {
        match self {
            WsMessage::Text(text) => text.as_bytes(),
            WsMessage::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.value().len()
    }

    pub fn is_empty(&self) -> bool {
        self.value().is_empty()
    }

    pub(crate) fn into_frame(self) -> tungstenite::Message {
        match self {
            WsMessage::Text(text) => tungstenite::Message::Text(text.into()),
            WsMessage::Binary(data) => tungstenite::Message::Binary(data.into()),
        }
    }
}

/// A frame addressed to one connected client of the server proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsSvrMessage {
    pub ws_message: WsMessage,
    pub client_name: String,
}

/// Items drained by a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(WsMessage),
    Ping,
}

impl Outbound {
    pub(crate) fn into_frame(self) -> tungstenite::Message {
        match self {
            Outbound::Frame(frame) => frame.into_frame(),
            Outbound::Ping => tungstenite::Message::Ping(Vec::<u8>::new().into()),
        }
    }
}

/// Producer side of one connection's outbound queue.
///
/// Cheap to clone; every clone feeds the same single writer.
#[derive(Debug, Clone)]
pub struct FrameSender {
    peer: String,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl FrameSender {
    pub(crate) fn new(
        peer: impl Into<String>,
        tx: mpsc::UnboundedSender<Outbound>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            peer: peer.into(),
            tx,
            closed,
        }
    }

    /// Queue a data frame for the writer.
    pub fn send(&self, frame: WsMessage) -> Result<()> {
        self.push(Outbound::Frame(frame))
    }

    pub(crate) fn ping(&self) -> Result<()> {
        self.push(Outbound::Ping)
    }

    /// Whether the connection behind this sender is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    fn push(&self, item: Outbound) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::NotConnected(self.peer.clone()));
        }
        self.tx
            .send(item)
            .map_err(|_| TransportError::NotConnected(self.peer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_frames_are_json_text() {
        let msg = Message::request("edgehub", "cloudhub", "GET", "/version")
            .expect("message")
            .with_content(json!({"v": 1}));
        let frame = WsMessage::from_message(&msg).expect("frame");
        assert_eq!(frame.msg_type(), MsgType::Text);
        assert_eq!(Message::decode(frame.value()).expect("decode"), msg);
    }

    #[test]
    fn sender_reports_not_connected_once_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let sender = FrameSender::new("edge-01", tx, closed.clone());

        sender
            .send(WsMessage::Binary(vec![1, 2, 3]))
            .expect("queued");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(WsMessage::Binary(data))) if data == vec![1, 2, 3]));

        closed.cancel();
        assert!(sender.is_closed());
        assert!(matches!(
            sender.send(WsMessage::Text("late".into())),
            Err(TransportError::NotConnected(peer)) if peer == "edge-01"
        ));
    }
}
