// Message model and the body frame codec. The frame is one kind byte
// followed by the payload; properties travel next to the body, assigned by
// the publisher and passed through by the broker.
use bytes::{BufMut, Bytes, BytesMut};
use corvus_broker::{GetResponse, Properties};
use std::sync::Weak;

use crate::destination::Destination;
use crate::session::Session;

const KIND_BYTES: u8 = 0;
const KIND_TEXT: u8 = 1;

pub type FrameResult<T> = std::result::Result<T, FrameError>;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("empty message frame")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("text body is not valid utf-8")]
    InvalidText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Bytes(Bytes),
    Text(String),
}

/// A message, either outbound (built by the application) or received (when
/// it also carries the broker's delivery metadata).
#[derive(Debug, Clone)]
pub struct Message {
    body: MessageBody,
    properties: Properties,
    redelivered: bool,
    delivery_tag: u64,
    destination: Option<Destination>,
    session: Weak<Session>,
}

impl Message {
    pub fn bytes(payload: impl Into<Bytes>) -> Self {
        Self::outbound(MessageBody::Bytes(payload.into()))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::outbound(MessageBody::Text(text.into()))
    }

    fn outbound(body: MessageBody) -> Self {
        Self {
            body,
            properties: Properties::default(),
            redelivered: false,
            delivery_tag: 0,
            destination: None,
            session: Weak::new(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            MessageBody::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            MessageBody::Bytes(payload) => Some(payload),
            MessageBody::Text(_) => None,
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// True when the broker delivered this message before, to this consumer
    /// or another one.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// The destination a received message came from; `None` for outbound
    /// messages.
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Client-ack mode: acknowledge this message and every other unacked
    /// message delivered on the same session.
    pub async fn acknowledge(&self) -> crate::Result<()> {
        match self.session.upgrade() {
            Some(session) => session.acknowledge().await,
            None => Ok(()),
        }
    }

    pub fn encode(&self) -> Bytes {
        match &self.body {
            MessageBody::Bytes(payload) => {
                let mut buf = BytesMut::with_capacity(1 + payload.len());
                buf.put_u8(KIND_BYTES);
                buf.extend_from_slice(payload);
                buf.freeze()
            }
            MessageBody::Text(text) => {
                let mut buf = BytesMut::with_capacity(1 + text.len());
                buf.put_u8(KIND_TEXT);
                buf.extend_from_slice(text.as_bytes());
                buf.freeze()
            }
        }
    }

    pub(crate) fn decode_body(frame: &Bytes) -> FrameResult<MessageBody> {
        if frame.is_empty() {
            return Err(FrameError::Empty);
        }
        let payload = frame.slice(1..);
        match frame[0] {
            KIND_BYTES => Ok(MessageBody::Bytes(payload)),
            KIND_TEXT => {
                let text =
                    String::from_utf8(payload.to_vec()).map_err(|_| FrameError::InvalidText)?;
                Ok(MessageBody::Text(text))
            }
            other => Err(FrameError::UnknownKind(other)),
        }
    }

    pub(crate) fn from_delivery(
        response: GetResponse,
        destination: Destination,
        session: Weak<Session>,
    ) -> FrameResult<Self> {
        let body = Self::decode_body(&response.body)?;
        Ok(Self {
            body,
            properties: response.properties,
            redelivered: response.envelope.redelivered,
            delivery_tag: response.envelope.delivery_tag,
            destination: Some(destination),
            session,
        })
    }
}
