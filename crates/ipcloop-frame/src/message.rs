use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FrameError, Result};

/// Maximum length of a message type name in bytes.
pub const MAX_TYPE_NAME_LEN: usize = u16::MAX as usize;

/// A value that can travel over a channel as a typed message.
///
/// `TYPE_NAME` is written into every frame so the receiver can discover the
/// runtime type before decoding the body. It must be identical on both ends.
///
/// ```
/// use ipcloop_frame::{Message, MessageType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Ping {
///     seq: u32,
/// }
///
/// impl MessageType for Ping {
///     const TYPE_NAME: &'static str = "example.ping";
/// }
///
/// let msg = Message::encode(&Ping { seq: 7 }).unwrap();
/// assert!(msg.is::<Ping>());
/// assert_eq!(msg.decode::<Ping>().unwrap(), Ping { seq: 7 });
/// ```
pub trait MessageType: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
}

impl MessageType for String {
    const TYPE_NAME: &'static str = "string";
}

impl MessageType for serde_json::Value {
    const TYPE_NAME: &'static str = "json";
}

/// A type-tagged message payload.
///
/// Payload layout inside a frame:
/// ```text
/// ┌──────────────┬──────────────────┬───────────────┐
/// │ Name length  │ Type name        │ Body          │
/// │ (2B LE)      │ (UTF-8)          │ (opaque)      │
/// └──────────────┴──────────────────┴───────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    type_name: String,
    body: Bytes,
}

impl Message {
    /// Build a message from a raw type name and body.
    pub fn new(type_name: impl Into<String>, body: impl Into<Bytes>) -> Result<Self> {
        let type_name = type_name.into();
        if type_name.len() > MAX_TYPE_NAME_LEN {
            return Err(FrameError::MalformedPayload("type name longer than 65535 bytes"));
        }
        Ok(Self {
            type_name,
            body: body.into(),
        })
    }

    /// Serialize a typed value into a message.
    pub fn encode<T: MessageType>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Self::new(T::TYPE_NAME, body)
    }

    /// Deserialize the body as `T`, checking the type tag first.
    pub fn decode<T: MessageType>(&self) -> Result<T> {
        if !self.is::<T>() {
            return Err(FrameError::TypeMismatch {
                expected: T::TYPE_NAME,
                found: self.type_name.clone(),
            });
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Whether this message carries a `T`.
    pub fn is<T: MessageType>(&self) -> bool {
        self.type_name == T::TYPE_NAME
    }

    /// The runtime type tag.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The raw body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Size of the encoded payload (without frame header).
    pub fn payload_len(&self) -> usize {
        2 + self.type_name.len() + self.body.len()
    }

    /// Append the payload encoding to `dst`.
    pub fn write_payload(&self, dst: &mut BytesMut) {
        dst.reserve(self.payload_len());
        dst.put_u16_le(self.type_name.len() as u16);
        dst.put_slice(self.type_name.as_bytes());
        dst.put_slice(&self.body);
    }

    /// Parse a payload produced by [`Message::write_payload`].
    pub fn read_payload(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 2 {
            return Err(FrameError::MalformedPayload("missing type name length"));
        }
        let name_len = payload.get_u16_le() as usize;
        if payload.len() < name_len {
            return Err(FrameError::MalformedPayload("truncated type name"));
        }
        let name = payload.split_to(name_len);
        let type_name = std::str::from_utf8(&name)
            .map_err(|_| FrameError::MalformedPayload("type name is not UTF-8"))?
            .to_string();
        Ok(Self {
            type_name,
            body: payload,
        })
    }
}
