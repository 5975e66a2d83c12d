//! Pluggable payload serialization.
//!
//! The [`MessageCodec`] trait is implemented by [`JsonCodec`] (readable,
//! handy while debugging) and [`MessagePackCodec`] (compact, used for the
//! internal addressable protocol). Each opcode names its codec through a
//! [`SerializerTag`], so the dispatcher picks the codec with a match on the
//! tag rather than by payload type.
//!
//! ```rust
//! use scenenet::messaging::{JsonCodec, MessageCodec};
//!
//! let bytes = JsonCodec.encode(&vec![1u8, 2, 3]).unwrap();
//! assert_eq!(&bytes, b"[1,2,3]");
//! let decoded: Vec<u8> = JsonCodec.decode(&bytes).unwrap();
//! assert_eq!(decoded, vec![1, 2, 3]);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Pluggable message serialization format.
///
/// `Clone + 'static` so codec instances can be stored in handler tables.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// MessagePack codec using rmp-serde, with named struct fields.
#[derive(Clone, Default, Debug, Copy)]
pub struct MessagePackCodec;

impl MessageCodec for MessagePackCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        rmp_serde::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// Codec selector carried in an opcode's serializer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializerTag {
    Json = 0,
    MessagePack = 1,
}

impl SerializerTag {
    pub fn encode<T: Serialize>(self, msg: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            SerializerTag::Json => JsonCodec.encode(msg),
            SerializerTag::MessagePack => MessagePackCodec.encode(msg),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, buf: &[u8]) -> Result<T, CodecError> {
        match self {
            SerializerTag::Json => JsonCodec.decode(buf),
            SerializerTag::MessagePack => MessagePackCodec.decode(buf),
        }
    }
}

impl TryFrom<u8> for SerializerTag {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(SerializerTag::Json),
            1 => Ok(SerializerTag::MessagePack),
            other => Err(CodecError::UnknownSerializer(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
    struct Move {
        entity: u64,
        x: f32,
        y: f32,
        label: Option<String>,
    }

    #[test]
    fn test_both_tags_decode_what_they_encode() {
        let value = Move {
            entity: 9,
            x: 1.5,
            y: -2.0,
            label: Some("north".into()),
        };
        for tag in [SerializerTag::Json, SerializerTag::MessagePack] {
            let bytes = tag.encode(&value).unwrap();
            let decoded: Move = tag.decode(&bytes).unwrap();
            assert_eq!(decoded, value, "{tag:?}");
        }
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = SerializerTag::MessagePack
            .decode::<Move>(&[0xc1, 0x00])
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(matches!(
            JsonCodec.decode::<Move>(b"{"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_tags_are_rejected() {
        assert_eq!(SerializerTag::try_from(1).unwrap(), SerializerTag::MessagePack);
        assert!(matches!(
            SerializerTag::try_from(7),
            Err(CodecError::UnknownSerializer(7))
        ));
    }
}
