//! Packing and unpacking application values into Redis byte strings.
//!
//! A [`Codec`] is parameterised by a declared [`ContentKind`]. `pack`
//! and `unpack` are total and inverse on every value of that kind:
//! `unpack(pack(v)) == v`.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while packing or unpacking a [`Value`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value's runtime variant didn't match the codec's declared
    /// [`ContentKind`] (e.g. a [`Value::Real`] handed to a codec
    /// configured for [`ContentKind::Integer`]).
    #[error("value does not match declared content kind {kind:?}")]
    KindMismatch {
        /// The kind the codec was configured with.
        kind: ContentKind,
    },

    /// An integer packed value couldn't be parsed back.
    #[error("invalid integer encoding: {0}")]
    InvalidInteger(#[from] std::num::ParseIntError),

    /// A real (floating point) packed value couldn't be parsed back.
    #[error("invalid real encoding: {0}")]
    InvalidReal(#[from] std::num::ParseFloatError),

    /// A structured (JSON, by default) value failed to encode or
    /// decode.
    #[error("structured encoding failed: {0}")]
    Structured(#[from] serde_json::Error),

    /// A packed byte string wasn't valid UTF-8, which every built-in
    /// kind except [`ContentKind::Structured`]'s raw passthrough
    /// requires.
    #[error("packed value is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// The declared shape of values a [`Codec`] packs and unpacks.
///
/// `Real` and `Structured` name the value's *kind* rather than its
/// default *encoding*, so a kind never implies one particular wire
/// format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ContentKind {
    /// Values are passed through as UTF-8 strings unchanged.
    String,
    /// Values are rendered via `to_string` / parsed via `FromStr`.
    Integer,
    /// Values are rendered via `to_string` / parsed via `FromStr`.
    Real,
    /// Values are serialized through a [`StructuredHook`] (JSON by
    /// default).
    Structured,
}

/// A dynamically-typed application value.
///
/// Queues and schedulers operate on values whose shape is chosen at
/// configuration time (see [`ContentKind`]), not at compile time, so
/// the wire-level API is expressed over this small enum rather than a
/// generic type parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The absence of a value. Packs to `None`.
    Null,
    /// A UTF-8 string.
    Str(String),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Real(f64),
    /// A structured (JSON by default) document.
    Structured(serde_json::Value),
    /// Bytes already in packed form; passed through unchanged by every
    /// codec regardless of declared kind.
    Raw(Vec<u8>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Structured(value)
    }
}

/// Hook for encoding/decoding [`ContentKind::Structured`] values in a
/// domain-specific format, in place of the default `serde_json`
/// rendering.
pub trait StructuredHook: fmt::Debug + Send + Sync {
    /// Encodes a structured value to bytes.
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError>;
    /// Decodes bytes back into a structured value.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;
}

#[derive(Debug)]
struct JsonHook;

impl StructuredHook for JsonHook {
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bidirectional map between [`Value`]s of a declared [`ContentKind`]
/// and the byte strings Redis stores.
#[derive(Clone, Debug)]
pub struct Codec {
    kind: ContentKind,
    structured_hook: Arc<dyn StructuredHook>,
}

impl Codec {
    /// Builds a codec for `kind` using the default encoding for that
    /// kind (`serde_json` for [`ContentKind::Structured`]).
    pub fn new(kind: ContentKind) -> Self {
        Self {
            kind,
            structured_hook: Arc::new(JsonHook),
        }
    }

    /// Builds a [`ContentKind::Structured`] codec with a custom
    /// encode/decode hook.
    pub fn structured_with_hook(hook: Arc<dyn StructuredHook>) -> Self {
        Self {
            kind: ContentKind::Structured,
            structured_hook: hook,
        }
    }

    /// The content kind this codec was configured for.
    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Packs an application value into its byte-string form.
    ///
    /// `pack(Value::Null)` is always `Ok(None)`. A [`Value::Raw`]
    /// passes through unchanged regardless of declared kind.
    pub fn pack(&self, value: &Value) -> Result<Option<Vec<u8>>, CodecError> {
        match value {
            Value::Null => Ok(None),
            Value::Raw(bytes) => Ok(Some(bytes.clone())),
            Value::Str(s) => match self.kind {
                ContentKind::String => Ok(Some(s.as_bytes().to_vec())),
                _ => Err(CodecError::KindMismatch { kind: self.kind }),
            },
            Value::Int(i) => match self.kind {
                ContentKind::Integer => Ok(Some(i.to_string().into_bytes())),
                _ => Err(CodecError::KindMismatch { kind: self.kind }),
            },
            Value::Real(r) => match self.kind {
                ContentKind::Real => Ok(Some(r.to_string().into_bytes())),
                _ => Err(CodecError::KindMismatch { kind: self.kind }),
            },
            Value::Structured(json) => match self.kind {
                ContentKind::Structured => Ok(Some(self.structured_hook.encode(json)?)),
                _ => Err(CodecError::KindMismatch { kind: self.kind }),
            },
        }
    }

    /// Unpacks a byte string back into an application value.
    ///
    /// `unpack(None)` is always `Ok(Value::Null)`.
    pub fn unpack(&self, raw: Option<&[u8]>) -> Result<Value, CodecError> {
        let Some(bytes) = raw else {
            return Ok(Value::Null);
        };
        match self.kind {
            ContentKind::String => Ok(Value::Str(String::from_utf8(bytes.to_vec())?)),
            ContentKind::Integer => {
                let s = String::from_utf8(bytes.to_vec())?;
                Ok(Value::Int(s.parse()?))
            }
            ContentKind::Real => {
                let s = String::from_utf8(bytes.to_vec())?;
                Ok(Value::Real(s.parse()?))
            }
            ContentKind::Structured => {
                Ok(Value::Structured(self.structured_hook.decode(bytes)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips() {
        let codec = Codec::new(ContentKind::String);
        let packed = codec.pack(&Value::from("hello")).unwrap();
        assert_eq!(codec.unpack(packed.as_deref()).unwrap(), Value::from("hello"));
    }

    #[test]
    fn integer_round_trips() {
        let codec = Codec::new(ContentKind::Integer);
        let packed = codec.pack(&Value::from(42i64)).unwrap();
        assert_eq!(packed.as_deref(), Some(b"42".as_slice()));
        assert_eq!(codec.unpack(packed.as_deref()).unwrap(), Value::from(42i64));
    }

    #[test]
    fn real_round_trips() {
        let codec = Codec::new(ContentKind::Real);
        let packed = codec.pack(&Value::from(1.5f64)).unwrap();
        assert_eq!(codec.unpack(packed.as_deref()).unwrap(), Value::from(1.5f64));
    }

    #[test]
    fn structured_round_trips() {
        let codec = Codec::new(ContentKind::Structured);
        let value = Value::Structured(serde_json::json!({"hello": "world"}));
        let packed = codec.pack(&value).unwrap();
        assert_eq!(codec.unpack(packed.as_deref()).unwrap(), value);
    }

    #[test]
    fn null_packs_to_none_and_back() {
        let codec = Codec::new(ContentKind::String);
        assert_eq!(codec.pack(&Value::Null).unwrap(), None);
        assert_eq!(codec.unpack(None).unwrap(), Value::Null);
    }

    #[test]
    fn raw_passes_through_regardless_of_kind() {
        let codec = Codec::new(ContentKind::Integer);
        let raw = Value::Raw(vec![1, 2, 3]);
        assert_eq!(codec.pack(&raw).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let codec = Codec::new(ContentKind::Integer);
        assert!(matches!(
            codec.pack(&Value::from("not an int")),
            Err(CodecError::KindMismatch { .. })
        ));
    }
}
