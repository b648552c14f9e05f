//! Value serialization and sanitizing.
//!
//! Rows store objects and metadata as bytes. The database converts between
//! those bytes and [`Value`]s with a configurable [`Serialization`] bundle.
//! The defaults encode CBOR with `ciborium` and leave values untouched.

use crate::error::{CoreError, CoreResult};
use ciborium::value::Value;
use std::fmt;
use std::sync::Arc;

/// Converts a value into stored bytes. Receives `(collection, key, value)`.
pub type Serializer = Arc<dyn Fn(&str, &str, &Value) -> CoreResult<Vec<u8>> + Send + Sync>;

/// Converts stored bytes into a value. Receives `(collection, key, bytes)`.
pub type Deserializer = Arc<dyn Fn(&str, &str, &[u8]) -> CoreResult<Value> + Send + Sync>;

/// Runs before a value is serialized and may replace or reject it.
pub type PreSanitizer = Arc<dyn Fn(&str, &str, Value) -> CoreResult<Value> + Send + Sync>;

/// Runs after a value has been written.
pub type PostSanitizer = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// The serializer, deserializer and sanitizers for one kind of value.
#[derive(Clone)]
pub struct ValueCodec {
    /// Encoder.
    pub serializer: Serializer,
    /// Decoder.
    pub deserializer: Deserializer,
    /// Optional pre-sanitizer.
    pub pre_sanitizer: Option<PreSanitizer>,
    /// Optional post-sanitizer.
    pub post_sanitizer: Option<PostSanitizer>,
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self {
            serializer: Arc::new(cbor_serialize),
            deserializer: Arc::new(cbor_deserialize),
            pre_sanitizer: None,
            post_sanitizer: None,
        }
    }
}

impl fmt::Debug for ValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCodec")
            .field("pre_sanitizer", &self.pre_sanitizer.is_some())
            .field("post_sanitizer", &self.post_sanitizer.is_some())
            .finish_non_exhaustive()
    }
}

impl ValueCodec {
    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Replaces the deserializer.
    #[must_use]
    pub fn with_deserializer(mut self, deserializer: Deserializer) -> Self {
        self.deserializer = deserializer;
        self
    }

    /// Installs a pre-sanitizer.
    #[must_use]
    pub fn with_pre_sanitizer(mut self, sanitizer: PreSanitizer) -> Self {
        self.pre_sanitizer = Some(sanitizer);
        self
    }

    /// Installs a post-sanitizer.
    #[must_use]
    pub fn with_post_sanitizer(mut self, sanitizer: PostSanitizer) -> Self {
        self.post_sanitizer = Some(sanitizer);
        self
    }

    pub(crate) fn sanitize(&self, collection: &str, key: &str, value: Value) -> CoreResult<Value> {
        match &self.pre_sanitizer {
            Some(sanitizer) => sanitizer(collection, key, value),
            None => Ok(value),
        }
    }

    pub(crate) fn encode(&self, collection: &str, key: &str, value: &Value) -> CoreResult<Vec<u8>> {
        (self.serializer)(collection, key, value)
    }

    pub(crate) fn decode(&self, collection: &str, key: &str, bytes: &[u8]) -> CoreResult<Value> {
        (self.deserializer)(collection, key, bytes)
    }

    pub(crate) fn after_write(&self, collection: &str, key: &str, value: &Value) {
        if let Some(sanitizer) = &self.post_sanitizer {
            sanitizer(collection, key, value);
        }
    }
}

/// Codecs for objects and metadata.
#[derive(Debug, Clone, Default)]
pub struct Serialization {
    /// Codec for objects.
    pub object: ValueCodec,
    /// Codec for metadata.
    pub metadata: ValueCodec,
}

impl Serialization {
    /// Creates the default CBOR bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the object codec.
    #[must_use]
    pub fn object(mut self, codec: ValueCodec) -> Self {
        self.object = codec;
        self
    }

    /// Replaces the metadata codec.
    #[must_use]
    pub fn metadata(mut self, codec: ValueCodec) -> Self {
        self.metadata = codec;
        self
    }
}

/// Default object serializer: CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Serialization`] if encoding fails.
pub fn cbor_serialize(collection: &str, key: &str, value: &Value) -> CoreResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| CoreError::serialization(collection, key, e))?;
    Ok(bytes)
}

/// Default object deserializer: CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Deserialization`] if the bytes are not valid CBOR.
pub fn cbor_deserialize(collection: &str, key: &str, bytes: &[u8]) -> CoreResult<Value> {
    ciborium::de::from_reader(bytes).map_err(|e| CoreError::deserialization(collection, key, e))
}

/// Converts a serde value into a dynamic [`Value`].
///
/// # Errors
///
/// Returns [`CoreError::Serialization`] if the type cannot be represented.
pub fn to_value<T: serde::Serialize>(collection: &str, key: &str, value: &T) -> CoreResult<Value> {
    Value::serialized(value).map_err(|e| CoreError::serialization(collection, key, e))
}

/// Converts a dynamic [`Value`] into a serde type.
///
/// # Errors
///
/// Returns [`CoreError::Deserialization`] if the value has the wrong shape.
pub fn from_value<T: serde::de::DeserializeOwned>(
    collection: &str,
    key: &str,
    value: &Value,
) -> CoreResult<T> {
    value
        .deserialized()
        .map_err(|e| CoreError::deserialization(collection, key, e))
}
