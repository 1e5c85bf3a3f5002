use bytes::Bytes;
use std::sync::Arc;

pub const FLAG_BYTES: u32 = 0;
pub const FLAG_INTEGER: u32 = 1 << 1;
pub const FLAG_TEXT: u32 = 1 << 4;
pub const FLAG_JSON: u32 = 1 << 5;

/// A value as the application sees it, before encoding for the wire
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Bytes(Bytes),
    Text(String),
    Integer(i64),
    Json(serde_json::Value),
}

impl From<Bytes> for CacheValue {
    fn from(value: Bytes) -> Self {
        CacheValue::Bytes(value)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        CacheValue::Bytes(Bytes::from(value))
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::Text(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Text(value)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Integer(value)
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Json(value)
    }
}

/// Converts application values to the bytes and flags stored in memcached
pub trait Serializer: Send + Sync + std::fmt::Debug {
    fn serialize(&self, value: &CacheValue) -> Result<(Bytes, u32), SerializerError>;

    fn deserialize(&self, data: Bytes, flags: u32) -> Result<CacheValue, SerializerError>;

    /// Serializer name
    fn name(&self) -> &str;
}

/// Serializer factory for creating serializers from configuration
pub fn create_serializer(serializer_type: &str) -> Result<Arc<dyn Serializer>, SerializerError> {
    match serializer_type {
        "identity" => Ok(Arc::new(IdentitySerializer)),
        "json" => Ok(Arc::new(JsonSerializer)),
        _ => Err(SerializerError::UnknownSerializer(
            serializer_type.to_string(),
        )),
    }
}

/// Raw bytes only, flags always 0
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentitySerializer;

impl Serializer for IdentitySerializer {
    fn serialize(&self, value: &CacheValue) -> Result<(Bytes, u32), SerializerError> {
        match value {
            CacheValue::Bytes(data) => Ok((data.clone(), FLAG_BYTES)),
            other => Err(SerializerError::Unsupported(format!(
                "identity serializer only stores bytes, got {}",
                kind_name(other)
            ))),
        }
    }

    fn deserialize(&self, data: Bytes, _flags: u32) -> Result<CacheValue, SerializerError> {
        Ok(CacheValue::Bytes(data))
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Bytes and text pass through, integers are stored as decimal text and
/// anything structured as JSON. The kind is recorded in the item flags.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &CacheValue) -> Result<(Bytes, u32), SerializerError> {
        match value {
            CacheValue::Bytes(data) => Ok((data.clone(), FLAG_BYTES)),
            CacheValue::Text(text) => Ok((Bytes::from(text.clone()), FLAG_TEXT)),
            CacheValue::Integer(n) => Ok((Bytes::from(n.to_string()), FLAG_INTEGER)),
            CacheValue::Json(json) => {
                let encoded = serde_json::to_vec(json)
                    .map_err(|e| SerializerError::Encode(e.to_string()))?;
                Ok((Bytes::from(encoded), FLAG_JSON))
            }
        }
    }

    fn deserialize(&self, data: Bytes, flags: u32) -> Result<CacheValue, SerializerError> {
        match flags {
            FLAG_BYTES => Ok(CacheValue::Bytes(data)),
            FLAG_TEXT => String::from_utf8(data.to_vec())
                .map(CacheValue::Text)
                .map_err(|e| SerializerError::Decode(e.to_string())),
            FLAG_INTEGER => std::str::from_utf8(&data)
                .map_err(|e| SerializerError::Decode(e.to_string()))?
                .trim()
                .parse::<i64>()
                .map(CacheValue::Integer)
                .map_err(|e| SerializerError::Decode(e.to_string())),
            FLAG_JSON => serde_json::from_slice(&data)
                .map(CacheValue::Json)
                .map_err(|e| SerializerError::Decode(e.to_string())),
            other => Err(SerializerError::UnknownFlags(other)),
        }
    }

    fn name(&self) -> &str {
        "json"
    }
}

fn kind_name(value: &CacheValue) -> &'static str {
    match value {
        CacheValue::Bytes(_) => "bytes",
        CacheValue::Text(_) => "text",
        CacheValue::Integer(_) => "integer",
        CacheValue::Json(_) => "json",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializerError {
    #[error("Unknown serializer type: {0}")]
    UnknownSerializer(String),
    #[error("Unsupported value: {0}")]
    Unsupported(String),
    #[error("Failed to encode value: {0}")]
    Encode(String),
    #[error("Failed to decode value: {0}")]
    Decode(String),
    #[error("Unknown value flags: {0}")]
    UnknownFlags(u32),
}
