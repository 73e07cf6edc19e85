//! MessagePack wire codec.
//!
//! Every binary body that crosses the HTTP boundary (bond payloads in, patch
//! sets and bond graphs out) and every cache entry on disk uses MessagePack
//! with named struct fields. Maps are encoded with sorted keys because the
//! tree type is backed by `BTreeMap`, so equal values always encode to equal
//! bytes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::engine::{BondValues, NotebookState};

/// Upper bound on a decoded bond payload.
pub const MAX_BOND_PAYLOAD: usize = 8 * 1024 * 1024;

/// Errors from encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is empty.
    #[error("empty payload")]
    Empty,

    /// The payload exceeds [`MAX_BOND_PAYLOAD`].
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    TooLarge {
        /// Actual payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The bytes are not valid MessagePack for the expected shape.
    #[error("malformed payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Encodes any serializable value with named fields.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be represented.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Serializes a full notebook state snapshot.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the tree cannot be encoded.
pub fn serialize_state(state: &NotebookState) -> Result<Vec<u8>, CodecError> {
    encode(state)
}

/// Deserializes a full notebook state snapshot.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not a MessagePack tree.
pub fn deserialize_state(bytes: &[u8]) -> Result<NotebookState, CodecError> {
    decode(bytes)
}

/// Decodes a client-submitted bond mapping.
///
/// The payload must be a MessagePack map from bond name to value. Values are
/// opaque to the server and handed to the engine untouched.
///
/// # Errors
///
/// Returns [`CodecError::Empty`], [`CodecError::TooLarge`] or
/// [`CodecError::Decode`].
pub fn deserialize_bonds(bytes: &[u8]) -> Result<BondValues, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    if bytes.len() > MAX_BOND_PAYLOAD {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_BOND_PAYLOAD,
        });
    }
    decode(bytes)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_bonds_decode_from_msgpack_map() {
        let mut bonds = BondValues::new();
        bonds.insert("x".to_string(), json!({ "value": 3 }));
        bonds.insert("label".to_string(), json!({ "value": "hi" }));
        let bytes = encode(&bonds).unwrap();

        let decoded = deserialize_bonds(&bytes).unwrap();
        assert_eq!(decoded, bonds);
    }

    #[test]
    fn test_bonds_reject_non_map_payload() {
        let bytes = encode(&vec![1, 2, 3]).unwrap();
        assert!(matches!(
            deserialize_bonds(&bytes),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_bonds_reject_garbage_and_empty() {
        assert!(matches!(deserialize_bonds(&[]), Err(CodecError::Empty)));
        assert!(deserialize_bonds(&[0xc1, 0xff, 0x00]).is_err());
    }

    #[test]
    fn test_equal_states_encode_identically() {
        // Key insertion order must not leak into the encoding.
        let a = json!({ "b": 1, "a": { "z": true, "y": null } });
        let b = json!({ "a": { "y": null, "z": true }, "b": 1 });
        assert_eq!(serialize_state(&a).unwrap(), serialize_state(&b).unwrap());
    }

    #[test]
    fn test_state_survives_encoding() {
        let state = json!({
            "cell_results": { "c1": { "output": [1, 2.5, "three"] } },
            "bonds": {},
        });
        let bytes = serialize_state(&state).unwrap();
        assert_eq!(deserialize_state(&bytes).unwrap(), state);
    }
}
