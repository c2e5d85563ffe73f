//! Canonical CBOR encoding for Atmosphere (§6).
//!
//! All hashed/signed objects use `ciborium`'s deterministic map/array
//! encoding with field order fixed to Rust struct declaration order via the
//! `*Body<'a>` helper structs in [`crate::types`]. Floats that cross into
//! canonical bytes (CostSample, RouteEntry) are normalized first: NaN/Inf
//! are rejected and -0.0 collapses to +0.0 so two logically-equal samples
//! never hash differently.

use crate::error::{CoreError, Result};
use serde::Serialize;

/// Serialize a value to canonical bytes using CBOR.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize canonical CBOR bytes.
pub fn from_canonical_bytes<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::CborDecode(e.to_string()))
}

/// Normalize a float for canonical encoding.
/// - NaN and Inf are rejected
/// - -0.0 is converted to +0.0
pub fn normalize_f64(v: f64) -> Result<f64> {
    if v.is_nan() {
        return Err(CoreError::FloatNormalization("NaN not allowed".into()));
    }
    if v.is_infinite() {
        return Err(CoreError::FloatNormalization("infinity not allowed".into()));
    }
    if v == 0.0 && v.is_sign_negative() {
        return Ok(0.0);
    }
    Ok(v)
}

/// Normalize a float for canonical encoding (f32 variant, used by CostSample
/// fields before they're folded into a signed body).
pub fn normalize_f32(v: f32) -> Result<f32> {
    if v.is_nan() {
        return Err(CoreError::FloatNormalization("NaN not allowed".into()));
    }
    if v.is_infinite() {
        return Err(CoreError::FloatNormalization("infinity not allowed".into()));
    }
    if v == 0.0 && v.is_sign_negative() {
        return Ok(0.0);
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MeshId, NodeId};
    use serde::{Deserialize, Serialize};

    #[test]
    fn float_normalization() {
        assert_eq!(normalize_f64(1.5).unwrap(), 1.5);
        assert_eq!(normalize_f64(0.0).unwrap(), 0.0);
        assert_eq!(normalize_f64(-0.0).unwrap(), 0.0);
        assert!(normalize_f64(f64::NAN).is_err());
        assert!(normalize_f64(f64::INFINITY).is_err());
        assert!(normalize_f64(f64::NEG_INFINITY).is_err());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        node_id: NodeId,
        mesh_id: MeshId,
        version: u64,
    }

    #[test]
    fn canonical_bytes_deterministic() {
        let sample = Sample {
            node_id: NodeId([9; 16]),
            mesh_id: MeshId([3; 8]),
            version: 42,
        };

        let a = canonical_bytes(&sample).unwrap();
        let b = canonical_bytes(&sample).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_bytes_roundtrip() {
        let sample = Sample {
            node_id: NodeId([1; 16]),
            mesh_id: MeshId([2; 8]),
            version: 7,
        };
        let bytes = canonical_bytes(&sample).unwrap();
        let decoded: Sample = from_canonical_bytes(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }
}
