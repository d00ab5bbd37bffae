//! The Kubernetes `v1.Secret` wire representation.
//!
//! Only the fields the proxy acts on are typed. Everything else the API
//! server sends (`apiVersion`, `kind`, `type`, `immutable`, `uid`,
//! `managedFields`, ...) is kept verbatim in flattened maps so that a decode
//! followed by an encode never drops data the proxy does not own.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Annotation selecting which injector transforms a secret, e.g. `ksp/inject: gpg`.
pub const INJECT_ANNOTATION: &str = "ksp/inject";

/// Raw bytes carried as a base64 string on the wire.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteString(pub Vec<u8>);

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secret values never end up in logs.
        write!(f, "ByteString({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for ByteString {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for ByteString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ByteString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(ByteString)
            .map_err(|e| de::Error::custom(format!("invalid base64 data: {e}")))
    }
}

/// The subset of `ObjectMeta` the proxy reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Every other metadata field, untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A secret resource as materialised from a request or response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Binary values, base64 on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, ByteString>>,

    /// Write-only plaintext values the API server merges into `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_data: Option<BTreeMap<String, String>>,

    /// Every other top-level field, untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Secret {
    /// Value of the [`INJECT_ANNOTATION`] marker, if present.
    pub fn inject_marker(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(INJECT_ANNOTATION))
            .map(String::as_str)
    }

    /// Returns `true` if the marker names `injector`.
    pub fn is_marked_for(&self, injector: &str) -> bool {
        self.inject_marker() == Some(injector)
    }
}
