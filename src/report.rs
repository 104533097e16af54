//! Aggregatable report envelope and payload decoding.

use crate::Timestamp;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Major version of the report format this worker understands.
pub const SUPPORTED_MAJOR_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shared_info is not a valid envelope: {0}")]
    SharedInfoParse(#[from] serde_json::Error),
    #[error("payload is not a CBOR contribution map")]
    PayloadShape,
    #[error("payload CBOR parse error: {0}")]
    Cbor(#[from] ciborium::de::Error<std::io::Error>),
    #[error("contribution bucket must be 16 bytes, got {0}")]
    BucketWidth(usize),
    #[error("contribution value {0} does not fit in u32")]
    ValueRange(i128),
}

/// One record of the input shards, exactly as it arrives off the wire.
#[derive(Clone, Derivative, PartialEq, Eq, Deserialize, Serialize)]
#[derivative(Debug)]
pub struct EncryptedReport {
    /// Encapsulated key followed by ciphertext.
    #[derivative(Debug = "ignore")]
    pub payload: Vec<u8>,
    pub key_id: String,
    /// JSON envelope, kept verbatim: its exact bytes are the decryption's
    /// associated data.
    pub shared_info: String,
}

/// Parsed view of the report's non-secret envelope.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SharedInfo {
    pub api: String,
    pub version: String,
    pub report_id: Uuid,
    pub reporting_origin: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub scheduled_report_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution_destination: Option<String>,
}

impl SharedInfo {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Major component of the semver-ish `version` string.
    pub fn major_version(&self) -> Option<u32> {
        self.version
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
    }
}

/// One `(bucket, value)` pair from a decrypted payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Contribution {
    pub bucket: u128,
    pub value: u32,
}

/// A fully decrypted and decoded report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub shared_info: SharedInfo,
    pub contributions: Vec<Contribution>,
}

/// Decode the plaintext CBOR payload: a map whose `"data"` entry is an array
/// of `{"bucket": bstr(16), "value": uint}` maps. Other entries (such as
/// `"operation"`) are ignored.
pub fn decode_payload(bytes: &[u8]) -> Result<Vec<Contribution>, Error> {
    use ciborium::Value;

    let payload: Value = ciborium::from_reader(bytes)?;
    let entries = payload.as_map().ok_or(Error::PayloadShape)?;

    let data = entries
        .iter()
        .find(|(key, _)| key.as_text() == Some("data"))
        .map(|(_, value)| value)
        .ok_or(Error::PayloadShape)?;
    let items = data.as_array().ok_or(Error::PayloadShape)?;

    let mut contributions = Vec::with_capacity(items.len());
    for item in items {
        let fields = item.as_map().ok_or(Error::PayloadShape)?;

        let bucket_bytes = fields
            .iter()
            .find(|(key, _)| key.as_text() == Some("bucket"))
            .and_then(|(_, value)| value.as_bytes())
            .ok_or(Error::PayloadShape)?;
        let bucket = crate::bucket_from_bytes(bucket_bytes)
            .ok_or(Error::BucketWidth(bucket_bytes.len()))?;

        let raw_value = fields
            .iter()
            .find(|(key, _)| key.as_text() == Some("value"))
            .and_then(|(_, value)| value.as_integer())
            .ok_or(Error::PayloadShape)?;
        let raw_value = i128::from(raw_value);
        let value = u32::try_from(raw_value).map_err(|_| Error::ValueRange(raw_value))?;

        contributions.push(Contribution { bucket, value });
    }

    Ok(contributions)
}
