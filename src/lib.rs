//! Batch aggregation worker for encrypted aggregatable reports.
//!
//! A job drains Avro shards of encrypted reports from a blob store, decrypts
//! and validates each report, sums contributions per 128-bit bucket, joins an
//! optional output domain, applies differentially-private noise with
//! thresholding, debits a distributed privacy-budget ledger, and writes
//! summary (and, for debug runs, annotated) result shards back to the store.

use chrono::{TimeZone, Utc};

pub mod aggregate;
pub mod blob;
pub mod budget;
pub mod codec;
pub mod domain;
pub mod error;
pub mod hpke;
pub mod noise;
pub mod parameters;
pub mod processor;
pub mod report;
pub mod results;
pub mod validation;

/// Instants are UTC throughout; the wire encodes them as epoch seconds.
pub type Timestamp = chrono::DateTime<Utc>;

/// Big-endian encoding of a bucket key, the only serialized form.
pub fn bucket_to_bytes(bucket: u128) -> [u8; 16] {
    bucket.to_be_bytes()
}

/// Inverse of [`bucket_to_bytes`]. Exactly 16 bytes are required.
pub fn bucket_from_bytes(bytes: &[u8]) -> Option<u128> {
    let array: [u8; 16] = bytes.try_into().ok()?;
    Some(u128::from_be_bytes(array))
}

/// Truncate an instant down to the start of its UTC hour.
pub fn truncate_to_hour(timestamp: Timestamp) -> Timestamp {
    let seconds = timestamp.timestamp();
    let truncated = seconds - seconds.rem_euclid(3600);
    Utc.timestamp_opt(truncated, 0).single().unwrap_or(timestamp)
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::hpke::{seal, PublicKey};
    use crate::report::EncryptedReport;

    /// Builds the JSON envelope string for a report with the given identity
    /// fields. `time` is epoch seconds.
    pub fn shared_info_json(reporting_origin: &str, version: &str, time: i64) -> String {
        format!(
            concat!(
                r#"{{"api":"attribution-reporting","version":"{}","#,
                r#""report_id":"21090458-d886-4b42-97ef-55a581f30dae","#,
                r#""reporting_origin":"{}","scheduled_report_time":{}}}"#
            ),
            version, reporting_origin, time
        )
    }

    /// CBOR payload holding the given `(bucket, value)` contributions.
    pub fn cbor_payload(contributions: &[(u128, u32)]) -> Vec<u8> {
        use ciborium::Value;

        let data = contributions
            .iter()
            .map(|(bucket, value)| {
                Value::Map(vec![
                    (
                        Value::Text("bucket".into()),
                        Value::Bytes(crate::bucket_to_bytes(*bucket).to_vec()),
                    ),
                    (Value::Text("value".into()), Value::Integer((*value).into())),
                ])
            })
            .collect();

        let payload = Value::Map(vec![
            (Value::Text("operation".into()), Value::Text("histogram".into())),
            (Value::Text("data".into()), Value::Array(data)),
        ]);

        let mut bytes = Vec::new();
        ciborium::into_writer(&payload, &mut bytes).unwrap();
        bytes
    }

    /// Seal a full encrypted report for the given recipient key.
    pub fn encrypted_report(
        public_key: &PublicKey,
        key_id: &str,
        shared_info: String,
        contributions: &[(u128, u32)],
    ) -> EncryptedReport {
        let payload = seal(public_key, &shared_info, &cbor_payload(contributions)).unwrap();
        EncryptedReport {
            payload,
            key_id: key_id.to_string(),
            shared_info,
        }
    }
}
