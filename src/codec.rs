//! Avro Object Container File codecs for the three wire contracts: encrypted
//! report shards, output-domain shards, and summary/debug result shards.
//!
//! The schemas are fixed binary contracts; they are inlined here rather than
//! loaded from files so the crate cannot drift from what peers ship.

use crate::noise::{AggregatedFact, DebugAnnotation};
use crate::report::EncryptedReport;
use apache_avro::types::{Record, Value};
use apache_avro::{Reader, Schema, Writer};
use std::collections::BTreeSet;

pub const REPORT_SCHEMA: &str = r#"{
  "type": "record",
  "name": "AggregatableReport",
  "fields": [
    {"name": "payload", "type": "bytes"},
    {"name": "key_id", "type": "string"},
    {"name": "shared_info", "type": "string"}
  ]
}"#;

pub const DOMAIN_SCHEMA: &str = r#"{
  "type": "record",
  "name": "AggregationBucket",
  "fields": [
    {"name": "bucket", "type": "bytes"}
  ]
}"#;

pub const SUMMARY_SCHEMA: &str = r#"{
  "type": "record",
  "name": "AggregatedFact",
  "fields": [
    {"name": "bucket", "type": "bytes"},
    {"name": "metric", "type": "long"}
  ]
}"#;

pub const DEBUG_SUMMARY_SCHEMA: &str = r#"{
  "type": "record",
  "name": "DebugAggregatedFact",
  "fields": [
    {"name": "bucket", "type": "bytes"},
    {"name": "metric", "type": "long"},
    {"name": "unnoised_metric", "type": "long"},
    {"name": "annotations", "type": {
      "type": "array",
      "items": {
        "type": "enum",
        "name": "DebugAnnotation",
        "symbols": ["IN_REPORTS", "IN_DOMAIN"]
      }
    }}
  ]
}"#;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error("schema is not a record")]
    Schema,
    #[error("record field {0:?} missing or mistyped")]
    Field(&'static str),
    #[error("bucket must be 16 bytes, got {0}")]
    BucketWidth(usize),
    #[error("unknown annotation symbol {0:?}")]
    Annotation(String),
}

/// Decode one shard of encrypted reports.
pub fn decode_report_shard(bytes: &[u8]) -> Result<Vec<EncryptedReport>, Error> {
    let schema = Schema::parse_str(REPORT_SCHEMA)?;
    let mut reports = Vec::new();
    for value in Reader::with_schema(&schema, bytes)? {
        let mut fields = record_fields(value?)?;
        reports.push(EncryptedReport {
            payload: take_bytes(&mut fields, "payload")?,
            key_id: take_string(&mut fields, "key_id")?,
            shared_info: take_string(&mut fields, "shared_info")?,
        });
    }
    Ok(reports)
}

/// Encode a shard of encrypted reports, the inverse of
/// [`decode_report_shard`]. Used by report-generation tooling and tests.
pub fn encode_report_shard(reports: &[EncryptedReport]) -> Result<Vec<u8>, Error> {
    let schema = Schema::parse_str(REPORT_SCHEMA)?;
    let mut writer = Writer::new(&schema, Vec::new());
    for report in reports {
        let mut record = Record::new(&schema).ok_or(Error::Schema)?;
        record.put("payload", Value::Bytes(report.payload.clone()));
        record.put("key_id", Value::String(report.key_id.clone()));
        record.put("shared_info", Value::String(report.shared_info.clone()));
        writer.append(record)?;
    }
    Ok(writer.into_inner()?)
}

/// Decode one output-domain shard into its bucket keys.
pub fn decode_domain_shard(bytes: &[u8]) -> Result<Vec<u128>, Error> {
    let schema = Schema::parse_str(DOMAIN_SCHEMA)?;
    let mut buckets = Vec::new();
    for value in Reader::with_schema(&schema, bytes)? {
        let mut fields = record_fields(value?)?;
        buckets.push(take_bucket(&mut fields, "bucket")?);
    }
    Ok(buckets)
}

pub fn encode_domain_shard(buckets: &[u128]) -> Result<Vec<u8>, Error> {
    let schema = Schema::parse_str(DOMAIN_SCHEMA)?;
    let mut writer = Writer::new(&schema, Vec::new());
    for &bucket in buckets {
        let mut record = Record::new(&schema).ok_or(Error::Schema)?;
        record.put("bucket", Value::Bytes(crate::bucket_to_bytes(bucket).to_vec()));
        writer.append(record)?;
    }
    Ok(writer.into_inner()?)
}

/// Encode summary facts, sorted ascending by bucket bytes.
pub fn encode_summary(facts: &[AggregatedFact]) -> Result<Vec<u8>, Error> {
    let schema = Schema::parse_str(SUMMARY_SCHEMA)?;
    let mut writer = Writer::new(&schema, Vec::new());
    for fact in sorted(facts) {
        let mut record = Record::new(&schema).ok_or(Error::Schema)?;
        record.put("bucket", Value::Bytes(crate::bucket_to_bytes(fact.bucket).to_vec()));
        record.put("metric", Value::Long(fact.metric));
        writer.append(record)?;
    }
    Ok(writer.into_inner()?)
}

pub fn decode_summary(bytes: &[u8]) -> Result<Vec<AggregatedFact>, Error> {
    let schema = Schema::parse_str(SUMMARY_SCHEMA)?;
    let mut facts = Vec::new();
    for value in Reader::with_schema(&schema, bytes)? {
        let mut fields = record_fields(value?)?;
        let bucket = take_bucket(&mut fields, "bucket")?;
        let metric = take_long(&mut fields, "metric")?;
        facts.push(AggregatedFact {
            bucket,
            metric,
            unnoised_metric: 0,
            annotations: None,
        });
    }
    Ok(facts)
}

/// Encode debug facts with their membership annotations, sorted ascending by
/// bucket bytes.
pub fn encode_debug_summary(facts: &[AggregatedFact]) -> Result<Vec<u8>, Error> {
    let schema = Schema::parse_str(DEBUG_SUMMARY_SCHEMA)?;
    let mut writer = Writer::new(&schema, Vec::new());
    for fact in sorted(facts) {
        let annotations = fact
            .annotations
            .iter()
            .flatten()
            .map(|a| {
                Value::Enum(
                    match a {
                        DebugAnnotation::InReports => 0,
                        DebugAnnotation::InDomain => 1,
                    },
                    a.as_str().to_string(),
                )
            })
            .collect();

        let mut record = Record::new(&schema).ok_or(Error::Schema)?;
        record.put("bucket", Value::Bytes(crate::bucket_to_bytes(fact.bucket).to_vec()));
        record.put("metric", Value::Long(fact.metric));
        record.put(
            "unnoised_metric",
            Value::Long(i64::try_from(fact.unnoised_metric).unwrap_or(i64::MAX)),
        );
        record.put("annotations", Value::Array(annotations));
        writer.append(record)?;
    }
    Ok(writer.into_inner()?)
}

pub fn decode_debug_summary(bytes: &[u8]) -> Result<Vec<AggregatedFact>, Error> {
    let schema = Schema::parse_str(DEBUG_SUMMARY_SCHEMA)?;
    let mut facts = Vec::new();
    for value in Reader::with_schema(&schema, bytes)? {
        let mut fields = record_fields(value?)?;
        let bucket = take_bucket(&mut fields, "bucket")?;
        let metric = take_long(&mut fields, "metric")?;
        let unnoised = take_long(&mut fields, "unnoised_metric")?;

        let mut annotations = BTreeSet::new();
        match take(&mut fields, "annotations")? {
            Value::Array(items) => {
                for item in items {
                    let symbol = match item {
                        Value::Enum(_, symbol) => symbol,
                        Value::String(symbol) => symbol,
                        _ => return Err(Error::Field("annotations")),
                    };
                    annotations.insert(
                        DebugAnnotation::from_str(&symbol)
                            .ok_or(Error::Annotation(symbol))?,
                    );
                }
            }
            _ => return Err(Error::Field("annotations")),
        }

        facts.push(AggregatedFact {
            bucket,
            metric,
            unnoised_metric: u64::try_from(unnoised).unwrap_or(0),
            annotations: Some(annotations),
        });
    }
    Ok(facts)
}

fn sorted(facts: &[AggregatedFact]) -> Vec<AggregatedFact> {
    let mut facts = facts.to_vec();
    facts.sort_by_key(|f| f.bucket);
    facts
}

fn record_fields(value: Value) -> Result<Vec<(String, Value)>, Error> {
    match value {
        Value::Record(fields) => Ok(fields),
        _ => Err(Error::Schema),
    }
}

fn take(fields: &mut Vec<(String, Value)>, name: &'static str) -> Result<Value, Error> {
    let index = fields
        .iter()
        .position(|(n, _)| n == name)
        .ok_or(Error::Field(name))?;
    Ok(fields.swap_remove(index).1)
}

fn take_bytes(fields: &mut Vec<(String, Value)>, name: &'static str) -> Result<Vec<u8>, Error> {
    match take(fields, name)? {
        Value::Bytes(bytes) | Value::Fixed(_, bytes) => Ok(bytes),
        _ => Err(Error::Field(name)),
    }
}

fn take_string(fields: &mut Vec<(String, Value)>, name: &'static str) -> Result<String, Error> {
    match take(fields, name)? {
        Value::String(s) => Ok(s),
        _ => Err(Error::Field(name)),
    }
}

fn take_long(fields: &mut Vec<(String, Value)>, name: &'static str) -> Result<i64, Error> {
    match take(fields, name)? {
        Value::Long(l) => Ok(l),
        Value::Int(i) => Ok(i64::from(i)),
        _ => Err(Error::Field(name)),
    }
}

fn take_bucket(fields: &mut Vec<(String, Value)>, name: &'static str) -> Result<u128, Error> {
    let bytes = take_bytes(fields, name)?;
    crate::bucket_from_bytes(&bytes).ok_or(Error::BucketWidth(bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn report_shard_round_trip() {
        let reports = vec![
            EncryptedReport {
                payload: vec![1, 2, 3],
                key_id: "key-1".to_string(),
                shared_info: "{\"a\":1}".to_string(),
            },
            EncryptedReport {
                payload: vec![],
                key_id: "key-2".to_string(),
                shared_info: String::new(),
            },
        ];
        let bytes = encode_report_shard(&reports).unwrap();
        assert_eq!(decode_report_shard(&bytes).unwrap(), reports);
    }

    #[test]
    fn empty_report_shard_decodes() {
        let bytes = encode_report_shard(&[]).unwrap();
        assert_eq!(decode_report_shard(&bytes).unwrap(), vec![]);
    }

    #[test]
    fn corrupt_shard_is_an_error() {
        assert_matches!(decode_report_shard(b"not avro at all"), Err(Error::Avro(_)));
    }

    #[test]
    fn domain_shard_round_trip() {
        let buckets = vec![0u128, 1, u128::MAX];
        let bytes = encode_domain_shard(&buckets).unwrap();
        assert_eq!(decode_domain_shard(&bytes).unwrap(), buckets);
    }

    #[test]
    fn empty_domain_shard_decodes() {
        let bytes = encode_domain_shard(&[]).unwrap();
        assert_eq!(decode_domain_shard(&bytes).unwrap(), vec![]);
    }

    #[test]
    fn summary_round_trip_sorts_by_bucket() {
        let facts = vec![
            AggregatedFact {
                bucket: 9,
                metric: -2,
                unnoised_metric: 0,
                annotations: None,
            },
            AggregatedFact {
                bucket: 1,
                metric: 5,
                unnoised_metric: 0,
                annotations: None,
            },
        ];
        let bytes = encode_summary(&facts).unwrap();
        let decoded = decode_summary(&bytes).unwrap();
        let buckets: Vec<u128> = decoded.iter().map(|f| f.bucket).collect();
        assert_eq!(buckets, vec![1, 9]);
        assert_eq!(decoded[0].metric, 5);
        assert_eq!(decoded[1].metric, -2);
    }

    #[test]
    fn debug_summary_round_trip() {
        let facts = vec![AggregatedFact {
            bucket: 3,
            metric: 12,
            unnoised_metric: 10,
            annotations: Some(BTreeSet::from([
                DebugAnnotation::InReports,
                DebugAnnotation::InDomain,
            ])),
        }];
        let bytes = encode_debug_summary(&facts).unwrap();
        let decoded = decode_debug_summary(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].bucket, 3);
        assert_eq!(decoded[0].metric, 12);
        assert_eq!(decoded[0].unnoised_metric, 10);
        assert_eq!(
            decoded[0].annotations,
            Some(BTreeSet::from([
                DebugAnnotation::InReports,
                DebugAnnotation::InDomain
            ]))
        );
    }

    #[test]
    fn boundary_buckets_survive_the_wire() {
        let facts = vec![
            AggregatedFact {
                bucket: 0,
                metric: 0,
                unnoised_metric: 0,
                annotations: None,
            },
            AggregatedFact {
                bucket: u128::MAX,
                metric: 1,
                unnoised_metric: 0,
                annotations: None,
            },
        ];
        let bytes = encode_summary(&facts).unwrap();
        let decoded = decode_summary(&bytes).unwrap();
        assert_eq!(decoded[0].bucket, 0);
        assert_eq!(decoded[1].bucket, u128::MAX);
    }
}
