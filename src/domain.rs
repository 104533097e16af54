//! Output-domain ingestion.
//!
//! The domain is a second input: shards of allowed bucket keys, either Avro
//! container files (`.avro`) or US-ASCII text with one decimal key per line.
//! Keys repeated across shards are deduplicated silently.

use crate::blob::{self, BlobLocation, BlobStore};
use crate::codec;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no output-domain shards under {0}/{1}")]
    NoShards(String, String),
    #[error(transparent)]
    Blob(#[from] blob::Error),
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error("malformed domain line {0:?}")]
    MalformedLine(String),
    #[error("domain shard is not US-ASCII text")]
    NotText,
}

/// Stream every shard under `location` and collect the allowed bucket keys.
pub async fn read_output_domain(
    store: &dyn BlobStore,
    location: &BlobLocation,
) -> Result<BTreeSet<u128>, Error> {
    let keys = store.list(&location.bucket, &location.prefix).await?;
    if keys.is_empty() {
        return Err(Error::NoShards(
            location.bucket.clone(),
            location.prefix.clone(),
        ));
    }

    let mut buckets = BTreeSet::new();
    for key in keys {
        let bytes = store.get(&location.bucket, &key).await?;
        if key.ends_with(".avro") {
            buckets.extend(codec::decode_domain_shard(&bytes)?);
        } else {
            buckets.extend(parse_text_shard(&bytes)?);
        }
        debug!(shard = %key, total = buckets.len(), "read output-domain shard");
    }
    Ok(buckets)
}

fn parse_text_shard(bytes: &[u8]) -> Result<Vec<u128>, Error> {
    let text = std::str::from_utf8(bytes).map_err(|_| Error::NotText)?;
    let mut buckets = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        buckets.push(
            line.parse::<u128>()
                .map_err(|_| Error::MalformedLine(line.to_string()))?,
        );
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn avro_domain_across_shards_deduplicates() {
        let store = MemoryBlobStore::new();
        store
            .put(
                "domain",
                "day-1/shard-1.avro",
                codec::encode_domain_shard(&[1, 2]).unwrap(),
            )
            .await
            .unwrap();
        store
            .put(
                "domain",
                "day-1/shard-2.avro",
                codec::encode_domain_shard(&[2, 3]).unwrap(),
            )
            .await
            .unwrap();

        let location = BlobLocation::new("domain", "day-1/");
        let buckets = read_output_domain(&store, &location).await.unwrap();
        assert_eq!(buckets, BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn text_domain() {
        let store = MemoryBlobStore::new();
        store
            .put("domain", "day-1/keys.txt", b"1\n340282366920938463463374607431768211455\n\n7\n".to_vec())
            .await
            .unwrap();

        let location = BlobLocation::new("domain", "day-1/");
        let buckets = read_output_domain(&store, &location).await.unwrap();
        assert_eq!(buckets, BTreeSet::from([1, 7, u128::MAX]));
    }

    #[tokio::test]
    async fn missing_shards_are_an_error() {
        let store = MemoryBlobStore::new();
        let location = BlobLocation::new("domain", "day-1/");
        assert_matches!(
            read_output_domain(&store, &location).await,
            Err(Error::NoShards(_, _))
        );
    }

    #[tokio::test]
    async fn malformed_text_line_is_an_error() {
        let store = MemoryBlobStore::new();
        store
            .put("domain", "day-1/keys.txt", b"1\nnot-a-number\n".to_vec())
            .await
            .unwrap();

        let location = BlobLocation::new("domain", "day-1/");
        assert_matches!(
            read_output_domain(&store, &location).await,
            Err(Error::MalformedLine(_))
        );
    }

    #[tokio::test]
    async fn corrupt_avro_shard_is_an_error() {
        let store = MemoryBlobStore::new();
        store
            .put("domain", "day-1/shard.avro", b"garbage".to_vec())
            .await
            .unwrap();

        let location = BlobLocation::new("domain", "day-1/");
        assert_matches!(
            read_output_domain(&store, &location).await,
            Err(Error::Codec(_))
        );
    }

    #[tokio::test]
    async fn empty_avro_shard_yields_empty_domain() {
        let store = MemoryBlobStore::new();
        store
            .put(
                "domain",
                "day-1/shard.avro",
                codec::encode_domain_shard(&[]).unwrap(),
            )
            .await
            .unwrap();

        let location = BlobLocation::new("domain", "day-1/");
        let buckets = read_output_domain(&store, &location).await.unwrap();
        assert!(buckets.is_empty());
    }
}
