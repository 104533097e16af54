//! Serialization and upload of result shards.

use crate::blob::{self, BlobLocation, BlobStore};
use crate::codec;
use crate::noise::AggregatedFact;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error(transparent)]
    Blob(#[from] blob::Error),
}

/// Object key of the single summary shard for an output prefix.
pub fn summary_object_key(prefix: &str) -> String {
    format!("{prefix}-1-of-1")
}

/// Debug shard key: the summary key with `debug_` spliced in before the file
/// name.
pub fn debug_object_key(summary_key: &str) -> String {
    match summary_key.rsplit_once('/') {
        Some((directory, name)) => format!("{directory}/debug_{name}"),
        None => format!("debug_{summary_key}"),
    }
}

/// Writes summary (and, for debug runs, debug) shards to the output location.
pub struct ResultLogger {
    store: Arc<dyn BlobStore>,
}

impl ResultLogger {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(err, skip(self, summary, debug))]
    pub async fn write(
        &self,
        output: &BlobLocation,
        summary: &[AggregatedFact],
        debug: Option<&[AggregatedFact]>,
    ) -> Result<(), Error> {
        let summary_key = summary_object_key(&output.prefix);
        self.store
            .put(&output.bucket, &summary_key, codec::encode_summary(summary)?)
            .await?;
        info!(
            bucket = %output.bucket,
            key = %summary_key,
            facts = summary.len(),
            "wrote summary shard"
        );

        if let Some(facts) = debug {
            let debug_key = debug_object_key(&summary_key);
            self.store
                .put(
                    &output.bucket,
                    &debug_key,
                    codec::encode_debug_summary(facts)?,
                )
                .await?;
            info!(
                bucket = %output.bucket,
                key = %debug_key,
                facts = facts.len(),
                "wrote debug shard"
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for ResultLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultLogger").finish_non_exhaustive()
    }
}
