//! One end-to-end catalog run.
//!
//! 1. Validate the configuration and truncate the failure log.
//! 2. Cut the catalog into at most `workers` contiguous chunks.
//! 3. Probe every chunk on a fixed-size rayon pool. Each finished chunk is
//!    sent back over a channel and appended to the staging table as one
//!    batch, in completion order. Only this loop touches the store.
//! 4. Once every chunk has been written, sort the staging table into the
//!    indexed table and drop the staging table.
//!
//! Any write failure stops the run before indexing; the staging table is
//! left in place for inspection. Workers are told to stop, and the run only
//! returns once every worker has finished, so nothing writes to the failure
//! log after `run` returns.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use snafu::{prelude::*, IntoError};
use tokio::sync::mpsc;

use crate::{
    catalog::CatalogEntry,
    column_store::{ColumnStore, StoreError},
    config::{ConfigError, RunConfig},
    failure_log::{FailureLog, FailureLogError, FailureSink},
    indexer::{self, IndexError},
    partition::{self, PartitionError},
    probe::{Decoder, FfprobeDecoder, Probe},
    record::ProcessedRecord,
    worker::Worker,
    writer::{WriteError, Writer},
};

/// Errors that abort a run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    /// The configuration is invalid.
    #[snafu(display("Invalid configuration: {source}"))]
    Config {
        /// Underlying configuration error.
        source: ConfigError,
    },

    /// The failure log could not be created.
    #[snafu(display("{source}"))]
    FailureLog {
        /// Underlying failure log error.
        source: FailureLogError,
    },

    /// The catalog could not be partitioned.
    #[snafu(display("Cannot partition catalog: {source}"))]
    Partition {
        /// Underlying partition error.
        source: PartitionError,
    },

    /// The worker pool could not be started.
    #[snafu(display("Cannot start worker pool: {source}"))]
    ThreadPool {
        /// Underlying rayon error.
        source: rayon::ThreadPoolBuildError,
    },

    /// Housekeeping on a table failed.
    #[snafu(display("Store error on {table}: {source}"))]
    Store {
        /// Table name.
        table: String,
        /// Underlying store error.
        source: StoreError,
    },

    /// A chunk could not be written. Indexing did not run.
    #[snafu(display("Cannot write chunk {chunk}: {source}"))]
    Write {
        /// Index of the chunk.
        chunk: usize,
        /// Underlying write error.
        source: WriteError,
    },

    /// A worker ended without reporting its chunk.
    #[snafu(display("Only {received} of {expected} chunks were reported by workers"))]
    WorkerLost {
        /// Number of chunks dispatched.
        expected: usize,
        /// Number of chunks received.
        received: usize,
    },

    /// Index building failed.
    #[snafu(display("Cannot build index: {source}"))]
    Index {
        /// Underlying index error.
        source: IndexError,
    },
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Catalog entries seen.
    pub total: usize,
    /// Entries whose probe succeeded.
    pub succeeded: usize,
    /// Entries whose probe failed (one failure log line each).
    pub failed: usize,
    /// Chunks dispatched to workers.
    pub chunks: usize,
    /// Rows in the indexed table.
    pub rows_indexed: u64,
    /// Name of the indexed table.
    pub table: String,
}

struct ChunkOutput {
    index: usize,
    entries: usize,
    records: Vec<ProcessedRecord>,
}

/// Run the pipeline over `catalog`, probing with `decoder` and writing to
/// `store`.
pub async fn run<D, S>(
    config: &RunConfig,
    catalog: Vec<CatalogEntry>,
    decoder: Arc<D>,
    store: &mut S,
) -> Result<RunReport, PipelineError>
where
    D: Decoder + 'static,
    S: ColumnStore,
{
    config.validate().context(ConfigSnafu)?;
    let strides = config.strides().context(ConfigSnafu)?;
    let manifest = Arc::new(config.field_manifest().context(ConfigSnafu)?);
    let staging = config.staging_table();
    let target = config.indexed_table();

    let failure_log = Arc::new(FailureLog::create(&config.failure_log).context(FailureLogSnafu)?);
    let sink: Arc<dyn FailureSink> = failure_log.clone();

    if store
        .drop_table(&staging)
        .await
        .context(StoreSnafu { table: &staging })?
    {
        log::warn!("dropped leftover staging table {staging}");
    }

    let total = catalog.len();
    let chunks = partition::partition(catalog, config.workers).context(PartitionSnafu)?;
    let expected = chunks.len();
    log::info!(
        "processing {total} videos in {expected} chunks with {} workers ({strides})",
        config.workers
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|i| format!("video-worker-{i}"))
        .panic_handler(|_| log::error!("a video worker panicked; its chunk is lost"))
        .build()
        .context(ThreadPoolSnafu)?;

    let probe = Probe::new(decoder).with_timeout(config.probe_timeout());
    let worker = Worker::new(
        probe,
        strides,
        Arc::clone(&manifest),
        sink,
        config.probe_failure_policy,
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel::<ChunkOutput>();
    for chunk in chunks {
        let worker = worker.clone();
        let tx = tx.clone();
        let stop = Arc::clone(&stop);
        pool.spawn(move || {
            let records = worker.run_until(&chunk.items, &stop);
            // The receiver is gone only if the run future was dropped.
            let _ = tx.send(ChunkOutput {
                index: chunk.index,
                entries: chunk.items.len(),
                records,
            });
        });
    }
    drop(tx);

    let mut received = 0;
    let mut written = 0u64;
    let mut write_failure = None;
    {
        let mut writer = Writer::new(&mut *store, staging.as_str());
        // Runs until every job has dropped its sender, including after a
        // failure, so no worker outlives the run.
        while let Some(output) = rx.recv().await {
            received += 1;
            if write_failure.is_some() {
                continue;
            }
            match writer.append(&output.records).await {
                Ok(rows) => {
                    written += rows;
                    log::info!(
                        "chunk {} done: {rows} of {} entries written ({received}/{expected})",
                        output.index,
                        output.entries
                    );
                }
                Err(source) => {
                    log::error!("chunk {} failed to write; stopping workers", output.index);
                    stop.store(true, Ordering::SeqCst);
                    write_failure = Some(
                        WriteSnafu {
                            chunk: output.index,
                        }
                        .into_error(source),
                    );
                }
            }
        }
    }
    if let Some(err) = write_failure {
        return Err(err);
    }
    ensure!(received == expected, WorkerLostSnafu { expected, received });

    let failed = failure_log.reported();
    let succeeded = total.saturating_sub(failed);

    if written == 0
        && store
            .table_schema(&staging)
            .await
            .context(StoreSnafu { table: &staging })?
            .is_none()
    {
        // Nothing survived probing, so there is no schema to index with.
        if store
            .drop_table(&target)
            .await
            .context(StoreSnafu { table: &target })?
        {
            log::warn!("dropped stale index table {target}");
        }
        log::warn!("no records were produced; {target} was not built");
        return Ok(RunReport {
            total,
            succeeded,
            failed,
            chunks: expected,
            rows_indexed: 0,
            table: target,
        });
    }

    let report = indexer::build_index(store, &staging, &target, manifest.bucket_field(), true)
        .await
        .context(IndexSnafu)?;

    log::info!(
        "run finished: {succeeded} succeeded, {failed} failed, {} rows in {target}",
        report.rows
    );
    Ok(RunReport {
        total,
        succeeded,
        failed,
        chunks: expected,
        rows_indexed: report.rows,
        table: target,
    })
}

/// [`run`] with the `ffprobe` decoder configured from `config`.
pub async fn run_with_ffprobe<S: ColumnStore>(
    config: &RunConfig,
    catalog: Vec<CatalogEntry>,
    store: &mut S,
) -> Result<RunReport, PipelineError> {
    let decoder = Arc::new(FfprobeDecoder::new(config.decoder_config()));
    run(config, catalog, decoder, store).await
}
