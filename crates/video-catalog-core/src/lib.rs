//! Parallel video feature extraction into a bucketed, globally ordered
//! catalog table.
//!
//! A run takes a catalog of video references and produces one table with a
//! row per usable video:
//!
//! - Videos are probed in parallel by a fixed pool of workers, one
//!   contiguous catalog chunk each (`partition`, `worker`, `probe`).
//! - Each video gets a frame-count bucket aligned to the encoder and model
//!   strides (`bucket`).
//! - Chunk output is appended to a staging table as it completes; the first
//!   record fixes the schema (`schema`, `writer`).
//! - After every chunk is written, the staging table is sorted once by
//!   `(bucket, aspect_ratio, filename)` and numbered (`indexer`).
//! - The result is read back lazily, field by field (`reader`).
//!
//! Probe failures never abort a run; they are written to a failure log
//! (`failure_log`). Tables live in a [`column_store::ColumnStore`]; the
//! on-disk implementation keeps one directory of Parquet segments per table.
#![deny(missing_docs)]
pub mod bucket;
pub mod catalog;
pub mod column_store;
pub mod config;
pub mod failure_log;
pub mod indexer;
pub mod partition;
pub mod pipeline;
pub mod probe;
pub mod reader;
pub mod record;
pub mod schema;
pub mod storage;
pub mod worker;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_util;
