//! Core engine for batch segment generation.
//!
//! This crate turns a flat stream of delimited input rows into a set of
//! immutable, versioned, time-partitioned, hash-sharded storage segments
//! plus a durable descriptor catalog that makes them discoverable:
//!
//! - A job spec model (`job_spec` module) describing the input schema,
//!   aggregators, ingestion interval, segment granularity, and hash
//!   partitioning.
//! - Deterministic shard assignment (`sharding` module): timestamp to
//!   time bucket, dimension tuple to partition index, stable across
//!   processes.
//! - Order-independent row aggregation (`aggregate` module) with an
//!   additive sum and a mergeable distinct-count sketch (`sketch` module).
//! - Segment packaging (`packaging` module): Parquet index artifacts
//!   bundled into a zstd-compressed tar archive, written atomically.
//! - An append-only descriptor catalog (`catalog` module) with
//!   put-if-absent publish semantics.
//! - An async job driver (`job` module) fanning out one task per
//!   (bucket, partition) unit and verifying publish completeness.
//!
//! Query execution over produced segments and cluster-level task
//! scheduling are out of scope; callers own invocation.
#![deny(missing_docs)]
pub mod aggregate;
pub mod catalog;
pub mod job;
pub mod job_spec;
pub mod layout;
pub mod packaging;
pub mod rows;
pub mod segment;
pub mod sharding;
pub mod sketch;
pub mod storage;

#[cfg(test)]
mod test_util;
