//! seqindex - sketch-to-subsequence search over time series
//!
//! A hand-drawn shape is normalized into a fixed-length vector and matched
//! against every window of a series corpus:
//! - [`normalize`] turns raw samples or a drawn path into that vector
//! - [`builder`] indexes every gap-free window of a [`corpus`]
//! - [`index`] stores vectors (Parquet segments + WAL) and answers exact top-k queries
//! - [`query`] runs global or per-name top-k with retry and optional DTW re-ranking
//! - [`aggregate`], [`filter`] and [`session`] turn matches into what a UI shows

pub mod aggregate;
pub mod builder;
pub mod config;
pub mod corpus;
pub mod error;
pub mod filter;
pub mod index;
pub mod manifest;
pub mod normalize;
pub mod query;
pub mod segment;
pub mod session;
pub mod storage;
pub mod types;
pub mod wal;

pub use error::{Error, Result};
