//! Briefed: RSS/Atom feed ingestion and deduplication.
//!
//! The library holds the whole pipeline; the `briefed` binary only wires it
//! to a config file and a schedule.

pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
