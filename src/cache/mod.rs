//! # Cache Module
//!
//! Persistent download index for Groove Bot.
//!
//! Tracks which songs have already been downloaded to local storage so the
//! buffer manager never fetches the same audio twice. The index is a single
//! JSON file rewritten in full after every mutation: last-writer-wins
//! replacement means a crash can never leave a half-written record behind,
//! at the cost of write throughput (acceptable, since mutations are download
//! completions, a few per minute at most).
//!
//! Entries are validated lazily: a lookup re-checks that the backing audio
//! file still exists on disk and schedules the entry for removal when it
//! does not. There is no eviction policy; disk is cheap, downloads are not.

pub mod index;

pub use index::{CacheEntry, CacheIndex, CacheStats};
