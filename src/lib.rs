//! Incremental sparse mirroring of remote Git repositories.
//!
//! Given a repository URL and a set of wildcard path patterns, a [`Mirror`]
//! keeps the matching files current in a local working tree while
//! transferring as little as possible: the upload-pack negotiation announces
//! every tree the cache already holds, fetches the new commit and trees with
//! blobs filtered out, walks them against the patterns, and then requests
//! only the blobs that are actually missing. The object set persists on disk
//! between runs.

pub mod cache;
pub mod config;
pub mod delta;
pub mod error;
pub mod hash;
pub mod inflate;
pub mod mirror;
pub mod object;
pub mod pack;
pub mod pkt;
pub mod protocol;
pub mod sparse;
pub mod transport;

pub use error::{Error, Result};
pub use mirror::{Mirror, PullReport};
