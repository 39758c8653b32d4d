//! A file relay over a package registry.
//!
//! Files are published as a set of immutable registry artifacts and retrieved by a short 4-digit transfer code:
//! - a file is split into fixed-size chunks, each hashed and pushed as its own artifact;
//! - a coordinator artifact describes the file and lists its chunks;
//! - the receiver resolves the coordinator from the code, fetches and verifies chunks with bounded concurrency and
//!   reassembles the file in a local storage;
//! - codes that cannot be resolved yet are retried in the background by a [`Scheduler`](sync::Scheduler).
//!
//! The registry is treated as an append-only, eventually consistent store behind the [`Registry`](registry::Registry)
//! trait. Artifact identities are a pure function of the transfer code, the publish date and the chunk index, so that
//! the receiving side never needs any registry listing:
//!
//! ```text
//!     - registry
//!       L relay-core-part@2024.03.09-4821
//!         L package.json
//!         L index.json            file metadata + chunk manifest
//!       L relay-core-part-sub@2024.03.09-4821.0000
//!         L package.json
//!         L chunk.bin             chunk #0 bytes
//!       L relay-core-part-sub@2024.03.09-4821.0001
//!         L ...
//! ```
//!
//! Transient registry failures are retried with an exponential backoff, pushes can optionally be confirmed visible by
//! bounded polling, and every chunk is checked against its manifest digest before reassembly.

mod error;
pub use error::*;

pub mod artifact;
pub mod chunk;
pub mod config;
pub mod download;
pub mod ident;
pub mod publish;
pub mod registry;
pub mod retry;
pub mod store;
pub mod sync;

pub use config::Settings;
pub use ident::{ArtifactId, TransferCode};
