//! `aci-cas`: a content-addressable store for immutable application
//! container images.
//!
//! A blob is named by a truncated SHA-512 digest of its uncompressed
//! bytes (`key`); blobs and their image manifests live in a
//! two-level-sharded directory fanout under a caller-supplied base
//! directory (`config`); a transactional SQLite index tracks which
//! blobs are known images and under what application names
//! (`index`); every read or write of shared state is guarded by
//! advisory `flock(2)` locks taken in a fixed order — store-wide,
//! then image key, then tree key — to stay safe across processes
//! without a central daemon (`lock`).
//!
//! On top of the store, a tree renderer (`tree`) expands a dependency
//! chain produced by an external `ImageRegistry` collaborator into a
//! real root filesystem on disk, via a hand-rolled tar extractor
//! (`archive`) that remaps owner ids and refuses path escapes.
//!
//! This crate does not do garbage collection, signature verification,
//! or any network fetching of images; `registry::SecondaryBlobSource`
//! and `registry::ImageRegistry` are the seams a caller wires up to
//! get those.

pub mod archive;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod index;
pub mod key;
pub mod lock;
pub mod manifest;
pub mod registry;
pub mod tree;

pub use archive::UidRange;
pub use blob_store::BlobStore;
pub use config::StorePaths;
pub use error::{CasError, Result};
pub use index::{AciInfo, MetadataIndex, RemoteInfo, SortField};
pub use manifest::{ImageManifest, Label};
pub use registry::{ImageRegistry, RenderedAci, SecondaryBlobSource};
pub use tree::TreeRenderer;
