//! Storage layer of a desktop photo catalog.
//!
//! - [`db`]: the metadata repository over interchangeable backends, and the
//!   migration engine that moves a catalog from one backend to another.
//! - [`thumbnails`]: a persistent, size-bounded thumbnail cache.
//! - [`tasks`]: async wrappers so UI code never blocks on either.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod tasks;
pub mod thumbnails;

pub use db::{BackendDescriptor, BackendKind, FileRecord, Repository, RepositoryOptions, SearchCriteria};
pub use error::{StoreError, StoreResult};
pub use thumbnails::{CacheWrite, Fingerprint, Thumbnail, ThumbnailCache};
