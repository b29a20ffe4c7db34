pub mod blob;
pub mod document;
pub mod mutations;
pub mod store;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use document::{CardImport, UserDocument};
pub use store::{ListenerId, UserStateStore};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize user state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to watch user state: {0}")]
    Watch(#[from] notify::Error),
    #[error("User state has no backing file to watch")]
    NotWatchable,
}
