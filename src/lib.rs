#![no_std]

#[cfg(test)]
extern crate std;

pub mod api;
pub mod device;
pub mod fs;
pub mod journal;

pub use api::FileSystem;
pub use device::{BlockDevice, SECTOR_SIZE};
pub use fs::core::{
    ClusterId, DirEntry, FileHandle, FileKey, FsError, Media, MediaConfig, OpenMode, WriteNotify,
};
pub use fs::handles::DirectoryOps;
pub use journal::{ChainSplice, FaultLog, NoJournal};

pub const MAX_OPEN_FILES: usize = 8;
