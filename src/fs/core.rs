use heapless::Vec;

use crate::device::SECTOR_SIZE;
use crate::journal::TxPhase;
use crate::MAX_OPEN_FILES;

pub const FIRST_DATA_CLUSTER: u32 = 2;

#[derive(Debug, PartialEq, Eq)]
pub enum FsError<E> {
    Device(E),
    NotOpen,
    AccessError,
    WriteProtect,
    MediaInvalid,
    NoMoreSpace,
    FileCorrupt,
    EndOfFile,
    InvalidCluster(u32),
    TooManyOpenFiles,
}

/// A valid data-cluster number. Cluster numbering starts at 2; the values
/// 0 and 1 never name a cluster and act as on-disk "no cluster" sentinels,
/// which this type makes unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClusterId(u32);

impl ClusterId {
    pub fn new(raw: u32) -> Option<Self> {
        if raw >= FIRST_DATA_CLUSTER {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Zero-based index into the data area / chain table slots.
    pub fn index(self) -> u32 {
        self.0 - FIRST_DATA_CLUSTER
    }

    pub fn next_physical(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Decoded chain-table entry for one cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    Free,
    Next(ClusterId),
    EndOfChain,
    Defective,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Identity of an on-disk file: where its directory entry lives. Two handles
/// with the same key alias the same file and share one authoritative record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileKey {
    pub sector: u32,
    pub slot: u8,
}

/// Numeric directory-entry fields this engine keeps in sync. The byte layout
/// of the on-disk entry is owned by the directory component; it receives this
/// struct through `DirectoryOps::write_entry`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirEntry {
    /// First data cluster, 0 when the file owns no clusters.
    pub first_cluster: u32,
    pub size: u64,
    /// Allocated byte count; meaningful for contiguous exFAT files, where the
    /// chain table holds no entries to derive it from. 0 means "derive".
    pub allocated: u64,
    pub attributes: u8,
    /// exFAT "no chain needed" bit: the file's clusters are one unbroken run.
    pub contiguous: bool,
    /// Packed FAT modification date/time words.
    pub modified_stamp: u32,
    pub accessed_date: u16,
}

pub type WriteNotify = fn(FileKey, u64);

#[derive(Clone, Copy)]
pub struct MediaConfig {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_clusters: u32,
    pub available_clusters: u32,
    pub table_start_sector: u32,
    pub table_sectors: u32,
    pub table_copies: u8,
    pub bitmap_start_sector: u32,
    pub data_start_sector: u32,
    pub exfat: bool,
    pub write_protect: bool,
    pub fault_tolerant: bool,
}

pub(crate) struct SectorCache {
    pub lba: Option<u32>,
    pub data: [u8; SECTOR_SIZE],
}

impl SectorCache {
    fn new() -> Self {
        Self {
            lba: None,
            data: [0; SECTOR_SIZE],
        }
    }

    pub fn invalidate(&mut self) {
        self.lba = None;
    }
}

/// Authoritative per-file record shared by all handles opened on one on-disk
/// file. Handles cache a copy and refresh it when the generation moves.
#[derive(Clone, Copy)]
pub(crate) struct SharedFileState {
    pub key: FileKey,
    pub open_count: u8,
    pub generation: u32,
    pub size: u64,
    pub available: u64,
    pub first: Option<ClusterId>,
    pub last: Option<ClusterId>,
    pub cluster_count: u32,
    pub consecutive: u32,
    pub contiguous: bool,
    pub entry: DirEntry,
}

/// One mounted medium: geometry, allocator state, the open-file registry and
/// the shared sector buffer. All mutation happens under the medium's critical
/// section in `api`.
pub struct Media {
    pub(crate) bytes_per_sector: u32,
    pub(crate) sectors_per_cluster: u32,
    pub(crate) total_clusters: u32,
    pub(crate) available_clusters: u32,
    pub(crate) table_start_sector: u32,
    pub(crate) table_sectors: u32,
    pub(crate) table_copies: u8,
    pub(crate) bitmap_start_sector: u32,
    pub(crate) data_start_sector: u32,
    pub(crate) exfat: bool,
    pub(crate) write_protect: bool,
    pub(crate) fault_tolerant: bool,
    /// Rotating free-space search cursor: next cluster number to try.
    pub(crate) search_cursor: u32,
    pub(crate) tx_phase: TxPhase,
    pub(crate) files: Vec<SharedFileState, MAX_OPEN_FILES>,
    pub(crate) cache: SectorCache,
    pub(crate) write_notify: Option<WriteNotify>,
    pub(crate) clock: fn() -> u32,
}

fn zero_clock() -> u32 {
    0
}

impl Media {
    pub fn new(config: MediaConfig) -> Self {
        Self {
            bytes_per_sector: config.bytes_per_sector,
            sectors_per_cluster: config.sectors_per_cluster,
            total_clusters: config.total_clusters,
            available_clusters: config.available_clusters,
            table_start_sector: config.table_start_sector,
            table_sectors: config.table_sectors,
            table_copies: config.table_copies,
            bitmap_start_sector: config.bitmap_start_sector,
            data_start_sector: config.data_start_sector,
            exfat: config.exfat,
            write_protect: config.write_protect,
            fault_tolerant: config.fault_tolerant,
            search_cursor: FIRST_DATA_CLUSTER,
            tx_phase: TxPhase::Idle,
            files: Vec::new(),
            cache: SectorCache::new(),
            write_notify: None,
            clock: zero_clock,
        }
    }

    pub fn set_clock(&mut self, clock: fn() -> u32) {
        self.clock = clock;
    }

    pub fn available_clusters(&self) -> u32 {
        self.available_clusters
    }

    pub fn is_exfat(&self) -> bool {
        self.exfat
    }
}

/// Cached byte position within a file. `byte_in_sector` may equal the sector
/// size when the cursor is parked at the end of a sector or cluster; engines
/// normalize before transferring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Position {
    pub cluster: ClusterId,
    pub relative_cluster: u32,
    pub relative_sector: u32,
    pub sector: u32,
    pub byte_in_sector: u32,
}

/// In-memory open-file state: mode, cached sizes and chain coordinates, and
/// the directory-entry copy. Invalid once closed.
pub struct FileHandle {
    pub(crate) key: FileKey,
    pub(crate) mode: OpenMode,
    pub(crate) open: bool,
    pub(crate) generation: u32,
    pub(crate) size: u64,
    pub(crate) available: u64,
    pub(crate) offset: u64,
    pub(crate) pos: Option<Position>,
    pub(crate) first: Option<ClusterId>,
    pub(crate) last: Option<ClusterId>,
    pub(crate) cluster_count: u32,
    /// Leading physically-consecutive clusters, for O(1) position math.
    pub(crate) consecutive: u32,
    pub(crate) contiguous: bool,
    pub(crate) modified: bool,
    pub(crate) entry: DirEntry,
}

impl FileHandle {
    pub fn key(&self) -> FileKey {
        self.key
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn available_size(&self) -> u64 {
        self.available
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn first_cluster(&self) -> Option<ClusterId> {
        self.first
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn dir_entry(&self) -> DirEntry {
        self.entry
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified = false;
    }

    /// Forces the next `refresh` to restore this handle from the shared
    /// record, discarding any half-applied local state.
    pub(crate) fn mark_stale(&mut self) {
        self.generation = self.generation.wrapping_sub(1);
        self.pos = None;
    }
}
