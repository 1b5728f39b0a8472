use crate::device::BlockDevice;
use crate::fs::core::{
    ClusterId, DirEntry, FileHandle, FileKey, FsError, Link, Media, OpenMode, SharedFileState,
};
use crate::fs::{geometry, table};

/// Directory-component contract: persists the numeric fields of a directory
/// entry. The on-disk byte layout belongs to the directory component.
#[allow(async_fn_in_trait)]
pub trait DirectoryOps<E> {
    async fn write_entry(&mut self, key: FileKey, entry: &DirEntry) -> Result<(), E>;
}

pub(crate) fn find_record(media: &Media, key: FileKey) -> Option<usize> {
    media.files.iter().position(|record| record.key == key)
}

pub(crate) fn require_open<E>(media: &Media, handle: &FileHandle) -> Result<usize, FsError<E>> {
    if !handle.open {
        return Err(FsError::NotOpen);
    }
    find_record(media, handle.key).ok_or(FsError::NotOpen)
}

pub(crate) fn require_writable<E>(
    media: &Media,
    handle: &FileHandle,
) -> Result<(), FsError<E>> {
    if handle.mode != OpenMode::ReadWrite {
        return Err(FsError::AccessError);
    }
    if media.write_protect {
        return Err(FsError::WriteProtect);
    }
    Ok(())
}

/// Pulls the authoritative record into a stale handle: sizes, chain
/// coordinates and the directory-entry copy. The byte offset is clamped to
/// the (possibly shrunken) file size and the cached position dropped so the
/// next transfer re-derives it with a fresh chain walk.
pub(crate) fn refresh<E>(media: &Media, handle: &mut FileHandle) -> Result<(), FsError<E>> {
    let idx = require_open(media, handle)?;
    let record = &media.files[idx];
    if record.generation == handle.generation {
        return Ok(());
    }
    handle.size = record.size;
    handle.available = record.available;
    handle.first = record.first;
    handle.last = record.last;
    handle.cluster_count = record.cluster_count;
    handle.consecutive = record.consecutive;
    handle.contiguous = record.contiguous;
    handle.entry = record.entry;
    handle.generation = record.generation;
    if handle.offset > handle.size {
        handle.offset = handle.size;
    }
    handle.pos = None;
    Ok(())
}

/// Pushes a handle's mutated state back to the authoritative record and bumps
/// the generation so every aliasing handle refreshes on its next operation.
pub(crate) fn publish(media: &mut Media, handle: &mut FileHandle) {
    if let Some(idx) = find_record(media, handle.key) {
        let record = &mut media.files[idx];
        record.size = handle.size;
        record.available = handle.available;
        record.first = handle.first;
        record.last = handle.last;
        record.cluster_count = handle.cluster_count;
        record.consecutive = handle.consecutive;
        record.contiguous = handle.contiguous;
        record.entry = handle.entry;
        record.generation = record.generation.wrapping_add(1);
        handle.generation = record.generation;
    }
}

struct ChainSummary {
    last: Option<ClusterId>,
    count: u32,
    consecutive: u32,
}

async fn walk_whole_chain<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    first: ClusterId,
) -> Result<ChainSummary, FsError<D::Error>> {
    let mut cluster = first;
    let mut count = 1u32;
    let mut consecutive = 1u32;
    let mut prefix_unbroken = true;

    loop {
        if count > media.total_clusters.saturating_add(2) {
            return Err(FsError::FileCorrupt);
        }
        match table::read_link(media, dev, cluster).await? {
            Link::Next(next) => {
                if prefix_unbroken && next == cluster.next_physical() {
                    consecutive += 1;
                } else {
                    prefix_unbroken = false;
                }
                cluster = next;
                count += 1;
            }
            Link::EndOfChain => {
                return Ok(ChainSummary {
                    last: Some(cluster),
                    count,
                    consecutive,
                })
            }
            // A free or defective entry inside a live chain means the table
            // disagrees with the directory entry.
            Link::Free | Link::Defective => return Err(FsError::FileCorrupt),
        }
    }
}

/// Builds the authoritative record for a file the first time a handle opens
/// it: walks the chain once to learn cluster count, tail and the leading
/// consecutive run. Contiguous exFAT files are derived arithmetically from
/// the allocated size; no chain exists for them.
async fn derive_record<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    key: FileKey,
    entry: DirEntry,
) -> Result<SharedFileState, FsError<D::Error>> {
    let cluster_bytes = geometry::bytes_per_cluster(media);
    let first = ClusterId::new(entry.first_cluster);

    let (last, count, consecutive, contiguous) = match first {
        None => (None, 0, 0, media.exfat),
        Some(first) if media.exfat && entry.contiguous => {
            let bytes = if entry.allocated > entry.size {
                entry.allocated
            } else {
                entry.size
            };
            let count = geometry::clusters_for_bytes(bytes, cluster_bytes) as u32;
            if count == 0 {
                return Err(FsError::FileCorrupt);
            }
            let last = ClusterId::new(first.raw() + count - 1).ok_or(FsError::FileCorrupt)?;
            (Some(last), count, count, true)
        }
        Some(first) => {
            let summary = walk_whole_chain(media, dev, first).await?;
            (summary.last, summary.count, summary.consecutive, false)
        }
    };

    let available = count as u64 * cluster_bytes;
    if entry.size > available {
        return Err(FsError::FileCorrupt);
    }

    Ok(SharedFileState {
        key,
        open_count: 0,
        generation: 1,
        size: entry.size,
        available,
        first,
        last,
        cluster_count: count,
        consecutive,
        contiguous,
        entry,
    })
}

pub(crate) async fn open_file<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    key: FileKey,
    entry: DirEntry,
    mode: OpenMode,
) -> Result<FileHandle, FsError<D::Error>> {
    let idx = match find_record(media, key) {
        Some(idx) => idx,
        None => {
            let record = derive_record(media, dev, key, entry).await?;
            media
                .files
                .push(record)
                .map_err(|_| FsError::TooManyOpenFiles)?;
            media.files.len() - 1
        }
    };

    let record = &mut media.files[idx];
    record.open_count = record
        .open_count
        .checked_add(1)
        .ok_or(FsError::TooManyOpenFiles)?;

    Ok(FileHandle {
        key,
        mode,
        open: true,
        generation: record.generation,
        size: record.size,
        available: record.available,
        offset: 0,
        pos: None,
        first: record.first,
        last: record.last,
        cluster_count: record.cluster_count,
        consecutive: record.consecutive,
        contiguous: record.contiguous,
        modified: false,
        entry: record.entry,
    })
}

pub(crate) async fn close_file<D, S>(
    media: &mut Media,
    dirs: &mut S,
    handle: &mut FileHandle,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    S: DirectoryOps<D::Error>,
{
    let idx = require_open::<D::Error>(media, handle)?;

    if handle.modified {
        let entry = media.files[idx].entry;
        dirs.write_entry(handle.key, &entry)
            .await
            .map_err(FsError::Device)?;
        handle.modified = false;
    }

    let record = &mut media.files[idx];
    record.open_count = record.open_count.saturating_sub(1);
    if record.open_count == 0 {
        media.files.swap_remove(idx);
    }
    handle.open = false;
    Ok(())
}

/// Persists the handle's directory-entry copy through the directory
/// component after a mutating operation.
pub(crate) async fn sync_entry<D, S>(
    dirs: &mut S,
    handle: &mut FileHandle,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    S: DirectoryOps<D::Error>,
{
    dirs.write_entry(handle.key, &handle.entry)
        .await
        .map_err(FsError::Device)?;
    Ok(())
}
