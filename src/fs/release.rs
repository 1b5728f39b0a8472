use crate::device::BlockDevice;
use crate::fs::core::{ClusterId, FileHandle, FsError, Link, Media};
use crate::fs::{alloc, geometry, handles, table};
use crate::journal::FaultLog;

fn shrink_logical(media: &Media, handle: &mut FileHandle, new_size: u64) {
    handle.size = new_size;
    handle.entry.size = new_size;
    if handle.offset > new_size {
        handle.offset = new_size;
        handle.pos = None;
    }
    handle.entry.modified_stamp = (media.clock)();
    handle.modified = true;
}

/// Logical truncation: shrinks the file size without returning any clusters.
/// The freed capacity stays allocated to the file for later rewrites.
pub(crate) fn truncate<E>(
    media: &Media,
    handle: &mut FileHandle,
    new_size: u64,
) -> Result<(), FsError<E>> {
    handles::require_writable(media, handle)?;
    if new_size >= handle.size {
        return Ok(());
    }
    shrink_logical(media, handle, new_size);
    Ok(())
}

/// Truncation with release: returns every cluster past the rounded-up target
/// to the free pool, shrinking the logical size only when the target is
/// below it. A target between the size and the allocated capacity releases
/// slack clusters and leaves the size alone; at or past the capacity nothing
/// happens. Keeps the contiguous exFAT layout intact by trimming the run
/// from the tail when no chain exists.
pub(crate) async fn truncate_release<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    new_size: u64,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    handles::require_writable(media, handle)?;
    if new_size >= handle.available {
        return Ok(());
    }

    let cluster_bytes = geometry::bytes_per_cluster(media);
    let keep = geometry::clusters_for_bytes(new_size, cluster_bytes) as u32;
    if keep >= handle.cluster_count {
        if new_size < handle.size {
            shrink_logical(media, handle, new_size);
        }
        return Ok(());
    }
    let dropped = handle.cluster_count - keep;
    let first = handle.first.ok_or(FsError::FileCorrupt)?;

    if keep == 0 {
        if handle.contiguous {
            for index in 0..dropped {
                let cluster = first
                    .raw()
                    .checked_add(index)
                    .and_then(ClusterId::new)
                    .ok_or(FsError::FileCorrupt)?;
                if media.fault_tolerant {
                    journal.log_release(cluster).await.map_err(FsError::Device)?;
                }
                table::release_slot(media, dev, cluster).await?;
                media.available_clusters = media.available_clusters.saturating_add(1);
            }
        } else {
            alloc::release_run(media, dev, journal, first, dropped).await?;
        }
        handle.first = None;
        handle.last = None;
        handle.cluster_count = 0;
        handle.consecutive = 0;
        handle.available = 0;
        handle.contiguous = media.exfat;
        handle.entry.first_cluster = 0;
        handle.entry.allocated = 0;
        handle.entry.contiguous = handle.contiguous;
        handle.pos = None;
        if new_size < handle.size {
            shrink_logical(media, handle, new_size);
        } else {
            handle.entry.modified_stamp = (media.clock)();
            handle.modified = true;
        }
        return Ok(());
    }

    if handle.contiguous {
        // No chain exists; trim the occupancy run from its tail.
        for index in keep..handle.cluster_count {
            let cluster = first
                .raw()
                .checked_add(index)
                .and_then(ClusterId::new)
                .ok_or(FsError::FileCorrupt)?;
            if media.fault_tolerant {
                journal.log_release(cluster).await.map_err(FsError::Device)?;
            }
            table::release_slot(media, dev, cluster).await?;
            media.available_clusters = media.available_clusters.saturating_add(1);
        }
        let new_last = ClusterId::new(first.raw() + keep - 1)
            .ok_or(FsError::FileCorrupt)?;
        handle.last = Some(new_last);
        handle.cluster_count = keep;
        handle.consecutive = keep;
    } else {
        // Walk to the new tail, cut the chain there, then free the rest.
        let mut new_last = first;
        for _ in 1..keep {
            match table::read_link(media, dev, new_last).await? {
                Link::Next(next) => new_last = next,
                _ => return Err(FsError::FileCorrupt),
            }
        }
        let release_head = match table::read_link(media, dev, new_last).await? {
            Link::Next(next) => next,
            _ => return Err(FsError::FileCorrupt),
        };
        table::write_link(media, dev, new_last, Link::EndOfChain).await?;
        alloc::release_run(media, dev, journal, release_head, dropped).await?;
        handle.last = Some(new_last);
        handle.cluster_count = keep;
        handle.consecutive = core::cmp::min(handle.consecutive, keep);
    }

    handle.available = keep as u64 * cluster_bytes;
    handle.entry.allocated = handle.available;
    handle.pos = None;
    if new_size < handle.size {
        shrink_logical(media, handle, new_size);
    } else {
        handle.entry.modified_stamp = (media.clock)();
        handle.modified = true;
    }
    Ok(())
}
