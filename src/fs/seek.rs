use crate::device::BlockDevice;
use crate::fs::core::{ClusterId, FileHandle, FsError, Link, Media, Position};
use crate::fs::{geometry, table};

/// Next cluster of a file's chain after `cluster` (relative index
/// `relative`), or `None` at the chain tail. Consecutive-prefix and
/// contiguous exFAT positions resolve arithmetically without touching the
/// table.
pub(crate) async fn successor<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &FileHandle,
    cluster: ClusterId,
    relative: u32,
) -> Result<Option<ClusterId>, FsError<D::Error>> {
    if relative + 1 >= handle.cluster_count {
        return Ok(None);
    }
    if handle.contiguous || relative + 1 < handle.consecutive {
        return Ok(Some(cluster.next_physical()));
    }
    match table::read_link(media, dev, cluster).await? {
        Link::Next(next) => Ok(Some(next)),
        Link::EndOfChain => Ok(None),
        Link::Free | Link::Defective => Err(FsError::FileCorrupt),
    }
}

/// Converts an absolute byte offset (already clamped) into a cached position.
/// Offsets exactly on a cluster boundary park at the end of the prior cluster
/// so an immediately following write lands before any unallocated successor.
pub(crate) async fn seek<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &mut FileHandle,
    target: u64,
) -> Result<u64, FsError<D::Error>> {
    let clamped = core::cmp::min(target, handle.size);
    let cluster_bytes = geometry::bytes_per_cluster(media);
    let sector_bytes = media.bytes_per_sector as u64;

    let first = match handle.first {
        Some(first) => first,
        None => {
            handle.offset = clamped;
            handle.pos = None;
            return Ok(clamped);
        }
    };

    let (rel_cluster, in_cluster) = if clamped > 0 && clamped % cluster_bytes == 0 {
        ((clamped / cluster_bytes - 1) as u32, cluster_bytes)
    } else {
        ((clamped / cluster_bytes) as u32, clamped % cluster_bytes)
    };

    if rel_cluster >= handle.cluster_count {
        return Err(FsError::FileCorrupt);
    }

    let physical = if handle.contiguous || rel_cluster < handle.consecutive {
        ClusterId::new(first.raw() + rel_cluster).ok_or(FsError::FileCorrupt)?
    } else {
        // Walk toward the target from the closest known anchor: start of file,
        // end of the consecutive prefix, or the cached position.
        let mut rel = 0u32;
        let mut cluster = first;
        if handle.consecutive > 0 {
            rel = handle.consecutive - 1;
            cluster = ClusterId::new(first.raw() + rel).ok_or(FsError::FileCorrupt)?;
        }
        if let Some(pos) = handle.pos {
            if pos.relative_cluster <= rel_cluster && pos.relative_cluster > rel {
                rel = pos.relative_cluster;
                cluster = pos.cluster;
            }
        }
        while rel < rel_cluster {
            match successor(media, dev, handle, cluster, rel).await? {
                Some(next) => {
                    cluster = next;
                    rel += 1;
                }
                // The chain ended before the cluster count implied by the
                // recorded sizes was reached.
                None => return Err(FsError::FileCorrupt),
            }
        }
        cluster
    };

    let (rel_sector, byte_in_sector) = if in_cluster == cluster_bytes {
        (media.sectors_per_cluster - 1, sector_bytes as u32)
    } else {
        (
            (in_cluster / sector_bytes) as u32,
            (in_cluster % sector_bytes) as u32,
        )
    };

    handle.pos = Some(Position {
        cluster: physical,
        relative_cluster: rel_cluster,
        relative_sector: rel_sector,
        sector: geometry::cluster_start_sector(media, physical) + rel_sector,
        byte_in_sector,
    });
    handle.offset = clamped;
    Ok(clamped)
}

/// Ensures the cached position matches the handle's byte offset, re-deriving
/// it when a refresh or chain mutation dropped it.
pub(crate) async fn ensure_position<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &mut FileHandle,
) -> Result<(), FsError<D::Error>> {
    if handle.pos.is_none() {
        let offset = handle.offset;
        seek(media, dev, handle, offset).await?;
    }
    Ok(())
}

/// Moves the cached position `bytes` forward. Exactly reaching a sector end
/// parks the cursor there; crossing it hops to the next sector or cluster,
/// which callers guarantee exists.
pub(crate) async fn advance_bytes<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &mut FileHandle,
    bytes: usize,
) -> Result<(), FsError<D::Error>> {
    let sector_bytes = media.bytes_per_sector;
    let mut left = bytes as u64;
    while left > 0 {
        advance_parked(media, dev, handle).await?;
        let mut pos = handle.pos.ok_or(FsError::FileCorrupt)?;
        let room = (sector_bytes - pos.byte_in_sector) as u64;
        let step = core::cmp::min(room, left);
        pos.byte_in_sector += step as u32;
        handle.pos = Some(pos);
        left -= step;
    }
    Ok(())
}

/// Length in sectors of the physically contiguous stretch starting at the
/// current (sector-aligned) position, capped at `want`. Bounded by the next
/// break in the chain.
pub(crate) async fn contiguous_sector_run<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &FileHandle,
    want: u32,
) -> Result<u32, FsError<D::Error>> {
    let Some(pos) = handle.pos else {
        return Ok(0);
    };
    let per_cluster = media.sectors_per_cluster;
    let mut run = core::cmp::min(per_cluster - pos.relative_sector, want);
    let mut cluster = pos.cluster;
    let mut relative = pos.relative_cluster;
    while run < want {
        match successor(media, dev, handle, cluster, relative).await? {
            Some(next) if next == cluster.next_physical() => {
                run += core::cmp::min(per_cluster, want - run);
                cluster = next;
                relative += 1;
            }
            _ => break,
        }
    }
    Ok(run)
}

/// Steps a position parked at a sector or cluster boundary forward onto the
/// first byte of the next sector. Callers guarantee a successor exists
/// (either within the file or freshly allocated).
pub(crate) async fn advance_parked<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &mut FileHandle,
) -> Result<(), FsError<D::Error>> {
    let Some(mut pos) = handle.pos else {
        return Ok(());
    };
    if pos.byte_in_sector < media.bytes_per_sector {
        return Ok(());
    }
    if pos.relative_sector + 1 < media.sectors_per_cluster {
        pos.relative_sector += 1;
        pos.sector += 1;
        pos.byte_in_sector = 0;
    } else {
        let next = successor(media, dev, handle, pos.cluster, pos.relative_cluster)
            .await?
            .ok_or(FsError::FileCorrupt)?;
        pos.cluster = next;
        pos.relative_cluster += 1;
        pos.relative_sector = 0;
        pos.sector = geometry::cluster_start_sector(media, next);
        pos.byte_in_sector = 0;
    }
    handle.pos = Some(pos);
    Ok(())
}
