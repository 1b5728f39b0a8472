use crate::device::BlockDevice;
use crate::fs::core::{ClusterId, FileHandle, FsError, Link, Media};
use crate::fs::{alloc, geometry, handles, seek, table};
use crate::journal::{ChainSplice, FaultLog};

fn invalidate_cached_range(media: &mut Media, lba: u32, count: u32) {
    if let Some(cached) = media.cache.lba {
        if cached >= lba && cached < lba.saturating_add(count) {
            media.cache.invalidate();
        }
    }
}

async fn raw_next<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
) -> Result<ClusterId, FsError<D::Error>> {
    match table::read_link(media, dev, cluster).await? {
        Link::Next(next) => Ok(next),
        _ => Err(FsError::FileCorrupt),
    }
}

/// Writes `data` starting `start_offset` bytes into `start` and onward along
/// raw chain links. Used for replacement runs that are not yet reachable
/// through the handle's cached coordinates.
async fn raw_stream<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    start: ClusterId,
    start_offset: u64,
    data: &[u8],
) -> Result<(), FsError<D::Error>> {
    let sector_bytes = media.bytes_per_sector as usize;
    let per_cluster = media.sectors_per_cluster as usize;
    let mut cluster = start;
    let mut in_cluster = start_offset as usize;
    let mut written = 0usize;

    while written < data.len() {
        let mut sector_index = in_cluster / sector_bytes;
        let mut byte = in_cluster % sector_bytes;

        while sector_index < per_cluster && written < data.len() {
            let lba = geometry::cluster_start_sector(media, cluster) + sector_index as u32;
            let remaining = data.len() - written;

            if byte == 0 && remaining >= sector_bytes {
                let full = core::cmp::min(remaining / sector_bytes, per_cluster - sector_index);
                let bytes = full * sector_bytes;
                dev.write_sectors(lba, &data[written..written + bytes])
                    .await
                    .map_err(FsError::Device)?;
                invalidate_cached_range(media, lba, full as u32);
                written += bytes;
                sector_index += full;
            } else {
                let chunk = core::cmp::min(remaining, sector_bytes - byte);
                table::load_sector(&mut media.cache, dev, lba).await?;
                media.cache.data[byte..byte + chunk]
                    .copy_from_slice(&data[written..written + chunk]);
                table::store_sector(&mut media.cache, dev, lba).await?;
                written += chunk;
                sector_index += 1;
                byte = 0;
            }
        }

        in_cluster = 0;
        if written < data.len() {
            cluster = raw_next(media, dev, cluster).await?;
        }
    }
    Ok(())
}

/// Writes `data` at the handle's cached position, advancing it. Partial
/// sectors read-modify-write through the shared buffer; aligned stretches go
/// out as contiguous multi-sector bursts, mirroring the read engine.
async fn stream_at_position<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &mut FileHandle,
    data: &[u8],
) -> Result<(), FsError<D::Error>> {
    seek::ensure_position(media, dev, handle).await?;
    let sector_bytes = media.bytes_per_sector as usize;
    let mut written = 0usize;

    while written < data.len() {
        seek::advance_parked(media, dev, handle).await?;
        let pos = handle.pos.ok_or(FsError::FileCorrupt)?;
        let in_sector = pos.byte_in_sector as usize;
        let remaining = data.len() - written;

        if in_sector != 0 || remaining < sector_bytes {
            let chunk = core::cmp::min(remaining, sector_bytes - in_sector);
            table::load_sector(&mut media.cache, dev, pos.sector).await?;
            media.cache.data[in_sector..in_sector + chunk]
                .copy_from_slice(&data[written..written + chunk]);
            table::store_sector(&mut media.cache, dev, pos.sector).await?;
            seek::advance_bytes(media, dev, handle, chunk).await?;
            written += chunk;
            continue;
        }

        let want = (remaining / sector_bytes) as u32;
        let run = seek::contiguous_sector_run(media, dev, handle, want).await?;
        if run <= 1 {
            media.cache.data.copy_from_slice(&data[written..written + sector_bytes]);
            table::store_sector(&mut media.cache, dev, pos.sector).await?;
            seek::advance_bytes(media, dev, handle, sector_bytes).await?;
            written += sector_bytes;
        } else {
            let bytes = run as usize * sector_bytes;
            dev.write_sectors(pos.sector, &data[written..written + bytes])
                .await
                .map_err(FsError::Device)?;
            invalidate_cached_range(media, pos.sector, run);
            seek::advance_bytes(media, dev, handle, bytes).await?;
            written += bytes;
        }
    }
    Ok(())
}

async fn copy_cluster_sectors<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    from: ClusterId,
    to: ClusterId,
    first_sector: u32,
    end_sector: u32,
) -> Result<(), FsError<D::Error>> {
    for sector in first_sector..end_sector {
        let src = geometry::cluster_start_sector(media, from) + sector;
        let dst = geometry::cluster_start_sector(media, to) + sector;
        table::load_sector(&mut media.cache, dev, src).await?;
        table::store_sector(&mut media.cache, dev, dst).await?;
    }
    Ok(())
}

/// Fault-tolerant replacement of the cluster range covered by an overwrite:
/// a detached run takes the old range's place, preserved sectors are copied
/// across, the splice is staged in the undo log, and only then is the live
/// chain relinked and caller data written. At any crash point either the old
/// or the new chain is whole.
async fn write_replace<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    data: &[u8],
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    let cluster_bytes = geometry::bytes_per_cluster(media);
    let sector_bytes = media.bytes_per_sector as u64;
    let offset = handle.offset;
    let end = offset + data.len() as u64;
    let overwrite_end = core::cmp::min(end, handle.size);

    alloc::ensure_chained(media, dev, handle).await?;

    let head_rel = (offset / cluster_bytes) as u32;
    let tail_rel = ((overwrite_end - 1) / cluster_bytes) as u32;
    let replaced = tail_rel - head_rel + 1;

    // Locate the affected run and its neighbors in the live chain.
    let first = handle.first.ok_or(FsError::FileCorrupt)?;
    let mut prev = None;
    let mut old_head = first;
    for _ in 0..head_rel {
        prev = Some(old_head);
        old_head = raw_next(media, dev, old_head).await?;
    }
    let mut old_tail = old_head;
    for _ in 1..replaced {
        old_tail = raw_next(media, dev, old_tail).await?;
    }
    let after_tail = table::read_link(media, dev, old_tail).await?;

    let outcome = alloc::scan_free_runs(media, dev, replaced).await?;
    let run = match outcome.exact {
        Some(start) => alloc::reserve_contiguous(media, dev, start, replaced, true).await?,
        None => alloc::reserve_scattered(media, dev, replaced).await?,
    };

    // Preserve the untouched leading sectors of the first affected cluster.
    let head_keep = offset - head_rel as u64 * cluster_bytes;
    if head_keep > 0 {
        let sectors = ((head_keep + sector_bytes - 1) / sector_bytes) as u32;
        copy_cluster_sectors(media, dev, old_head, run.head, 0, sectors).await?;
    }
    // And the trailing sectors of the last one, when file data continues
    // past the overwritten range.
    if overwrite_end < handle.size {
        let tail_base = tail_rel as u64 * cluster_bytes;
        let keep_from = overwrite_end - tail_base;
        let data_in_cluster = core::cmp::min(handle.size - tail_base, cluster_bytes);
        let first_sector = (keep_from / sector_bytes) as u32;
        let end_sector = ((data_in_cluster + sector_bytes - 1) / sector_bytes) as u32;
        let mut new_tail = run.head;
        for _ in 1..replaced {
            new_tail = raw_next(media, dev, new_tail).await?;
        }
        copy_cluster_sectors(media, dev, old_tail, new_tail, first_sector, end_sector).await?;
    }

    if media.fault_tolerant {
        journal
            .stage_chain_splice(ChainSplice {
                old_head: Some(old_head),
                old_tail: Some(old_tail),
                new_head: run.head,
                new_tail: run.tail,
            })
            .await
            .map_err(FsError::Device)?;
    }

    // Splice: relink the far side first (a mutation of the detached run),
    // then swing the live chain over in a single entry write.
    if let Link::Next(next) = after_tail {
        table::write_link(media, dev, run.tail, Link::Next(next)).await?;
    }
    match prev {
        Some(prev) => table::write_link(media, dev, prev, Link::Next(run.head)).await?,
        None => {
            handle.first = Some(run.head);
            handle.entry.first_cluster = run.head.raw();
        }
    }
    if after_tail == Link::EndOfChain {
        handle.last = Some(run.tail);
    }
    handle.consecutive = if head_rel == 0 {
        run.leading_consecutive
    } else {
        core::cmp::min(handle.consecutive, head_rel)
    };
    handle.pos = None;

    let start_in_cluster = offset - head_rel as u64 * cluster_bytes;
    raw_stream(media, dev, run.head, start_in_cluster, data).await?;

    alloc::release_run(media, dev, journal, old_head, replaced).await?;
    Ok(())
}

/// Write entry point: validates access, classifies the operation, extends
/// the chain on demand and dispatches to the in-place or replace-on-write
/// body.
pub(crate) async fn write<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    data: &[u8],
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    handles::require_writable(media, handle)?;
    if data.is_empty() {
        return Ok(());
    }

    let end = handle.offset + data.len() as u64;
    if end > geometry::max_file_bytes(media) {
        return Err(FsError::NoMoreSpace);
    }

    let sector_bytes = media.bytes_per_sector as u64;
    let overwriting = handle.offset < handle.size;
    let single_sector = overwriting
        && end <= handle.size
        && handle.offset / sector_bytes == (end - 1) / sector_bytes;
    let replace = media.fault_tolerant && overwriting && !single_sector;

    if end > handle.available {
        let cluster_bytes = geometry::bytes_per_cluster(media);
        let extra =
            geometry::clusters_for_bytes(end - handle.available, cluster_bytes) as u32;
        alloc::extend_clusters(media, dev, journal, handle, extra).await?;
    }

    if replace {
        write_replace(media, dev, journal, handle, data).await?;
        handle.offset = end;
    } else {
        stream_at_position(media, dev, handle, data).await?;
        handle.offset = end;
    }

    if end > handle.size {
        handle.size = end;
        handle.entry.size = end;
    }
    handle.entry.modified_stamp = (media.clock)();
    handle.modified = true;
    Ok(())
}
