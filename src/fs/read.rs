use crate::device::BlockDevice;
use crate::fs::core::{FileHandle, FsError, Media};
use crate::fs::{seek, table};

/// Streams bytes from the current offset into `buf`, clamped to the file
/// size. Partial sectors go through the shared medium buffer; aligned
/// stretches are issued as one multi-sector transfer straight into the
/// caller's buffer, bounded by the next chain break.
pub(crate) async fn read<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &mut FileHandle,
    buf: &mut [u8],
) -> Result<usize, FsError<D::Error>> {
    if handle.offset >= handle.size {
        return Err(FsError::EndOfFile);
    }
    let mut remaining =
        core::cmp::min(buf.len() as u64, handle.size - handle.offset) as usize;
    if remaining == 0 {
        return Ok(0);
    }
    seek::ensure_position(media, dev, handle).await?;

    let sector_bytes = media.bytes_per_sector as usize;
    let mut copied = 0usize;

    while remaining > 0 {
        seek::advance_parked(media, dev, handle).await?;
        let pos = handle.pos.ok_or(FsError::FileCorrupt)?;
        let in_sector = pos.byte_in_sector as usize;

        if in_sector != 0 || remaining < sector_bytes {
            let chunk = core::cmp::min(remaining, sector_bytes - in_sector);
            table::load_sector(&mut media.cache, dev, pos.sector).await?;
            buf[copied..copied + chunk]
                .copy_from_slice(&media.cache.data[in_sector..in_sector + chunk]);
            seek::advance_bytes(media, dev, handle, chunk).await?;
            copied += chunk;
            remaining -= chunk;
            continue;
        }

        let want = (remaining / sector_bytes) as u32;
        let run = seek::contiguous_sector_run(media, dev, handle, want).await?;
        if run <= 1 {
            table::load_sector(&mut media.cache, dev, pos.sector).await?;
            buf[copied..copied + sector_bytes].copy_from_slice(&media.cache.data);
            seek::advance_bytes(media, dev, handle, sector_bytes).await?;
            copied += sector_bytes;
            remaining -= sector_bytes;
        } else {
            let bytes = run as usize * sector_bytes;
            dev.read_sectors(pos.sector, &mut buf[copied..copied + bytes])
                .await
                .map_err(FsError::Device)?;
            seek::advance_bytes(media, dev, handle, bytes).await?;
            copied += bytes;
            remaining -= bytes;
        }
    }

    handle.offset += copied as u64;
    handle.entry.accessed_date = ((media.clock)() >> 16) as u16;
    Ok(copied)
}
