use crate::device::SECTOR_SIZE;
use crate::fs::core::{ClusterId, FsError, Media};

pub(crate) fn check<E>(media: &Media) -> Result<(), FsError<E>> {
    if media.bytes_per_sector != SECTOR_SIZE as u32
        || media.sectors_per_cluster == 0
        || media.total_clusters == 0
    {
        return Err(FsError::MediaInvalid);
    }
    Ok(())
}

pub(crate) fn bytes_per_cluster(media: &Media) -> u64 {
    media.bytes_per_sector as u64 * media.sectors_per_cluster as u64
}

/// First absolute sector of a data cluster.
pub(crate) fn cluster_start_sector(media: &Media, cluster: ClusterId) -> u32 {
    media
        .data_start_sector
        .saturating_add(cluster.index().saturating_mul(media.sectors_per_cluster))
}

/// Sector and in-sector byte offset of a cluster's 32-bit chain-table entry,
/// in the given mirror copy of the table.
pub(crate) fn chain_entry_location(media: &Media, cluster: ClusterId, copy: u8) -> (u32, usize) {
    let byte_offset = cluster.raw() as u64 * 4;
    let sector = (byte_offset / media.bytes_per_sector as u64) as u32;
    let offset = (byte_offset % media.bytes_per_sector as u64) as usize;
    let base = media
        .table_start_sector
        .saturating_add((copy as u32).saturating_mul(media.table_sectors));
    (base.saturating_add(sector), offset)
}

/// Sector, byte and bit of a cluster's occupancy bit in the exFAT bitmap.
pub(crate) fn bitmap_location(media: &Media, cluster: ClusterId) -> (u32, usize, u8) {
    let index = cluster.index() as u64;
    let sector = (index / (media.bytes_per_sector as u64 * 8)) as u32;
    let bit_in_sector = (index % (media.bytes_per_sector as u64 * 8)) as usize;
    (
        media.bitmap_start_sector.saturating_add(sector),
        bit_in_sector / 8,
        (bit_in_sector % 8) as u8,
    )
}

pub(crate) fn clusters_for_bytes(bytes: u64, cluster_bytes: u64) -> u64 {
    if bytes == 0 {
        0
    } else {
        (bytes + cluster_bytes - 1) / cluster_bytes
    }
}

/// Largest representable file size: the directory size field is 32-bit on
/// classic volumes, 64-bit on exFAT.
pub(crate) fn max_file_bytes(media: &Media) -> u64 {
    if media.exfat {
        u64::MAX
    } else {
        u32::MAX as u64
    }
}

/// Highest valid cluster number on this medium.
pub(crate) fn max_cluster(media: &Media) -> u32 {
    media.total_clusters.saturating_add(1)
}
