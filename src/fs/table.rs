use crate::device::BlockDevice;
use crate::fs::core::{ClusterId, FsError, Link, Media, SectorCache};
use crate::fs::geometry;

const FAT32_MASK: u32 = 0x0FFF_FFFF;
const FAT32_EOC_MIN: u32 = 0x0FFF_FFF8;
const FAT32_EOC_WRITE: u32 = 0x0FFF_FFFF;
const FAT32_DEFECTIVE: u32 = 0x0FFF_FFF7;
const EXFAT_EOC_MIN: u32 = 0xFFFF_FFF8;
const EXFAT_EOC_WRITE: u32 = 0xFFFF_FFFF;
const EXFAT_DEFECTIVE: u32 = 0xFFFF_FFF7;

pub(crate) fn decode_link(raw: u32, exfat: bool, max_cluster: u32) -> Option<Link> {
    let (value, eoc_min, defective) = if exfat {
        (raw, EXFAT_EOC_MIN, EXFAT_DEFECTIVE)
    } else {
        (raw & FAT32_MASK, FAT32_EOC_MIN, FAT32_DEFECTIVE)
    };
    if value == 0 {
        return Some(Link::Free);
    }
    if value == defective {
        return Some(Link::Defective);
    }
    if value >= eoc_min {
        return Some(Link::EndOfChain);
    }
    let next = ClusterId::new(value)?;
    if next.raw() > max_cluster {
        return None;
    }
    Some(Link::Next(next))
}

pub(crate) fn encode_link(link: Link, exfat: bool) -> u32 {
    match link {
        Link::Free => 0,
        Link::Next(cluster) => cluster.raw(),
        Link::EndOfChain => {
            if exfat {
                EXFAT_EOC_WRITE
            } else {
                FAT32_EOC_WRITE
            }
        }
        Link::Defective => {
            if exfat {
                EXFAT_DEFECTIVE
            } else {
                FAT32_DEFECTIVE
            }
        }
    }
}

pub(crate) async fn load_sector<D: BlockDevice>(
    cache: &mut SectorCache,
    dev: &mut D,
    lba: u32,
) -> Result<(), FsError<D::Error>> {
    if cache.lba == Some(lba) {
        return Ok(());
    }
    cache.lba = None;
    dev.read_sectors(lba, &mut cache.data)
        .await
        .map_err(FsError::Device)?;
    cache.lba = Some(lba);
    Ok(())
}

pub(crate) async fn store_sector<D: BlockDevice>(
    cache: &mut SectorCache,
    dev: &mut D,
    lba: u32,
) -> Result<(), FsError<D::Error>> {
    dev.write_sectors(lba, &cache.data)
        .await
        .map_err(FsError::Device)?;
    cache.lba = Some(lba);
    Ok(())
}

/// Reads one cluster's successor entry from the chain table.
pub(crate) async fn read_link<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
) -> Result<Link, FsError<D::Error>> {
    if cluster.raw() > geometry::max_cluster(media) {
        return Err(FsError::InvalidCluster(cluster.raw()));
    }
    let (lba, offset) = geometry::chain_entry_location(media, cluster, 0);
    load_sector(&mut media.cache, dev, lba).await?;
    let raw = u32::from_le_bytes([
        media.cache.data[offset],
        media.cache.data[offset + 1],
        media.cache.data[offset + 2],
        media.cache.data[offset + 3],
    ]);
    decode_link(raw, media.exfat, geometry::max_cluster(media))
        .ok_or(FsError::InvalidCluster(raw))
}

/// Writes one cluster's successor entry, mirrored across every table copy.
/// The reserved top nibble of classic entries is preserved.
pub(crate) async fn write_link<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
    link: Link,
) -> Result<(), FsError<D::Error>> {
    if cluster.raw() > geometry::max_cluster(media) {
        return Err(FsError::InvalidCluster(cluster.raw()));
    }
    let value = encode_link(link, media.exfat);
    let (lba, offset) = geometry::chain_entry_location(media, cluster, 0);
    load_sector(&mut media.cache, dev, lba).await?;
    let old = u32::from_le_bytes([
        media.cache.data[offset],
        media.cache.data[offset + 1],
        media.cache.data[offset + 2],
        media.cache.data[offset + 3],
    ]);
    let new = if media.exfat {
        value
    } else {
        (old & !FAT32_MASK) | (value & FAT32_MASK)
    };
    media.cache.data[offset..offset + 4].copy_from_slice(&new.to_le_bytes());

    for copy in 0..media.table_copies {
        let (copy_lba, _) = geometry::chain_entry_location(media, cluster, copy);
        dev.write_sectors(copy_lba, &media.cache.data)
            .await
            .map_err(FsError::Device)?;
    }
    media.cache.lba = Some(lba);
    Ok(())
}

/// exFAT bitmap: true when the cluster is occupied.
pub(crate) async fn cluster_state<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
) -> Result<bool, FsError<D::Error>> {
    let (lba, byte, bit) = geometry::bitmap_location(media, cluster);
    load_sector(&mut media.cache, dev, lba).await?;
    Ok(media.cache.data[byte] & (1 << bit) != 0)
}

pub(crate) async fn set_cluster_state<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
    occupied: bool,
) -> Result<(), FsError<D::Error>> {
    let (lba, byte, bit) = geometry::bitmap_location(media, cluster);
    load_sector(&mut media.cache, dev, lba).await?;
    if occupied {
        media.cache.data[byte] |= 1 << bit;
    } else {
        media.cache.data[byte] &= !(1 << bit);
    }
    store_sector(&mut media.cache, dev, lba).await
}

/// Free test in whichever allocation scheme the medium uses: the bitmap bit
/// on exFAT, a zero chain entry on classic volumes.
pub(crate) async fn slot_free<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
) -> Result<bool, FsError<D::Error>> {
    if media.exfat {
        Ok(!cluster_state(media, dev, cluster).await?)
    } else {
        Ok(read_link(media, dev, cluster).await? == Link::Free)
    }
}

/// Claims one cluster: occupancy bit on exFAT, chain entry on classic media.
/// exFAT callers write the chain entry separately only when the owning file
/// actually needs a chain.
pub(crate) async fn claim_slot<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
) -> Result<(), FsError<D::Error>> {
    if media.exfat {
        set_cluster_state(media, dev, cluster, true).await
    } else {
        write_link(media, dev, cluster, Link::EndOfChain).await
    }
}

/// Returns one cluster to the free pool.
pub(crate) async fn release_slot<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    cluster: ClusterId,
) -> Result<(), FsError<D::Error>> {
    if media.exfat {
        set_cluster_state(media, dev, cluster, false).await?;
    }
    write_link(media, dev, cluster, Link::Free).await
}
