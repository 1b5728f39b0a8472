use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

use embassy_futures::block_on;

use crate::api::FileSystem;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::fs::core::{
    ClusterId, DirEntry, FileHandle, FileKey, FsError, Link, Media, MediaConfig, OpenMode,
};
use crate::fs::handles::DirectoryOps;
use crate::fs::{alloc, handles, read, release, seek, table, write};
use crate::journal::{self, ChainSplice, FaultLog, NoJournal};

#[derive(Debug, PartialEq, Eq)]
struct DiskError;

struct RamDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
    fail_after_writes: Option<u32>,
    writes: u32,
}

impl RamDisk {
    fn new(count: usize) -> Self {
        Self {
            sectors: vec![[0u8; SECTOR_SIZE]; count],
            fail_after_writes: None,
            writes: 0,
        }
    }
}

impl BlockDevice for RamDisk {
    type Error = DiskError;

    async fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), DiskError> {
        for (index, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let sector = self.sectors.get(lba as usize + index).ok_or(DiskError)?;
            chunk.copy_from_slice(sector);
        }
        Ok(())
    }

    async fn write_sectors(&mut self, lba: u32, buf: &[u8]) -> Result<(), DiskError> {
        for (index, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            if let Some(limit) = self.fail_after_writes {
                if self.writes >= limit {
                    return Err(DiskError);
                }
            }
            let sector = self.sectors.get_mut(lba as usize + index).ok_or(DiskError)?;
            sector.copy_from_slice(chunk);
            self.writes += 1;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DiskError> {
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum JournalEvent {
    Start,
    End,
    Fail,
    Splice(ChainSplice),
    Release(ClusterId),
}

#[derive(Clone)]
struct RecordingJournal {
    events: Rc<RefCell<Vec<JournalEvent>>>,
}

impl RecordingJournal {
    fn new() -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl FaultLog<DiskError> for RecordingJournal {
    async fn transaction_start(&mut self) -> Result<(), DiskError> {
        self.events.borrow_mut().push(JournalEvent::Start);
        Ok(())
    }

    async fn transaction_end(&mut self) -> Result<(), DiskError> {
        self.events.borrow_mut().push(JournalEvent::End);
        Ok(())
    }

    async fn transaction_fail(&mut self) -> Result<(), DiskError> {
        self.events.borrow_mut().push(JournalEvent::Fail);
        Ok(())
    }

    async fn stage_chain_splice(&mut self, splice: ChainSplice) -> Result<(), DiskError> {
        self.events.borrow_mut().push(JournalEvent::Splice(splice));
        Ok(())
    }

    async fn log_release(&mut self, cluster: ClusterId) -> Result<(), DiskError> {
        self.events.borrow_mut().push(JournalEvent::Release(cluster));
        Ok(())
    }

    fn enabled(&self) -> bool {
        true
    }
}

#[derive(Clone)]
struct MockDirectory {
    entries: Rc<RefCell<Vec<(FileKey, DirEntry)>>>,
    fail: Rc<RefCell<bool>>,
}

impl MockDirectory {
    fn new() -> Self {
        Self {
            entries: Rc::new(RefCell::new(Vec::new())),
            fail: Rc::new(RefCell::new(false)),
        }
    }
}

impl DirectoryOps<DiskError> for MockDirectory {
    async fn write_entry(&mut self, key: FileKey, entry: &DirEntry) -> Result<(), DiskError> {
        if *self.fail.borrow() {
            return Err(DiskError);
        }
        self.entries.borrow_mut().push((key, *entry));
        Ok(())
    }
}

const TOTAL_CLUSTERS: u32 = 64;

fn config(sectors_per_cluster: u32, exfat: bool, fault_tolerant: bool) -> MediaConfig {
    MediaConfig {
        bytes_per_sector: SECTOR_SIZE as u32,
        sectors_per_cluster,
        total_clusters: TOTAL_CLUSTERS,
        available_clusters: TOTAL_CLUSTERS,
        table_start_sector: 1,
        table_sectors: 1,
        table_copies: 1,
        bitmap_start_sector: 2,
        data_start_sector: 3,
        exfat,
        write_protect: false,
        fault_tolerant,
    }
}

fn fixture(sectors_per_cluster: u32, exfat: bool, fault_tolerant: bool) -> (Media, RamDisk) {
    let media = Media::new(config(sectors_per_cluster, exfat, fault_tolerant));
    let disk = RamDisk::new(3 + (TOTAL_CLUSTERS * sectors_per_cluster) as usize);
    (media, disk)
}

fn key(slot: u8) -> FileKey {
    FileKey { sector: 40, slot }
}

fn cluster(raw: u32) -> ClusterId {
    ClusterId::new(raw).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

async fn open_rw(media: &mut Media, disk: &mut RamDisk) -> FileHandle {
    handles::open_file(media, disk, key(0), DirEntry::default(), OpenMode::ReadWrite)
        .await
        .unwrap()
}

async fn link_of(media: &mut Media, disk: &mut RamDisk, raw: u32) -> Link {
    table::read_link(media, disk, cluster(raw)).await.unwrap()
}

/// Claims every odd-numbered cluster so no free run longer than one exists.
async fn fragment_free_space(media: &mut Media, disk: &mut RamDisk) {
    for raw in 2..=TOTAL_CLUSTERS + 1 {
        if raw % 2 == 1 {
            table::claim_slot(media, disk, cluster(raw)).await.unwrap();
            media.available_clusters -= 1;
        }
    }
}

#[test]
fn link_codec_preserves_reserved_nibble() {
    let encoded = table::encode_link(Link::Next(cluster(9)), false);
    assert_eq!(encoded, 9);
    assert_eq!(
        table::decode_link(0xA000_0009, false, 100),
        Some(Link::Next(cluster(9)))
    );
    assert_eq!(table::decode_link(0x0FFF_FFF8, false, 100), Some(Link::EndOfChain));
    assert_eq!(table::decode_link(0x0FFF_FFF7, false, 100), Some(Link::Defective));
    assert_eq!(table::decode_link(0, false, 100), Some(Link::Free));
    // Pointer past the last valid cluster is not decodable.
    assert_eq!(table::decode_link(101, false, 100), None);
}

#[test]
fn link_codec_exfat_values() {
    assert_eq!(table::encode_link(Link::EndOfChain, true), 0xFFFF_FFFF);
    assert_eq!(table::decode_link(0xFFFF_FFFF, true, 100), Some(Link::EndOfChain));
    assert_eq!(table::decode_link(0xFFFF_FFF7, true, 100), Some(Link::Defective));
    assert_eq!(table::decode_link(7, true, 100), Some(Link::Next(cluster(7))));
}

#[test]
fn allocate_reserves_one_contiguous_run() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;

        let granted = alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 1200)
            .await
            .unwrap();
        assert_eq!(granted, 1200);
        assert_eq!(handle.cluster_count, 3);
        assert_eq!(handle.first, Some(cluster(2)));
        assert_eq!(handle.available, 1536);
        assert_eq!(handle.entry.allocated, 1536);
        assert_eq!(handle.size, 0);
        assert_eq!(media.available_clusters(), TOTAL_CLUSTERS - 3);
        assert_eq!(link_of(&mut media, &mut disk, 2).await, Link::Next(cluster(3)));
        assert_eq!(link_of(&mut media, &mut disk, 3).await, Link::Next(cluster(4)));
        assert_eq!(link_of(&mut media, &mut disk, 4).await, Link::EndOfChain);
    });
}

#[test]
fn allocate_is_all_or_nothing_on_fragmented_media() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        fragment_free_space(&mut media, &mut disk).await;
        let free_before = media.available_clusters();
        let mut handle = open_rw(&mut media, &mut disk).await;

        let result =
            alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 1000).await;
        assert_eq!(result, Err(FsError::NoMoreSpace));
        assert_eq!(media.available_clusters(), free_before);
        assert_eq!(handle.cluster_count, 0);
    });
}

#[test]
fn allocate_reuses_existing_slack() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;

        alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 1024)
            .await
            .unwrap();
        let free = media.available_clusters();
        // Size 0, capacity 1024: the second request fits the slack entirely.
        let granted = alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 800)
            .await
            .unwrap();
        assert_eq!(granted, 800);
        assert_eq!(media.available_clusters(), free);
        assert_eq!(handle.cluster_count, 2);
    });
}

#[test]
fn allocate_uses_exactly_the_needed_clusters() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        media.available_clusters = 10;
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;

        let granted = alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 3072)
            .await
            .unwrap();
        assert_eq!(granted, 3072);
        assert_eq!(handle.cluster_count, 6);
        assert_eq!(handle.available, 3072);
        assert_eq!(media.available_clusters(), 4);
    });
}

#[test]
fn best_effort_grants_all_remaining_capacity() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        // Only the last three clusters stay free.
        for raw in 2..=TOTAL_CLUSTERS - 2 {
            table::claim_slot(&mut media, &mut disk, cluster(raw)).await.unwrap();
            media.available_clusters -= 1;
        }
        assert_eq!(media.available_clusters(), 3);
        let mut handle = open_rw(&mut media, &mut disk).await;

        let granted =
            alloc::allocate_best_effort(&mut media, &mut disk, &mut journal, &mut handle, 4096)
                .await
                .unwrap();
        assert_eq!(granted, 1536);
        assert_eq!(handle.cluster_count, 3);
        assert_eq!(media.available_clusters(), 0);
    });
}

#[test]
fn best_effort_falls_back_to_longest_run() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        fragment_free_space(&mut media, &mut disk).await;
        let mut handle = open_rw(&mut media, &mut disk).await;

        let granted =
            alloc::allocate_best_effort(&mut media, &mut disk, &mut journal, &mut handle, 1024)
                .await
                .unwrap();
        assert_eq!(granted, 512);
        assert_eq!(handle.cluster_count, 1);
    });
}

#[test]
fn best_effort_with_no_free_clusters_is_an_error() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        media.available_clusters = 0;

        let result =
            alloc::allocate_best_effort(&mut media, &mut disk, &mut journal, &mut handle, 100)
                .await;
        assert_eq!(result, Err(FsError::NoMoreSpace));
    });
}

#[test]
fn write_then_read_round_trips_across_clusters() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        let data = pattern(1500, 1);

        write::write(&mut media, &mut disk, &mut journal, &mut handle, &data)
            .await
            .unwrap();
        assert_eq!(handle.size, 1500);
        assert_eq!(handle.offset, 1500);
        assert_eq!(handle.cluster_count, 3);

        seek::seek(&mut media, &mut disk, &mut handle, 0).await.unwrap();
        let mut buf = vec![0u8; 1500];
        let copied = read::read(&mut media, &mut disk, &mut handle, &mut buf)
            .await
            .unwrap();
        assert_eq!(copied, 1500);
        assert_eq!(buf, data);
    });
}

#[test]
fn write_follows_a_scattered_chain() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        // With every second cluster taken there is no contiguous run to
        // prefer, so the chain has to scatter.
        fragment_free_space(&mut media, &mut disk).await;
        let mut handle = open_rw(&mut media, &mut disk).await;
        let data = pattern(1024, 2);

        write::write(&mut media, &mut disk, &mut journal, &mut handle, &data)
            .await
            .unwrap();
        assert_eq!(handle.first, Some(cluster(2)));
        assert_eq!(link_of(&mut media, &mut disk, 2).await, Link::Next(cluster(4)));
        assert_eq!(link_of(&mut media, &mut disk, 4).await, Link::EndOfChain);

        seek::seek(&mut media, &mut disk, &mut handle, 0).await.unwrap();
        let mut buf = vec![0u8; 1024];
        read::read(&mut media, &mut disk, &mut handle, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, data);
    });
}

#[test]
fn read_is_clamped_to_file_size() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        let data = pattern(700, 3);
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &data)
            .await
            .unwrap();

        seek::seek(&mut media, &mut disk, &mut handle, 0).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let copied = read::read(&mut media, &mut disk, &mut handle, &mut buf)
            .await
            .unwrap();
        assert_eq!(copied, 700);
        assert_eq!(&buf[..700], &data[..]);
    });
}

#[test]
fn read_at_end_reports_end_of_file() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(100, 4))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let result = read::read(&mut media, &mut disk, &mut handle, &mut buf).await;
        assert_eq!(result, Err(FsError::EndOfFile));
    });
}

#[test]
fn seek_parks_on_cluster_boundary() {
    block_on(async {
        let (mut media, mut disk) = fixture(2, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(2048, 5))
            .await
            .unwrap();

        // Exactly one cluster in: the cursor stays at the end of the first
        // cluster rather than stepping into the second.
        seek::seek(&mut media, &mut disk, &mut handle, 1024).await.unwrap();
        let pos = handle.pos.unwrap();
        assert_eq!(pos.relative_cluster, 0);
        assert_eq!(pos.relative_sector, 1);
        assert_eq!(pos.byte_in_sector, 512);

        seek::seek(&mut media, &mut disk, &mut handle, 700).await.unwrap();
        let pos = handle.pos.unwrap();
        assert_eq!(pos.relative_cluster, 0);
        assert_eq!(pos.relative_sector, 1);
        assert_eq!(pos.byte_in_sector, 188);
    });
}

#[test]
fn repeated_seek_to_same_offset_is_stable() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(2048, 23))
            .await
            .unwrap();

        seek::seek(&mut media, &mut disk, &mut handle, 700).await.unwrap();
        let derived = handle.pos;
        seek::seek(&mut media, &mut disk, &mut handle, 700).await.unwrap();
        assert_eq!(handle.pos, derived);
        assert_eq!(handle.offset, 700);

        // Parked boundary positions are stable too.
        seek::seek(&mut media, &mut disk, &mut handle, 1024).await.unwrap();
        let parked = handle.pos;
        seek::seek(&mut media, &mut disk, &mut handle, 1024).await.unwrap();
        assert_eq!(handle.pos, parked);
        assert_eq!(handle.offset, 1024);
    });
}

#[test]
fn seek_clamps_past_end() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(300, 6))
            .await
            .unwrap();

        let offset = seek::seek(&mut media, &mut disk, &mut handle, 10_000).await.unwrap();
        assert_eq!(offset, 300);
        assert_eq!(handle.offset, 300);
    });
}

#[test]
fn overwrite_without_fault_tolerance_stays_in_place() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(1024, 7))
            .await
            .unwrap();
        let first = handle.first;

        seek::seek(&mut media, &mut disk, &mut handle, 100).await.unwrap();
        let replacement = pattern(800, 8);
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &replacement)
            .await
            .unwrap();
        assert_eq!(handle.first, first);
        assert_eq!(handle.size, 1024);

        seek::seek(&mut media, &mut disk, &mut handle, 100).await.unwrap();
        let mut buf = vec![0u8; 800];
        read::read(&mut media, &mut disk, &mut handle, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, replacement);
    });
}

#[test]
fn fault_tolerant_overwrite_replaces_clusters() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, true);
        let mut journal = RecordingJournal::new();
        let mut handle = open_rw(&mut media, &mut disk).await;
        let original = pattern(1024, 9);
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &original)
            .await
            .unwrap();
        assert_eq!(handle.first, Some(cluster(2)));
        let free_before = media.available_clusters();
        journal.events.borrow_mut().clear();

        journal::tx_start::<RamDisk, _>(&mut media, &mut journal).await.unwrap();
        seek::seek(&mut media, &mut disk, &mut handle, 300).await.unwrap();
        let replacement = pattern(600, 10);
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &replacement)
            .await
            .unwrap();
        journal::tx_commit::<RamDisk, _>(&mut media, &mut journal).await.unwrap();

        // Both affected clusters were swapped for fresh ones and the old pair
        // went back to the free pool.
        assert_eq!(handle.first, Some(cluster(4)));
        assert_eq!(link_of(&mut media, &mut disk, 4).await, Link::Next(cluster(5)));
        assert_eq!(link_of(&mut media, &mut disk, 5).await, Link::EndOfChain);
        assert_eq!(link_of(&mut media, &mut disk, 2).await, Link::Free);
        assert_eq!(link_of(&mut media, &mut disk, 3).await, Link::Free);
        assert_eq!(media.available_clusters(), free_before);

        let events = journal.events.borrow();
        assert_eq!(events[0], JournalEvent::Start);
        assert_eq!(
            events[1],
            JournalEvent::Splice(ChainSplice {
                old_head: Some(cluster(2)),
                old_tail: Some(cluster(3)),
                new_head: cluster(4),
                new_tail: cluster(5),
            })
        );
        assert_eq!(events[2], JournalEvent::Release(cluster(2)));
        assert_eq!(events[3], JournalEvent::Release(cluster(3)));
        assert_eq!(events[4], JournalEvent::End);
        drop(events);

        // Untouched head and tail bytes survived the move.
        seek::seek(&mut media, &mut disk, &mut handle, 0).await.unwrap();
        let mut buf = vec![0u8; 1024];
        read::read(&mut media, &mut disk, &mut handle, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..300], &original[..300]);
        assert_eq!(&buf[300..900], &replacement[..]);
        assert_eq!(&buf[900..], &original[900..]);
    });
}

#[test]
fn fault_tolerant_single_sector_overwrite_stays_in_place() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, true);
        let mut journal = RecordingJournal::new();
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(1024, 11))
            .await
            .unwrap();
        let first = handle.first;
        journal.events.borrow_mut().clear();

        seek::seek(&mut media, &mut disk, &mut handle, 10).await.unwrap();
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(20, 12))
            .await
            .unwrap();
        assert_eq!(handle.first, first);
        assert!(journal.events.borrow().is_empty());
    });
}

#[test]
fn device_failure_before_splice_leaves_old_chain_whole() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, true);
        let mut journal = RecordingJournal::new();
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(1024, 13))
            .await
            .unwrap();
        journal.events.borrow_mut().clear();

        journal::tx_start::<RamDisk, _>(&mut media, &mut journal).await.unwrap();
        seek::seek(&mut media, &mut disk, &mut handle, 0).await.unwrap();
        disk.fail_after_writes = Some(disk.writes);
        let result =
            write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(1024, 14))
                .await;
        assert_eq!(result, Err(FsError::Device(DiskError)));
        journal::tx_abort::<RamDisk, _>(&mut media, &mut journal).await;
        disk.fail_after_writes = None;

        assert_eq!(link_of(&mut media, &mut disk, 2).await, Link::Next(cluster(3)));
        assert_eq!(link_of(&mut media, &mut disk, 3).await, Link::EndOfChain);
        let events = journal.events.borrow();
        assert_eq!(events[0], JournalEvent::Start);
        assert_eq!(events.last(), Some(&JournalEvent::Fail));
    });
}

#[test]
fn truncate_keeps_allocated_clusters() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(1500, 15))
            .await
            .unwrap();
        let free_before = media.available_clusters();

        release::truncate::<DiskError>(&media, &mut handle, 200).unwrap();
        assert_eq!(handle.size, 200);
        assert_eq!(handle.offset, 200);
        assert_eq!(handle.cluster_count, 3);
        assert_eq!(handle.available, 1536);
        assert_eq!(media.available_clusters(), free_before);

        // Growing through truncate is a no-op.
        release::truncate::<DiskError>(&media, &mut handle, 5000).unwrap();
        assert_eq!(handle.size, 200);
    });
}

#[test]
fn truncate_release_returns_tail_clusters() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(2048, 16))
            .await
            .unwrap();
        let free_before = media.available_clusters();

        release::truncate_release(&mut media, &mut disk, &mut journal, &mut handle, 700)
            .await
            .unwrap();
        assert_eq!(handle.size, 700);
        assert_eq!(handle.cluster_count, 2);
        assert_eq!(handle.available, 1024);
        assert_eq!(media.available_clusters(), free_before + 2);
        assert_eq!(link_of(&mut media, &mut disk, 3).await, Link::EndOfChain);
        assert_eq!(link_of(&mut media, &mut disk, 4).await, Link::Free);
        assert_eq!(link_of(&mut media, &mut disk, 5).await, Link::Free);
    });
}

#[test]
fn truncate_release_trims_slack_without_shrinking_size() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 1536)
            .await
            .unwrap();
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(200, 22))
            .await
            .unwrap();
        let free_before = media.available_clusters();

        // Target between the size and the allocated capacity: slack past the
        // rounded-up target goes back, the logical size stays put.
        release::truncate_release(&mut media, &mut disk, &mut journal, &mut handle, 600)
            .await
            .unwrap();
        assert_eq!(handle.size, 200);
        assert_eq!(handle.cluster_count, 2);
        assert_eq!(handle.available, 1024);
        assert_eq!(media.available_clusters(), free_before + 1);
        assert_eq!(link_of(&mut media, &mut disk, 3).await, Link::EndOfChain);
        assert_eq!(link_of(&mut media, &mut disk, 4).await, Link::Free);

        // At or past the allocated capacity nothing happens.
        release::truncate_release(&mut media, &mut disk, &mut journal, &mut handle, 1024)
            .await
            .unwrap();
        assert_eq!(handle.size, 200);
        assert_eq!(handle.cluster_count, 2);
        assert_eq!(media.available_clusters(), free_before + 1);
    });
}

#[test]
fn truncate_release_to_zero_frees_everything() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, true);
        let mut journal = RecordingJournal::new();
        let mut handle = open_rw(&mut media, &mut disk).await;
        write::write(&mut media, &mut disk, &mut journal, &mut handle, &pattern(1024, 17))
            .await
            .unwrap();
        journal.events.borrow_mut().clear();

        release::truncate_release(&mut media, &mut disk, &mut journal, &mut handle, 0)
            .await
            .unwrap();
        assert_eq!(handle.size, 0);
        assert_eq!(handle.first, None);
        assert_eq!(handle.cluster_count, 0);
        assert_eq!(handle.entry.first_cluster, 0);
        assert_eq!(handle.entry.allocated, 0);
        assert_eq!(media.available_clusters(), TOTAL_CLUSTERS);
        let events = journal.events.borrow();
        assert!(events.contains(&JournalEvent::Release(cluster(2))));
        assert!(events.contains(&JournalEvent::Release(cluster(3))));
    });
}

#[test]
fn exfat_allocation_keeps_no_chain_layout() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, true, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;

        alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 1536)
            .await
            .unwrap();
        assert!(handle.contiguous);
        assert!(handle.entry.contiguous);
        assert_eq!(handle.first, Some(cluster(2)));
        assert_eq!(handle.cluster_count, 3);
        // The bitmap carries the allocation; the chain table stays untouched.
        for raw in 2..5 {
            assert!(table::cluster_state(&mut media, &mut disk, cluster(raw)).await.unwrap());
            assert_eq!(link_of(&mut media, &mut disk, raw).await, Link::Free);
        }

        // Growing into adjacent free clusters keeps the layout.
        handle.size = 1536;
        alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 512)
            .await
            .unwrap();
        assert!(handle.contiguous);
        assert_eq!(handle.cluster_count, 4);
        assert_eq!(handle.consecutive, 4);
    });
}

#[test]
fn exfat_blocked_extension_downgrades_to_chain() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, true, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 1024)
            .await
            .unwrap();
        // Occupy the cluster right behind the file's run.
        table::claim_slot(&mut media, &mut disk, cluster(4)).await.unwrap();
        media.available_clusters -= 1;

        handle.size = 1024;
        alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 512)
            .await
            .unwrap();
        assert!(!handle.contiguous);
        assert!(!handle.entry.contiguous);
        assert_eq!(handle.cluster_count, 3);
        // The whole file now has an explicit chain.
        assert_eq!(link_of(&mut media, &mut disk, 2).await, Link::Next(cluster(3)));
        assert_eq!(link_of(&mut media, &mut disk, 3).await, Link::Next(cluster(5)));
        assert_eq!(link_of(&mut media, &mut disk, 5).await, Link::EndOfChain);
    });
}

#[test]
fn exfat_truncate_release_trims_bitmap_run() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, true, false);
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;
        alloc::allocate_exact(&mut media, &mut disk, &mut journal, &mut handle, 2048)
            .await
            .unwrap();
        handle.size = 2048;

        release::truncate_release(&mut media, &mut disk, &mut journal, &mut handle, 600)
            .await
            .unwrap();
        assert!(handle.contiguous);
        assert_eq!(handle.cluster_count, 2);
        assert_eq!(handle.last, Some(cluster(3)));
        assert!(table::cluster_state(&mut media, &mut disk, cluster(3)).await.unwrap());
        assert!(!table::cluster_state(&mut media, &mut disk, cluster(4)).await.unwrap());
        assert!(!table::cluster_state(&mut media, &mut disk, cluster(5)).await.unwrap());
    });
}

#[test]
fn open_derives_chain_shape_from_table() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        // 2 -> 3 -> 7 -> end: a two-cluster consecutive prefix, then a jump.
        table::write_link(&mut media, &mut disk, cluster(2), Link::Next(cluster(3)))
            .await
            .unwrap();
        table::write_link(&mut media, &mut disk, cluster(3), Link::Next(cluster(7)))
            .await
            .unwrap();
        table::write_link(&mut media, &mut disk, cluster(7), Link::EndOfChain)
            .await
            .unwrap();
        let entry = DirEntry {
            first_cluster: 2,
            size: 1400,
            ..DirEntry::default()
        };

        let handle = handles::open_file(&mut media, &mut disk, key(0), entry, OpenMode::Read)
            .await
            .unwrap();
        assert_eq!(handle.cluster_count, 3);
        assert_eq!(handle.consecutive, 2);
        assert_eq!(handle.last, Some(cluster(7)));
        assert_eq!(handle.available, 1536);
    });
}

#[test]
fn open_rejects_size_beyond_chain_capacity() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        table::write_link(&mut media, &mut disk, cluster(2), Link::EndOfChain)
            .await
            .unwrap();
        let entry = DirEntry {
            first_cluster: 2,
            size: 2000,
            ..DirEntry::default()
        };

        let result = handles::open_file(&mut media, &mut disk, key(0), entry, OpenMode::Read).await;
        assert_eq!(result.err(), Some(FsError::FileCorrupt));
    });
}

#[test]
fn open_rejects_looped_chain() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        table::write_link(&mut media, &mut disk, cluster(2), Link::Next(cluster(3)))
            .await
            .unwrap();
        table::write_link(&mut media, &mut disk, cluster(3), Link::Next(cluster(2)))
            .await
            .unwrap();
        let entry = DirEntry {
            first_cluster: 2,
            size: 100,
            ..DirEntry::default()
        };

        let result = handles::open_file(&mut media, &mut disk, key(0), entry, OpenMode::Read).await;
        assert_eq!(result.err(), Some(FsError::FileCorrupt));
    });
}

#[test]
fn aliasing_handles_share_one_record() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut first = open_rw(&mut media, &mut disk).await;
        let mut second = handles::open_file(
            &mut media,
            &mut disk,
            key(0),
            DirEntry::default(),
            OpenMode::ReadWrite,
        )
        .await
        .unwrap();
        assert_eq!(media.files.len(), 1);
        assert_eq!(media.files[0].open_count, 2);

        write::write(&mut media, &mut disk, &mut journal, &mut first, &pattern(1024, 18))
            .await
            .unwrap();
        handles::publish(&mut media, &mut first);

        handles::refresh::<DiskError>(&media, &mut second).unwrap();
        assert_eq!(second.size, 1024);
        assert_eq!(second.first, first.first);

        // A shrink published by one handle clamps the other's offset.
        seek::seek(&mut media, &mut disk, &mut second, 900).await.unwrap();
        release::truncate::<DiskError>(&media, &mut first, 100).unwrap();
        handles::publish(&mut media, &mut first);
        handles::refresh::<DiskError>(&media, &mut second).unwrap();
        assert_eq!(second.offset, 100);
        assert_eq!(second.pos, None);
    });
}

#[test]
fn write_protected_media_rejects_writes() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        media.write_protect = true;
        let mut journal = NoJournal;
        let mut handle = open_rw(&mut media, &mut disk).await;

        let result = write::write(&mut media, &mut disk, &mut journal, &mut handle, b"abc").await;
        assert_eq!(result, Err(FsError::WriteProtect));
        let result = release::truncate::<DiskError>(&media, &mut handle, 0);
        assert_eq!(result, Err(FsError::WriteProtect));
    });
}

#[test]
fn read_only_handle_rejects_writes() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut journal = NoJournal;
        let mut handle =
            handles::open_file(&mut media, &mut disk, key(0), DirEntry::default(), OpenMode::Read)
                .await
                .unwrap();

        let result = write::write(&mut media, &mut disk, &mut journal, &mut handle, b"abc").await;
        assert_eq!(result, Err(FsError::AccessError));
    });
}

#[test]
fn closed_handle_is_rejected() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        let mut dirs = MockDirectory::new();
        let mut handle = open_rw(&mut media, &mut disk).await;
        handles::close_file::<RamDisk, _>(&mut media, &mut dirs, &mut handle)
            .await
            .unwrap();
        assert!(!handle.is_open());
        assert!(media.files.is_empty());

        let result = handles::require_open::<DiskError>(&media, &handle);
        assert_eq!(result.err(), Some(FsError::NotOpen));
    });
}

#[test]
fn open_registry_is_bounded() {
    block_on(async {
        let (mut media, mut disk) = fixture(1, false, false);
        for slot in 0..crate::MAX_OPEN_FILES as u8 {
            handles::open_file(
                &mut media,
                &mut disk,
                key(slot),
                DirEntry::default(),
                OpenMode::Read,
            )
            .await
            .unwrap();
        }
        let result = handles::open_file(
            &mut media,
            &mut disk,
            key(200),
            DirEntry::default(),
            OpenMode::Read,
        )
        .await;
        assert_eq!(result.err(), Some(FsError::TooManyOpenFiles));
    });
}

static NOTIFY_HITS: AtomicU32 = AtomicU32::new(0);

fn count_notify(_key: FileKey, _size: u64) {
    NOTIFY_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn filesystem_api_round_trip() {
    block_on(async {
        let journal = RecordingJournal::new();
        let events = journal.events.clone();
        let dirs = MockDirectory::new();
        let entries = dirs.entries.clone();
        let disk = RamDisk::new(3 + TOTAL_CLUSTERS as usize);
        let fs: FileSystem<RamDisk, RecordingJournal, MockDirectory> =
            FileSystem::new(config(1, false, true), disk, journal, dirs);
        fs.set_write_notify(Some(count_notify)).await;

        let mut handle = fs.open(key(1), DirEntry::default(), OpenMode::ReadWrite).await.unwrap();
        let data = pattern(1300, 19);
        fs.write(&mut handle, &data).await.unwrap();
        assert!(NOTIFY_HITS.load(Ordering::SeqCst) >= 1);
        assert_eq!(events.borrow().first(), Some(&JournalEvent::Start));
        assert_eq!(events.borrow().last(), Some(&JournalEvent::End));

        fs.seek(&mut handle, 0).await.unwrap();
        let mut buf = vec![0u8; 1300];
        let copied = fs.read(&mut handle, &mut buf).await.unwrap();
        assert_eq!(copied, 1300);
        assert_eq!(buf, data);

        fs.truncate(&mut handle, 500).await.unwrap();
        assert_eq!(handle.size(), 500);

        fs.close(&mut handle).await.unwrap();
        assert!(!handle.is_open());
        // The directory entry was persisted with the final size.
        let logged = entries.borrow();
        let last = logged.last().unwrap();
        assert_eq!(last.0, key(1));
        assert_eq!(last.1.size, 500);
        drop(logged);

        let result = fs.read(&mut handle, &mut buf).await;
        assert_eq!(result, Err(FsError::NotOpen));
    });
}

#[test]
fn commit_failure_marks_transaction_failed() {
    block_on(async {
        let journal = RecordingJournal::new();
        let events = journal.events.clone();
        let dirs = MockDirectory::new();
        let fail = dirs.fail.clone();
        let disk = RamDisk::new(3 + TOTAL_CLUSTERS as usize);
        let fs: FileSystem<RamDisk, RecordingJournal, MockDirectory> =
            FileSystem::new(config(1, false, true), disk, journal, dirs);
        let mut handle = fs.open(key(5), DirEntry::default(), OpenMode::ReadWrite).await.unwrap();

        // The operation body succeeds but persisting the directory entry
        // does not: the transaction must still be marked failed.
        *fail.borrow_mut() = true;
        let result = fs.write(&mut handle, &pattern(600, 20)).await;
        assert_eq!(result, Err(FsError::Device(DiskError)));
        {
            let logged = events.borrow();
            assert_eq!(logged.first(), Some(&JournalEvent::Start));
            assert_eq!(logged.last(), Some(&JournalEvent::Fail));
            assert!(!logged.contains(&JournalEvent::End));
        }
        events.borrow_mut().clear();

        // The phase went back to idle, so the next mutation gets a fresh
        // bracket instead of running outside any transaction.
        *fail.borrow_mut() = false;
        fs.write(&mut handle, &pattern(600, 21)).await.unwrap();
        let logged = events.borrow();
        assert_eq!(logged.first(), Some(&JournalEvent::Start));
        assert_eq!(logged.last(), Some(&JournalEvent::End));
    });
}

#[test]
fn filesystem_reports_available_bytes() {
    block_on(async {
        let disk = RamDisk::new(3 + TOTAL_CLUSTERS as usize);
        let fs: FileSystem<RamDisk, NoJournal, MockDirectory> =
            FileSystem::new(config(1, false, false), disk, NoJournal, MockDirectory::new());
        assert_eq!(fs.available_bytes().await, TOTAL_CLUSTERS as u64 * 512);

        let mut handle = fs.open(key(2), DirEntry::default(), OpenMode::ReadWrite).await.unwrap();
        fs.allocate(&mut handle, 1024).await.unwrap();
        assert_eq!(fs.available_bytes().await, (TOTAL_CLUSTERS as u64 - 2) * 512);
        fs.close(&mut handle).await.unwrap();
    });
}

#[test]
fn media_with_bad_geometry_is_rejected() {
    block_on(async {
        let mut bad = config(0, false, false);
        bad.sectors_per_cluster = 0;
        let disk = RamDisk::new(8);
        let fs: FileSystem<RamDisk, NoJournal, MockDirectory> =
            FileSystem::new(bad, disk, NoJournal, MockDirectory::new());
        let result = fs.open(key(3), DirEntry::default(), OpenMode::Read).await;
        assert_eq!(result.err(), Some(FsError::MediaInvalid));
    });
}
