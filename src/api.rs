use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};
use embassy_sync::mutex::Mutex;

use crate::device::BlockDevice;
use crate::fs::core::{DirEntry, FileHandle, FileKey, FsError, Media, MediaConfig, OpenMode, WriteNotify};
use crate::fs::handles::DirectoryOps;
use crate::fs::{alloc, geometry, handles, read, release, seek, write};
use crate::journal::{self, FaultLog};

struct Inner<D, J, S> {
    media: Media,
    dev: D,
    journal: J,
    dirs: S,
}

/// One mounted medium. Every operation takes the medium's critical section
/// for its whole duration, so chain-table reads, the shared sector buffer and
/// the open-file registry are never observed mid-update.
pub struct FileSystem<D, J, S, M = NoopRawMutex>
where
    M: RawMutex,
{
    inner: Mutex<M, Inner<D, J, S>>,
}

impl<D, J, S, M> FileSystem<D, J, S, M>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
    S: DirectoryOps<D::Error>,
    M: RawMutex,
{
    pub fn new(config: MediaConfig, dev: D, journal: J, dirs: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                media: Media::new(config),
                dev,
                journal,
                dirs,
            }),
        }
    }

    pub async fn set_clock(&self, clock: fn() -> u32) {
        self.inner.lock().await.media.set_clock(clock);
    }

    /// Registers a callback fired after every successful mutating operation,
    /// with the file's key and new size.
    pub async fn set_write_notify(&self, notify: Option<WriteNotify>) {
        self.inner.lock().await.media.write_notify = notify;
    }

    /// Free capacity of the medium in bytes.
    pub async fn available_bytes(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.media.available_clusters() as u64 * geometry::bytes_per_cluster(&inner.media)
    }

    pub async fn is_exfat(&self) -> bool {
        self.inner.lock().await.media.is_exfat()
    }

    /// Opens a handle on the file whose directory entry lives at `key`.
    /// Handles opened on the same key alias one shared record, so each sees
    /// the others' completed mutations.
    pub async fn open(
        &self,
        key: FileKey,
        entry: DirEntry,
        mode: OpenMode,
    ) -> Result<FileHandle, FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        if mode == OpenMode::ReadWrite && inner.media.write_protect {
            return Err(FsError::WriteProtect);
        }
        let result = handles::open_file(&mut inner.media, &mut inner.dev, key, entry, mode).await;
        match &result {
            Ok(handle) => log::debug!(
                "open key={}:{} size={} clusters={}",
                key.sector,
                key.slot,
                handle.size(),
                handle.cluster_count()
            ),
            Err(err) => log::warn!("open failed key={}:{} err={:?}", key.sector, key.slot, err),
        }
        result
    }

    /// Closes a handle, persisting its directory entry if this or an aliasing
    /// handle modified the file.
    pub async fn close(&self, handle: &mut FileHandle) -> Result<(), FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        handles::refresh(&inner.media, handle)?;
        handles::close_file::<D, S>(&mut inner.media, &mut inner.dirs, handle).await
    }

    /// Moves the handle's byte offset, clamped to the file size. Returns the
    /// resulting offset.
    pub async fn seek(
        &self,
        handle: &mut FileHandle,
        offset: u64,
    ) -> Result<u64, FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        handles::require_open::<D::Error>(&inner.media, handle)?;
        handles::refresh(&inner.media, handle)?;
        seek::seek(&mut inner.media, &mut inner.dev, handle, offset).await
    }

    /// Reads up to `buf.len()` bytes at the current offset; short counts
    /// happen only at end of file. Reading at or past the end reports
    /// `EndOfFile`.
    pub async fn read(
        &self,
        handle: &mut FileHandle,
        buf: &mut [u8],
    ) -> Result<usize, FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        handles::require_open::<D::Error>(&inner.media, handle)?;
        handles::refresh(&inner.media, handle)?;
        let copied = read::read(&mut inner.media, &mut inner.dev, handle, buf).await?;
        // Accessed date rides along on the shared record without invalidating
        // aliasing handles.
        if let Some(idx) = handles::find_record(&inner.media, handle.key()) {
            inner.media.files[idx].entry.accessed_date = handle.dir_entry().accessed_date;
        }
        Ok(copied)
    }

    /// Writes `data` at the current offset, allocating clusters as the file
    /// grows. Overwrites on a fault-tolerant medium go through replace-on-write
    /// so an interrupted operation never leaves a half-old, half-new range
    /// reachable.
    pub async fn write(
        &self,
        handle: &mut FileHandle,
        data: &[u8],
    ) -> Result<(), FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        handles::require_open::<D::Error>(&inner.media, handle)?;
        handles::refresh(&inner.media, handle)?;

        journal::tx_start::<D, J>(&mut inner.media, &mut inner.journal).await?;
        let result =
            write::write(&mut inner.media, &mut inner.dev, &mut inner.journal, handle, data).await;
        self.settle(inner, handle, "write", result).await
    }

    /// Pre-allocates `bytes` of capacity past the file's end from one
    /// physically contiguous run, or fails whole with `NoMoreSpace`. Returns
    /// the granted byte count; a request already covered by allocated slack
    /// is granted in full without reserving anything.
    pub async fn allocate(
        &self,
        handle: &mut FileHandle,
        bytes: u64,
    ) -> Result<u64, FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        handles::require_open::<D::Error>(&inner.media, handle)?;
        handles::refresh(&inner.media, handle)?;
        handles::require_writable(&inner.media, handle)?;

        journal::tx_start::<D, J>(&mut inner.media, &mut inner.journal).await?;
        let result =
            alloc::allocate_exact(&mut inner.media, &mut inner.dev, &mut inner.journal, handle, bytes)
                .await;
        self.settle(inner, handle, "allocate", result).await
    }

    /// Best-effort pre-allocation: grants the requested bytes when possible,
    /// otherwise whatever the longest free run provides. Returns the granted
    /// byte count.
    pub async fn allocate_best_effort(
        &self,
        handle: &mut FileHandle,
        bytes: u64,
    ) -> Result<u64, FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        handles::require_open::<D::Error>(&inner.media, handle)?;
        handles::refresh(&inner.media, handle)?;
        handles::require_writable(&inner.media, handle)?;

        journal::tx_start::<D, J>(&mut inner.media, &mut inner.journal).await?;
        let result = alloc::allocate_best_effort(
            &mut inner.media,
            &mut inner.dev,
            &mut inner.journal,
            handle,
            bytes,
        )
        .await;
        self.settle(inner, handle, "allocate_best_effort", result).await
    }

    /// Shrinks the file size without freeing clusters; the capacity stays
    /// with the file. Growing requests are ignored.
    pub async fn truncate(
        &self,
        handle: &mut FileHandle,
        new_size: u64,
    ) -> Result<(), FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        handles::require_open::<D::Error>(&inner.media, handle)?;
        handles::refresh(&inner.media, handle)?;
        let result = release::truncate(&inner.media, handle, new_size);
        self.settle(inner, handle, "truncate", result).await
    }

    /// Shrinks the file and returns every cluster past the new end to the
    /// free pool.
    pub async fn truncate_release(
        &self,
        handle: &mut FileHandle,
        new_size: u64,
    ) -> Result<(), FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        geometry::check(&inner.media)?;
        handles::require_open::<D::Error>(&inner.media, handle)?;
        handles::refresh(&inner.media, handle)?;

        journal::tx_start::<D, J>(&mut inner.media, &mut inner.journal).await?;
        let result = release::truncate_release(
            &mut inner.media,
            &mut inner.dev,
            &mut inner.journal,
            handle,
            new_size,
        )
        .await;
        self.settle(inner, handle, "truncate_release", result).await
    }

    /// Persists the handle's directory entry and flushes the device's write
    /// path.
    pub async fn flush(&self, handle: &mut FileHandle) -> Result<(), FsError<D::Error>> {
        let inner = &mut *self.inner.lock().await;
        handles::refresh(&inner.media, handle)?;
        if handle.is_modified() {
            handles::sync_entry::<D, S>(&mut inner.dirs, handle).await?;
            handle.clear_modified();
            handles::publish(&mut inner.media, handle);
        }
        inner.dev.flush().await.map_err(FsError::Device)
    }

    /// Common tail of every mutating operation: commit or abort the
    /// transaction, publish the handle's state to aliasing handles, persist
    /// the directory entry on fault-tolerant media and fire the notify hook.
    /// A failure while committing takes the same abort path as a failed
    /// operation body, so the transaction is always marked failed and the
    /// phase returns to idle before the critical section is released.
    async fn settle<T>(
        &self,
        inner: &mut Inner<D, J, S>,
        handle: &mut FileHandle,
        op: &str,
        result: Result<T, FsError<D::Error>>,
    ) -> Result<T, FsError<D::Error>> {
        let result = match result {
            Ok(value) => {
                let committed = async {
                    if inner.media.fault_tolerant && handle.is_modified() {
                        handles::sync_entry::<D, S>(&mut inner.dirs, handle).await?;
                        handle.clear_modified();
                    }
                    journal::tx_commit::<D, J>(&mut inner.media, &mut inner.journal).await
                }
                .await;
                committed.map(|()| value)
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(value) => {
                handles::publish(&mut inner.media, handle);
                if let Some(notify) = inner.media.write_notify {
                    notify(handle.key(), handle.size());
                }
                log::debug!(
                    "{} ok key={}:{} offset={} size={}",
                    op,
                    handle.key().sector,
                    handle.key().slot,
                    handle.offset(),
                    handle.size()
                );
                Ok(value)
            }
            Err(err) => {
                journal::tx_abort::<D, J>(&mut inner.media, &mut inner.journal).await;
                // The handle may hold half-applied state; drop it and resync
                // from the authoritative record.
                handle.mark_stale();
                handles::refresh(&inner.media, handle)?;
                log::warn!(
                    "{} failed key={}:{} err={:?}",
                    op,
                    handle.key().sector,
                    handle.key().slot,
                    err
                );
                Err(err)
            }
        }
    }
}
