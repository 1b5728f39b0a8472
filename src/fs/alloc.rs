use crate::device::BlockDevice;
use crate::fs::core::{ClusterId, FileHandle, FsError, Link, Media, FIRST_DATA_CLUSTER};
use crate::fs::{geometry, table};
use crate::journal::{ChainSplice, FaultLog};

/// A freshly reserved cluster run, internally linked with its tail marked
/// end-of-chain, not yet attached to any file.
pub(crate) struct Run {
    pub head: ClusterId,
    pub tail: ClusterId,
    pub count: u32,
    pub leading_consecutive: u32,
}

pub(crate) struct ScanOutcome {
    /// Start of the first free run of the requested length, if one exists.
    pub exact: Option<ClusterId>,
    /// Longest free run seen before `exact` was satisfied.
    pub longest: Option<(ClusterId, u32)>,
}

/// One wrapped pass over the free map starting at the search cursor. Runs are
/// physically consecutive free clusters; the pass stops early once a run of
/// `needed` clusters is found.
pub(crate) async fn scan_free_runs<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    needed: u32,
) -> Result<ScanOutcome, FsError<D::Error>> {
    let max = geometry::max_cluster(media);
    let cursor = media.search_cursor.clamp(FIRST_DATA_CLUSTER, max);
    let mut outcome = ScanOutcome {
        exact: None,
        longest: None,
    };
    let mut run_start = None;
    let mut run_len = 0u32;
    let mut expected = 0u32;

    for raw in (cursor..=max).chain(FIRST_DATA_CLUSTER..cursor) {
        let cluster = ClusterId::new(raw).ok_or(FsError::InvalidCluster(raw))?;
        if !table::slot_free(media, dev, cluster).await? {
            run_len = 0;
            run_start = None;
            continue;
        }
        if run_len == 0 || raw != expected {
            run_start = Some(cluster);
            run_len = 1;
        } else {
            run_len += 1;
        }
        expected = raw + 1;

        let start = run_start.ok_or(FsError::InvalidCluster(raw))?;
        match outcome.longest {
            Some((_, best)) if best >= run_len => {}
            _ => outcome.longest = Some((start, run_len)),
        }
        if needed > 0 && run_len >= needed {
            outcome.exact = Some(start);
            break;
        }
    }
    Ok(outcome)
}

async fn find_first_free<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    from: u32,
) -> Result<Option<ClusterId>, FsError<D::Error>> {
    let max = geometry::max_cluster(media);
    let start = from.clamp(FIRST_DATA_CLUSTER, max);
    for raw in (start..=max).chain(FIRST_DATA_CLUSTER..start) {
        let cluster = ClusterId::new(raw).ok_or(FsError::InvalidCluster(raw))?;
        if table::slot_free(media, dev, cluster).await? {
            return Ok(Some(cluster));
        }
    }
    Ok(None)
}

fn bump_cursor(media: &mut Media, after: ClusterId) {
    let next = after.raw().saturating_add(1);
    media.search_cursor = if next > geometry::max_cluster(media) {
        FIRST_DATA_CLUSTER
    } else {
        next
    };
}

/// Claims `count` clusters starting at `start` and links them into a detached
/// run. `with_chain` is false only for contiguous exFAT extension, where the
/// bitmap alone carries the allocation.
pub(crate) async fn reserve_contiguous<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    start: ClusterId,
    count: u32,
    with_chain: bool,
) -> Result<Run, FsError<D::Error>> {
    let tail = ClusterId::new(start.raw() + count - 1).ok_or(FsError::NoMoreSpace)?;
    for index in 0..count {
        let cluster = ClusterId::new(start.raw() + index).ok_or(FsError::NoMoreSpace)?;
        table::claim_slot(media, dev, cluster).await?;
    }
    if with_chain {
        for index in 0..count {
            let cluster = ClusterId::new(start.raw() + index).ok_or(FsError::NoMoreSpace)?;
            let link = if index + 1 < count {
                Link::Next(cluster.next_physical())
            } else {
                Link::EndOfChain
            };
            table::write_link(media, dev, cluster, link).await?;
        }
    }
    media.available_clusters = media.available_clusters.saturating_sub(count);
    bump_cursor(media, tail);
    Ok(Run {
        head: start,
        tail,
        count,
        leading_consecutive: count,
    })
}

/// First-fit reservation of `count` clusters wherever they are, linked as
/// they are found. A shortfall unwinds the partial run before reporting
/// `NoMoreSpace`.
pub(crate) async fn reserve_scattered<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    count: u32,
) -> Result<Run, FsError<D::Error>> {
    let mut head = None;
    let mut prev: Option<ClusterId> = None;
    let mut leading = 0u32;
    let mut unbroken = true;
    let mut taken = 0u32;
    let mut search_from = media.search_cursor;

    while taken < count {
        let cluster = match find_first_free(media, dev, search_from).await? {
            Some(cluster) => cluster,
            None => {
                if let Some(head) = head {
                    unwind_partial_run(media, dev, head, taken).await?;
                }
                return Err(FsError::NoMoreSpace);
            }
        };
        table::claim_slot(media, dev, cluster).await?;
        if media.exfat {
            table::write_link(media, dev, cluster, Link::EndOfChain).await?;
        }
        match prev {
            Some(previous) => {
                table::write_link(media, dev, previous, Link::Next(cluster)).await?;
                if unbroken && cluster == previous.next_physical() {
                    leading += 1;
                } else {
                    unbroken = false;
                }
            }
            None => {
                head = Some(cluster);
                leading = 1;
            }
        }
        prev = Some(cluster);
        taken += 1;
        search_from = cluster.raw().saturating_add(1);
    }

    let head = head.ok_or(FsError::NoMoreSpace)?;
    let tail = prev.ok_or(FsError::NoMoreSpace)?;
    media.available_clusters = media.available_clusters.saturating_sub(count);
    bump_cursor(media, tail);
    Ok(Run {
        head,
        tail,
        count,
        leading_consecutive: leading,
    })
}

async fn unwind_partial_run<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    head: ClusterId,
    count: u32,
) -> Result<(), FsError<D::Error>> {
    let mut cluster = head;
    for index in 0..count {
        let link = table::read_link(media, dev, cluster).await?;
        table::release_slot(media, dev, cluster).await?;
        if index + 1 < count {
            match link {
                Link::Next(next) => cluster = next,
                _ => return Err(FsError::FileCorrupt),
            }
        }
    }
    Ok(())
}

/// Rebuilds an explicit chain over a previously contiguous exFAT file and
/// clears its "no chain" bit. Irreversible for the file's lifetime.
pub(crate) async fn ensure_chained<D: BlockDevice>(
    media: &mut Media,
    dev: &mut D,
    handle: &mut FileHandle,
) -> Result<(), FsError<D::Error>> {
    if !handle.contiguous {
        return Ok(());
    }
    if let Some(first) = handle.first {
        for index in 0..handle.cluster_count {
            let cluster =
                ClusterId::new(first.raw() + index).ok_or(FsError::FileCorrupt)?;
            let link = if index + 1 < handle.cluster_count {
                Link::Next(cluster.next_physical())
            } else {
                Link::EndOfChain
            };
            table::write_link(media, dev, cluster, link).await?;
        }
    }
    handle.contiguous = false;
    handle.entry.contiguous = false;
    Ok(())
}

/// Attaches a detached run at the file's tail, staging the splice intent in
/// the fault-tolerance log before the live chain is touched.
async fn splice_extend<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    run: Run,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if media.fault_tolerant {
        journal
            .stage_chain_splice(ChainSplice {
                old_head: None,
                old_tail: handle.last,
                new_head: run.head,
                new_tail: run.tail,
            })
            .await
            .map_err(FsError::Device)?;
    }

    let cluster_bytes = geometry::bytes_per_cluster(media);
    match handle.last {
        Some(last) => {
            table::write_link(media, dev, last, Link::Next(run.head)).await?;
            if handle.consecutive == handle.cluster_count && run.head == last.next_physical() {
                handle.consecutive += run.leading_consecutive;
            }
        }
        None => {
            handle.first = Some(run.head);
            handle.entry.first_cluster = run.head.raw();
            handle.consecutive = run.leading_consecutive;
        }
    }
    handle.last = Some(run.tail);
    handle.cluster_count += run.count;
    handle.available += run.count as u64 * cluster_bytes;
    handle.entry.allocated = handle.available;
    Ok(())
}

/// Extends a still-contiguous exFAT file in place when the clusters right
/// after its tail are free; reports false when the fast path cannot apply so
/// the caller can downgrade to an explicit chain.
async fn try_contiguous_extend<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    clusters: u32,
) -> Result<bool, FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if !media.exfat || !handle.contiguous {
        return Ok(false);
    }
    let Some(last) = handle.last else {
        // Empty file: any exact run keeps the no-chain layout.
        let outcome = scan_free_runs(media, dev, clusters).await?;
        let Some(start) = outcome.exact else {
            return Ok(false);
        };
        let tail = ClusterId::new(start.raw() + clusters - 1).ok_or(FsError::NoMoreSpace)?;
        if media.fault_tolerant {
            journal
                .stage_chain_splice(ChainSplice {
                    old_head: None,
                    old_tail: None,
                    new_head: start,
                    new_tail: tail,
                })
                .await
                .map_err(FsError::Device)?;
        }
        let run = reserve_contiguous(media, dev, start, clusters, false).await?;
        handle.first = Some(run.head);
        handle.entry.first_cluster = run.head.raw();
        handle.last = Some(run.tail);
        handle.cluster_count = run.count;
        handle.consecutive = run.count;
        handle.available += run.count as u64 * geometry::bytes_per_cluster(media);
        handle.entry.allocated = handle.available;
        handle.entry.contiguous = true;
        return Ok(true);
    };
    if last.raw() as u64 + clusters as u64 > geometry::max_cluster(media) as u64 {
        return Ok(false);
    }
    for index in 1..=clusters {
        let cluster = ClusterId::new(last.raw() + index).ok_or(FsError::NoMoreSpace)?;
        if !table::slot_free(media, dev, cluster).await? {
            return Ok(false);
        }
    }

    let head = last.next_physical();
    if media.fault_tolerant {
        journal
            .stage_chain_splice(ChainSplice {
                old_head: None,
                old_tail: Some(last),
                new_head: head,
                new_tail: ClusterId::new(last.raw() + clusters)
                    .ok_or(FsError::NoMoreSpace)?,
            })
            .await
            .map_err(FsError::Device)?;
    }
    let run = reserve_contiguous(media, dev, head, clusters, false).await?;

    let cluster_bytes = geometry::bytes_per_cluster(media);
    handle.last = Some(run.tail);
    handle.cluster_count += run.count;
    handle.consecutive = handle.cluster_count;
    handle.available += run.count as u64 * cluster_bytes;
    handle.entry.allocated = handle.available;
    Ok(true)
}

/// Grows a file's chain by `clusters`, preferring a contiguous run but
/// falling back to scattered first-fit clusters. Used by the write engine's
/// allocate-on-write path.
pub(crate) async fn extend_clusters<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    clusters: u32,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if clusters == 0 {
        return Ok(());
    }
    if clusters > media.available_clusters {
        return Err(FsError::NoMoreSpace);
    }
    if try_contiguous_extend(media, dev, journal, handle, clusters).await? {
        return Ok(());
    }
    ensure_chained(media, dev, handle).await?;

    let outcome = scan_free_runs(media, dev, clusters).await?;
    let run = match outcome.exact {
        Some(start) => reserve_contiguous(media, dev, start, clusters, true).await?,
        None => reserve_scattered(media, dev, clusters).await?,
    };
    splice_extend(media, dev, journal, handle, run).await
}

fn allocation_slack(handle: &FileHandle) -> u64 {
    handle.available - handle.size
}

/// Exact allocation: reserves enough clusters past the file's end for
/// `bytes` more bytes, from one physically contiguous run, or fails whole.
pub(crate) async fn allocate_exact<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    bytes: u64,
) -> Result<u64, FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if bytes == 0 {
        return Ok(0);
    }
    if allocation_slack(handle) >= bytes {
        return Ok(bytes);
    }
    if handle.size.saturating_add(bytes) > geometry::max_file_bytes(media) {
        return Err(FsError::NoMoreSpace);
    }

    let cluster_bytes = geometry::bytes_per_cluster(media);
    let needed =
        geometry::clusters_for_bytes(bytes - allocation_slack(handle), cluster_bytes) as u32;
    if media.available_clusters == 0 || needed > media.available_clusters {
        return Err(FsError::NoMoreSpace);
    }

    if try_contiguous_extend(media, dev, journal, handle, needed).await? {
        handle.modified = true;
        return Ok(bytes);
    }

    let outcome = scan_free_runs(media, dev, needed).await?;
    let start = outcome.exact.ok_or(FsError::NoMoreSpace)?;
    ensure_chained(media, dev, handle).await?;
    let run = reserve_contiguous(media, dev, start, needed, true).await?;
    splice_extend(media, dev, journal, handle, run).await?;
    handle.modified = true;
    Ok(bytes)
}

/// Best-effort allocation: grants the requested bytes when a matching run
/// exists, otherwise the longest free run found. Never grants more than
/// requested; zero free clusters with a shortfall is a hard `NoMoreSpace`.
pub(crate) async fn allocate_best_effort<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    handle: &mut FileHandle,
    bytes: u64,
) -> Result<u64, FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if bytes == 0 {
        return Ok(0);
    }
    // Non-exFAT size fields are 32-bit; an oversized request saturates at the
    // largest representable file size instead of failing.
    let ceiling = geometry::max_file_bytes(media);
    let bytes = core::cmp::min(bytes, ceiling.saturating_sub(handle.size));
    let slack = allocation_slack(handle);
    if slack >= bytes {
        return Ok(bytes);
    }
    if media.available_clusters == 0 {
        return Err(FsError::NoMoreSpace);
    }

    let cluster_bytes = geometry::bytes_per_cluster(media);
    let needed = geometry::clusters_for_bytes(bytes - slack, cluster_bytes) as u32;

    if try_contiguous_extend(media, dev, journal, handle, needed).await? {
        handle.modified = true;
        return Ok(bytes);
    }
    ensure_chained(media, dev, handle).await?;

    let outcome = scan_free_runs(media, dev, needed).await?;
    let run = match (outcome.exact, outcome.longest) {
        (Some(start), _) => reserve_contiguous(media, dev, start, needed, true).await?,
        (None, Some((start, len))) => reserve_contiguous(media, dev, start, len, true).await?,
        (None, None) => return Err(FsError::NoMoreSpace),
    };
    let reserved = run.count as u64 * cluster_bytes;
    splice_extend(media, dev, journal, handle, run).await?;
    handle.modified = true;
    Ok(core::cmp::min(bytes, slack + reserved))
}

/// Frees `count` clusters of a detached or superseded run, walking its links
/// and logging every release when fault tolerance is on.
pub(crate) async fn release_run<D, J>(
    media: &mut Media,
    dev: &mut D,
    journal: &mut J,
    head: ClusterId,
    count: u32,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    let mut cluster = head;
    for index in 0..count {
        let link = table::read_link(media, dev, cluster).await?;
        if media.fault_tolerant {
            journal
                .log_release(cluster)
                .await
                .map_err(FsError::Device)?;
        }
        table::release_slot(media, dev, cluster).await?;
        media.available_clusters = media.available_clusters.saturating_add(1);
        if index + 1 < count {
            match link {
                Link::Next(next) => cluster = next,
                _ => return Err(FsError::FileCorrupt),
            }
        }
    }
    Ok(())
}
