use crate::device::BlockDevice;
use crate::fs::core::{ClusterId, FsError, Media};

/// Intent record for replacing a section of a cluster chain. `old_head`/`old_tail`
/// bound the run being superseded (`None` for a pure append at the chain tail);
/// `new_head`/`new_tail` bound the replacement run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainSplice {
    pub old_head: Option<ClusterId>,
    pub old_tail: Option<ClusterId>,
    pub new_head: ClusterId,
    pub new_tail: ClusterId,
}

/// Write-ahead fault-tolerance log contract. The on-disk format and the
/// mount-time replay/undo routine live with the log implementation; this
/// engine only brackets its chain mutations through these calls.
#[allow(async_fn_in_trait)]
pub trait FaultLog<E> {
    async fn transaction_start(&mut self) -> Result<(), E>;
    async fn transaction_end(&mut self) -> Result<(), E>;
    async fn transaction_fail(&mut self) -> Result<(), E>;
    async fn stage_chain_splice(&mut self, splice: ChainSplice) -> Result<(), E>;
    async fn log_release(&mut self, cluster: ClusterId) -> Result<(), E>;
    fn enabled(&self) -> bool;
}

/// Disabled log: every bracket is a no-op and fault-tolerant write paths
/// are skipped entirely.
pub struct NoJournal;

impl<E> FaultLog<E> for NoJournal {
    async fn transaction_start(&mut self) -> Result<(), E> {
        Ok(())
    }

    async fn transaction_end(&mut self) -> Result<(), E> {
        Ok(())
    }

    async fn transaction_fail(&mut self) -> Result<(), E> {
        Ok(())
    }

    async fn stage_chain_splice(&mut self, _splice: ChainSplice) -> Result<(), E> {
        Ok(())
    }

    async fn log_release(&mut self, _cluster: ClusterId) -> Result<(), E> {
        Ok(())
    }

    fn enabled(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxPhase {
    Idle,
    Started,
    Committing,
    Failed,
}

pub(crate) async fn tx_start<D, J>(
    media: &mut Media,
    journal: &mut J,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if !media.fault_tolerant || !journal.enabled() || media.tx_phase != TxPhase::Idle {
        return Ok(());
    }
    journal.transaction_start().await.map_err(FsError::Device)?;
    media.tx_phase = TxPhase::Started;
    Ok(())
}

pub(crate) async fn tx_commit<D, J>(
    media: &mut Media,
    journal: &mut J,
) -> Result<(), FsError<D::Error>>
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if media.tx_phase != TxPhase::Started {
        return Ok(());
    }
    media.tx_phase = TxPhase::Committing;
    journal.transaction_end().await.map_err(FsError::Device)?;
    media.tx_phase = TxPhase::Idle;
    Ok(())
}

/// Marks an interrupted transaction failed so the mount-time replay can
/// unwind it. The log's own error is swallowed: the operation that got us
/// here already carries the primary failure.
pub(crate) async fn tx_abort<D, J>(media: &mut Media, journal: &mut J)
where
    D: BlockDevice,
    J: FaultLog<D::Error>,
{
    if media.tx_phase == TxPhase::Started || media.tx_phase == TxPhase::Committing {
        media.tx_phase = TxPhase::Failed;
        let _ = journal.transaction_fail().await;
    }
    media.tx_phase = TxPhase::Idle;
}
