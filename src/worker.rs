//! Block worker: one execution unit owning at most one [`Block`], driven
//! through an explicit state machine by typed operation messages.
//!
//! ```text
//! Idle --Init--> Initialized --ProcessOutputs--> OutputsProcessed
//!      --ProcessInputs--> InputsProcessed --Confirm--> TxsConfirmed
//! any state --Reset--> Idle
//! ```
use std::{collections::HashSet, fmt, panic::AssertUnwindSafe, sync::Arc};

use bitcoin::{Network, Txid};
use futures::FutureExt;
use tokio::{
    sync::mpsc,
    task::{self, JoinHandle},
};
use tracing::{debug, error, warn};

use crate::{
    block::Block,
    config::PipelineConfig,
    dedupe::DedupeCache,
    error::WorkerError,
    headers::BlockHeader,
    node::NodeSource,
    prefilter::FilterLimits,
    store::Store,
    tx::DecodedTransaction,
};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// No block held.
    Idle,
    /// Block fetched and decoded.
    Initialized,
    /// Output pass done.
    OutputsProcessed,
    /// Input pass done.
    InputsProcessed,
    /// Candidates confirmed in the registered block.
    TxsConfirmed,
}

/// Operation without its payload, used for transitions, errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// See [`Op::Init`].
    Init,
    /// See [`Op::ProcessOutputs`].
    ProcessOutputs,
    /// See [`Op::ProcessInputs`].
    ProcessInputs,
    /// See [`Op::Confirm`].
    Confirm,
    /// See [`Op::Reset`].
    Reset,
}

/// Message sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Fetch and decode the block for this header.
    Init(BlockHeader),
    /// Run the output pass and persist matched outputs.
    ProcessOutputs,
    /// Run the input pass and persist matched inputs.
    ProcessInputs,
    /// Confirm collected candidates in the block with this store id.
    Confirm(i64),
    /// Drop the block and collected candidates.
    Reset,
}

/// Successful reply to an [`Op`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Block loaded; `degraded` when it had to be indexed as empty.
    Initialized {
        /// The block could not be fetched or decoded.
        degraded: bool,
    },
    /// Transactions selected by the output or input pass.
    Candidates(Vec<Arc<DecodedTransaction>>),
    /// De-duplicated ids marked confirmed.
    Confirmed(Vec<Txid>),
    /// Worker is idle again.
    Reset,
}

impl WorkerState {
    /// State reached by applying `op`, or the error for an illegal pair.
    pub fn next(self, op: OpKind) -> Result<WorkerState, WorkerError> {
        use OpKind as O;
        use WorkerState as S;
        match (self, op) {
            (_, O::Reset) => Ok(S::Idle),
            (S::Idle, O::Init) => Ok(S::Initialized),
            (S::Initialized, O::ProcessOutputs) => Ok(S::OutputsProcessed),
            (S::OutputsProcessed, O::ProcessInputs) => Ok(S::InputsProcessed),
            (S::InputsProcessed, O::Confirm) => Ok(S::TxsConfirmed),
            (state, op) => Err(WorkerError::InvalidTransition { state, op }),
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "IDLE",
            WorkerState::Initialized => "INITIALIZED",
            WorkerState::OutputsProcessed => "OUTPUTS_PROCESSED",
            WorkerState::InputsProcessed => "INPUTS_PROCESSED",
            WorkerState::TxsConfirmed => "TXS_CONFIRMED",
        };
        f.write_str(s)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Init => "INIT",
            OpKind::ProcessOutputs => "PROCESS_OUTPUTS",
            OpKind::ProcessInputs => "PROCESS_INPUTS",
            OpKind::Confirm => "CONFIRM",
            OpKind::Reset => "RESET",
        };
        f.write_str(s)
    }
}

impl Op {
    /// Payload-free kind of this operation.
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Init(_) => OpKind::Init,
            Op::ProcessOutputs => OpKind::ProcessOutputs,
            Op::ProcessInputs => OpKind::ProcessInputs,
            Op::Confirm(_) => OpKind::Confirm,
            Op::Reset => OpKind::Reset,
        }
    }
}

/// A worker's private state. Handles one operation at a time.
pub struct BlockWorker<S: ?Sized, N: ?Sized> {
    id: usize,
    state: WorkerState,
    block: Option<Block>,
    candidates: Vec<Arc<DecodedTransaction>>,
    store: Arc<S>,
    node: Arc<N>,
    cache: Arc<DedupeCache>,
    network: Network,
    limits: FilterLimits,
    confirm_batch: usize,
}

impl<S, N> BlockWorker<S, N>
where
    S: Store + ?Sized + 'static,
    N: NodeSource + ?Sized + 'static,
{
    /// Idle worker using the collaborators and batch sizes from `config`.
    pub fn new(
        id: usize,
        config: &PipelineConfig,
        store: Arc<S>,
        node: Arc<N>,
        cache: Arc<DedupeCache>,
    ) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            block: None,
            candidates: Vec::new(),
            store,
            node,
            cache,
            network: config.network,
            limits: config.filter_limits(),
            confirm_batch: config.confirm_batch_size,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The block currently held, if any.
    pub fn block(&self) -> Option<&Block> {
        self.block.as_ref()
    }

    /// Apply one operation.
    ///
    /// The state only advances when the operation succeeds; a rejected or
    /// failed operation leaves the worker exactly as it was.
    pub async fn handle(&mut self, op: Op) -> Result<Reply, WorkerError> {
        let next = self.state.next(op.kind())?;
        let reply = match op {
            Op::Init(header) => self.init(header).await?,
            Op::ProcessOutputs => {
                let block = self.held_block(OpKind::ProcessOutputs)?;
                let found = block.process_outputs(&*self.store, &self.cache).await?;
                self.candidates.extend(found.iter().cloned());
                Reply::Candidates(found)
            }
            Op::ProcessInputs => {
                let block = self.held_block(OpKind::ProcessInputs)?;
                let found = block.process_inputs(&*self.store).await?;
                self.candidates.extend(found.iter().cloned());
                Reply::Candidates(found)
            }
            Op::Confirm(block_id) => {
                let ids = self.unique_candidate_ids();
                self.held_block(OpKind::Confirm)?
                    .confirm_transactions(&*self.store, &ids, block_id, self.confirm_batch)
                    .await?;
                Reply::Confirmed(ids)
            }
            Op::Reset => {
                self.block = None;
                self.candidates.clear();
                Reply::Reset
            }
        };
        self.state = next;
        Ok(reply)
    }

    async fn init(&mut self, header: BlockHeader) -> Result<Reply, WorkerError> {
        let block = match self.node.get_raw_block(header.hash).await {
            Ok(raw) => {
                let (network, limits) = (self.network, self.limits);
                task::spawn_blocking(move || Block::decode(&raw, header, network, limits))
                    .await
                    .map_err(|e| WorkerError::Crashed(format!("decode task failed: {e}")))?
            }
            Err(e) => {
                warn!(worker = self.id, height = header.height, "block fetch failed, indexing as empty: {e:#}");
                Block::empty(header)
            }
        };
        let degraded = block.is_degraded();
        self.block = Some(block);
        self.candidates.clear();
        Ok(Reply::Initialized { degraded })
    }

    fn held_block(&self, op: OpKind) -> Result<&Block, WorkerError> {
        // Every state past Idle holds a block.
        self.block.as_ref().ok_or(WorkerError::InvalidTransition {
            state: self.state,
            op,
        })
    }

    fn unique_candidate_ids(&self) -> Vec<Txid> {
        let mut seen = HashSet::with_capacity(self.candidates.len());
        self.candidates
            .iter()
            .map(|tx| tx.id)
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Reply tagged with the slot it came from.
pub(crate) type SlotReply = (usize, Result<Reply, WorkerError>);

/// Coordinator-side handle to a running worker task.
pub(crate) struct WorkerHandle {
    id: usize,
    sender: mpsc::Sender<Op>,
    _handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Runs `worker` in a new tokio task.
    ///
    /// Every operation produces exactly one message on `replies`, including
    /// when the worker panics while handling it.
    pub(crate) fn spawn<S, N>(
        mut worker: BlockWorker<S, N>,
        replies: mpsc::UnboundedSender<SlotReply>,
    ) -> Self
    where
        S: Store + ?Sized + 'static,
        N: NodeSource + ?Sized + 'static,
    {
        let id = worker.id;
        let (sender, mut receiver) = mpsc::channel::<Op>(1);

        let handle = tokio::spawn(async move {
            while let Some(op) = receiver.recv().await {
                let kind = op.kind();
                debug!(worker = id, op = %kind, state = %worker.state(), "handling");
                let result = match AssertUnwindSafe(worker.handle(op)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(worker = id, op = %kind, "worker panicked: {msg}");
                        Err(WorkerError::Crashed(msg))
                    }
                };
                if replies.send((id, result)).is_err() {
                    break;
                }
            }
            debug!(worker = id, "worker stopped");
        });

        Self {
            id,
            sender,
            _handle: handle,
        }
    }

    /// Hand `op` to the worker. Fails only if the worker task is gone.
    pub(crate) async fn send(&self, op: Op) -> Result<(), WorkerError> {
        self.sender
            .send(op)
            .await
            .map_err(|_| WorkerError::Unavailable(self.id))
    }
}
