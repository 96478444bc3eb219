//! Chunk coordinator: owns the worker pool and drives one chunk of blocks at
//! a time through INIT, PROCESS_OUTPUTS, PROCESS_INPUTS, registration,
//! CONFIRM, publish and RESET.
//!
//! Every phase is a counting barrier: the coordinator sends one operation per
//! slot and waits until the same number of replies came back on the shared
//! reply channel. A failed reply still counts; the slot is then skipped for the
//! rest of the chunk and reported for re-scan instead of stalling the others.
//!
//! A chunk runs on a spawned task that holds the chunk lock from INIT to the
//! RESET barrier, so a caller that stops waiting never leaves workers mid-phase.
use std::sync::Arc;

use bitcoin::Txid;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    broadcast::BroadcastSet,
    config::PipelineConfig,
    dedupe::DedupeCache,
    error::{ChunkError, WorkerError},
    headers::BlockHeader,
    node::NodeSource,
    notify::{NotificationSink, Topic},
    store::{NewBlock, Store},
    tx::DecodedTransaction,
    worker::{BlockWorker, Op, OpKind, Reply, SlotReply, WorkerHandle},
};

/// A header of the chunk and the store id it was registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredBlock {
    /// The processed header.
    pub header: BlockHeader,
    /// Store id, `None` if registration failed.
    pub id: Option<i64>,
}

/// Outcome of one [`ChunkCoordinator::process_chunk`] call.
#[derive(Debug, Clone, Default)]
pub struct ChunkReport {
    /// Chunk headers in ascending height order.
    pub blocks: Vec<RegisteredBlock>,
    /// Published transactions, de-duplicated, in first-seen order.
    pub broadcast: Vec<Arc<DecodedTransaction>>,
    /// Ids the workers marked confirmed.
    pub confirmed: Vec<Txid>,
    /// Blocks with a gap in indexed data: a phase failed or the block was
    /// indexed as empty. The chain walker should schedule them again.
    pub rescan: Vec<BlockHeader>,
}

struct Slot {
    header: BlockHeader,
    healthy: bool,
    degraded: bool,
    block_id: Option<i64>,
}

impl Slot {
    fn new(header: BlockHeader) -> Self {
        Self {
            header,
            healthy: true,
            degraded: false,
            block_id: None,
        }
    }
}

/// Coordinator of a fixed pool of block workers.
pub struct ChunkCoordinator<S: ?Sized, P: ?Sized> {
    pool: Arc<Pool<S, P>>,
}

/// State shared with the task that runs a chunk.
struct Pool<S: ?Sized, P: ?Sized> {
    workers: Vec<WorkerHandle>,
    /// Holding this lock is holding the chunk: one chunk in flight at a time.
    replies: Mutex<mpsc::UnboundedReceiver<SlotReply>>,
    store: Arc<S>,
    sink: Arc<P>,
}

impl<S, P> ChunkCoordinator<S, P>
where
    S: Store + ?Sized + 'static,
    P: NotificationSink + ?Sized + 'static,
{
    /// Spawn `config.worker_count` persistent workers.
    ///
    /// Must be called from within a tokio runtime. The workers live as long as
    /// the coordinator.
    pub fn initialize<N>(
        config: &PipelineConfig,
        store: Arc<S>,
        node: Arc<N>,
        sink: Arc<P>,
        cache: Arc<DedupeCache>,
    ) -> Self
    where
        N: NodeSource + ?Sized + 'static,
    {
        let (reply_sender, reply_receiver) = mpsc::unbounded_channel();
        let workers: Vec<WorkerHandle> = (0..config.worker_count.max(1))
            .map(|id| {
                let worker = BlockWorker::new(
                    id,
                    config,
                    Arc::clone(&store),
                    Arc::clone(&node),
                    Arc::clone(&cache),
                );
                WorkerHandle::spawn(worker, reply_sender.clone())
            })
            .collect();
        info!(workers = workers.len(), "block worker pool started");

        Self {
            pool: Arc::new(Pool {
                workers,
                replies: Mutex::new(reply_receiver),
                store,
                sink,
            }),
        }
    }

    /// Size of the worker pool, and so the largest chunk accepted.
    pub fn worker_count(&self) -> usize {
        self.pool.workers.len()
    }

    /// Process one chunk of headers, one block per worker.
    ///
    /// Waits while another chunk is in flight. Per-block failures are logged
    /// and surface in [`ChunkReport::rescan`]; they never fail the call.
    ///
    /// The chunk runs on its own task. Dropping the returned future does not
    /// stop it: the chunk still walks every phase through RESET, and the next
    /// call waits until it has.
    ///
    /// # Errors
    /// [`ChunkError::Empty`] for no headers, [`ChunkError::TooLarge`] for more
    /// headers than workers, [`ChunkError::Aborted`] if the chunk task died.
    pub async fn process_chunk(&self, headers: Vec<BlockHeader>) -> Result<ChunkReport, ChunkError> {
        if headers.is_empty() {
            return Err(ChunkError::Empty);
        }
        if headers.len() > self.worker_count() {
            return Err(ChunkError::TooLarge {
                len: headers.len(),
                workers: self.worker_count(),
            });
        }

        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move { pool.run_chunk(headers).await })
            .await
            .map_err(|e| {
                error!("chunk task failed: {e}");
                ChunkError::Aborted(e.to_string())
            })
    }
}

impl<S, P> Pool<S, P>
where
    S: Store + ?Sized + 'static,
    P: NotificationSink + ?Sized + 'static,
{
    async fn run_chunk(&self, mut headers: Vec<BlockHeader>) -> ChunkReport {
        let mut replies = self.replies.lock().await;
        while let Ok((slot, stale)) = replies.try_recv() {
            warn!(slot, "discarding stale worker reply: {stale:?}");
        }

        headers.sort_by_key(|h| h.height);
        let mut slots: Vec<Slot> = headers.into_iter().map(Slot::new).collect();
        let mut broadcast = BroadcastSet::default();
        info!(
            from = slots[0].header.height,
            to = slots[slots.len() - 1].header.height,
            blocks = slots.len(),
            "processing chunk"
        );

        let inits = self
            .run_phase(&mut replies, &mut slots, OpKind::Init, |s| {
                Some(Op::Init(s.header))
            })
            .await;
        for (slot, reply) in inits {
            if let Reply::Initialized { degraded: true } = reply {
                slots[slot].degraded = true;
            }
        }

        for op in [Op::ProcessOutputs, Op::ProcessInputs] {
            let kind = op.kind();
            let phase = self.run_phase(&mut replies, &mut slots, kind, |_| Some(op.clone()));
            for (_, reply) in phase.await {
                if let Reply::Candidates(txs) = reply {
                    broadcast.extend(txs);
                }
            }
        }

        self.register_blocks(&mut slots).await;

        let mut confirmed = Vec::new();
        let confirms = self
            .run_phase(&mut replies, &mut slots, OpKind::Confirm, |s| {
                s.block_id.map(Op::Confirm)
            })
            .await;
        for (_, reply) in confirms {
            if let Reply::Confirmed(ids) = reply {
                confirmed.extend(ids);
            }
        }

        self.publish(&broadcast, &slots).await;

        self.run_phase(&mut replies, &mut slots, OpKind::Reset, |_| Some(Op::Reset))
            .await;
        drop(replies);

        let rescan: Vec<BlockHeader> = slots
            .iter()
            .filter(|s| !s.healthy || s.degraded)
            .map(|s| s.header)
            .collect();
        if !rescan.is_empty() {
            warn!(blocks = rescan.len(), "chunk finished with blocks needing re-scan");
        }
        info!(
            broadcast = broadcast.len(),
            confirmed = confirmed.len(),
            "chunk done"
        );

        ChunkReport {
            blocks: slots
                .iter()
                .map(|s| RegisteredBlock {
                    header: s.header,
                    id: s.block_id,
                })
                .collect(),
            broadcast: broadcast.into_vec(),
            confirmed,
            rescan,
        }
    }

    /// Dispatch one phase and wait for its barrier.
    ///
    /// Unhealthy slots (and slots for which `make_op` yields nothing) are not
    /// dispatched and count as failed; RESET goes to every slot. Returns the
    /// successful replies by slot.
    async fn run_phase<F>(
        &self,
        replies: &mut mpsc::UnboundedReceiver<SlotReply>,
        slots: &mut [Slot],
        kind: OpKind,
        make_op: F,
    ) -> Vec<(usize, Reply)>
    where
        F: Fn(&Slot) -> Option<Op>,
    {
        let mut outcomes: Vec<Option<Result<Reply, WorkerError>>> =
            (0..slots.len()).map(|_| None).collect();
        let mut dispatched = 0usize;

        for (i, slot) in slots.iter().enumerate() {
            let op = if slot.healthy || kind == OpKind::Reset {
                make_op(slot)
            } else {
                None
            };
            let Some(op) = op else {
                outcomes[i] = Some(Err(WorkerError::Fenced(i)));
                continue;
            };
            match self.workers[i].send(op).await {
                Ok(()) => dispatched += 1,
                Err(e) => outcomes[i] = Some(Err(e)),
            }
        }

        let mut received = 0usize;
        while received < dispatched {
            match replies.recv().await {
                Some((slot, result)) if slot < outcomes.len() && outcomes[slot].is_none() => {
                    outcomes[slot] = Some(result);
                    received += 1;
                }
                Some((slot, result)) => {
                    warn!(slot, op = %kind, "unexpected worker reply: {result:?}");
                }
                None => {
                    error!(op = %kind, "every worker stopped before the phase completed");
                    break;
                }
            }
        }
        debug!(op = %kind, dispatched, received, "phase barrier reached");

        let mut successes = Vec::with_capacity(received);
        for (i, outcome) in outcomes.into_iter().enumerate() {
            let slot = &mut slots[i];
            match outcome.unwrap_or(Err(WorkerError::Unavailable(i))) {
                Ok(reply) => successes.push((i, reply)),
                Err(WorkerError::Fenced(_)) if !slot.healthy => {}
                Err(e) => {
                    warn!(slot = i, height = slot.header.height, op = %kind, "{e}");
                    slot.healthy = false;
                }
            }
        }
        successes
    }

    /// Insert block rows in ascending height so a child's parent lookup finds
    /// the parent registered a moment earlier.
    async fn register_blocks(&self, slots: &mut [Slot]) {
        for slot in slots.iter_mut() {
            match self.register(&slot.header).await {
                Ok(id) => {
                    debug!(height = slot.header.height, id, "block registered");
                    slot.block_id = Some(id);
                }
                Err(e) => {
                    error!(height = slot.header.height, hash = %slot.header.hash, "block registration failed: {e:#}");
                    slot.healthy = false;
                }
            }
        }
    }

    async fn register(&self, header: &BlockHeader) -> anyhow::Result<i64> {
        let parent_id = self
            .store
            .get_block_by_hash(header.prev_hash)
            .await?
            .map(|parent| parent.id);
        self.store
            .add_block(NewBlock {
                height: header.height,
                hash: header.hash,
                time: header.time,
                parent_id,
            })
            .await
    }

    async fn publish(&self, broadcast: &BroadcastSet, slots: &[Slot]) {
        for tx in broadcast.iter() {
            self.publish_json(Topic::Transaction, tx.as_ref()).await;
        }
        for slot in slots {
            self.publish_json(Topic::Block, &slot.header).await;
        }
    }

    async fn publish_json<T: Serialize + ?Sized>(&self, topic: Topic, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%topic, "failed to serialize notification: {e}");
                return;
            }
        };
        if let Err(e) = self.sink.publish(topic, payload).await {
            warn!(%topic, "failed to publish notification: {e:#}");
        }
    }
}
