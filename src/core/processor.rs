//! Background block processing.
//!
//! Blocks are queued from any thread and validated one at a time on a
//! dedicated worker that owns the [`Validator`]. The queue is bounded;
//! producers block while it is full. A storage failure stops the worker
//! and drops whatever is still queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::core::branch::BranchId;
use crate::core::params::{MAX_BLOCK_QUEUE, MAX_BRANCH_CACHE};
use crate::core::types::{hash_to_hex, Block, Hash256};
use crate::core::validator::{network_time_now, BlockStatus, ChainSummary, SharedState, Validator, ValidatorEvents};
use crate::storage::ChainStore;

/// A block waiting for the worker.
pub struct QueuedBlock<C> {
    pub block: Block,
    pub network_time: u64,
    pub ctx: C,
}

/// Why a block was not queued. The block is handed back.
pub enum QueueError<C> {
    Full(QueuedBlock<C>),
    Stopped(QueuedBlock<C>),
}

impl<C> std::fmt::Debug for QueueError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full(q) => write!(f, "Full({})", hash_to_hex(&q.block.hash())),
            QueueError::Stopped(q) => write!(f, "Stopped({})", hash_to_hex(&q.block.hash())),
        }
    }
}

impl<C> std::fmt::Display for QueueError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full(_) => write!(f, "block queue is full"),
            QueueError::Stopped(_) => write!(f, "block processor has stopped"),
        }
    }
}

impl<C> std::error::Error for QueueError<C> {}

struct Queue<C> {
    items: VecDeque<QueuedBlock<C>>,
    in_flight: Option<Hash256>,
    stopping: bool,
}

struct Channel<C> {
    queue: Mutex<Queue<C>>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
}

pub struct BlockProcessor<E: ValidatorEvents> {
    channel: Arc<Channel<E::Context>>,
    shared: Arc<Mutex<SharedState>>,
    store: Arc<ChainStore>,
    worker: Option<JoinHandle<Validator<E>>>,
}

impl<E> BlockProcessor<E>
where
    E: ValidatorEvents + Send + 'static,
    E::Context: Send + 'static,
{
    /// Move the validator onto a new worker thread.
    pub fn start(validator: Validator<E>) -> std::io::Result<Self> {
        let channel = Arc::new(Channel {
            queue: Mutex::new(Queue { items: VecDeque::new(), in_flight: None, stopping: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
        });
        let shared = validator.shared();
        let store = Arc::clone(validator.store());

        let worker_channel = Arc::clone(&channel);
        let worker = std::thread::Builder::new()
            .name("block-processor".into())
            .spawn(move || run_worker(validator, worker_channel))?;

        tracing::info!("⚙️ Block processor started");
        Ok(BlockProcessor { channel, shared, store, worker: Some(worker) })
    }

    /// Queue a block stamped with the current time, waiting for room.
    pub fn queue_block(&self, block: Block, ctx: E::Context) -> Result<(), QueueError<E::Context>> {
        self.queue_block_at(block, network_time_now(), ctx)
    }

    /// Queue a block, waiting while the queue is full.
    pub fn queue_block_at(&self, block: Block, network_time: u64, ctx: E::Context) -> Result<(), QueueError<E::Context>> {
        let item = QueuedBlock { block, network_time, ctx };
        let mut queue = self.channel.queue.lock();
        while queue.items.len() >= MAX_BLOCK_QUEUE && !queue.stopping {
            self.channel.not_full.wait(&mut queue);
        }
        if queue.stopping {
            return Err(QueueError::Stopped(item));
        }
        queue.items.push_back(item);
        self.channel.not_empty.notify_one();
        Ok(())
    }

    /// Queue a block only if there is room right now.
    pub fn try_queue_block(&self, block: Block, network_time: u64, ctx: E::Context) -> Result<(), QueueError<E::Context>> {
        let item = QueuedBlock { block, network_time, ctx };
        let mut queue = self.channel.queue.lock();
        if queue.stopping {
            return Err(QueueError::Stopped(item));
        }
        if queue.items.len() >= MAX_BLOCK_QUEUE {
            return Err(QueueError::Full(item));
        }
        queue.items.push_back(item);
        self.channel.not_empty.notify_one();
        Ok(())
    }

    /// Whether a block is queued, being processed, held as an orphan or
    /// stored.
    pub fn block_known(&self, hash: &Hash256) -> bool {
        {
            let queue = self.channel.queue.lock();
            if queue.in_flight.as_ref() == Some(hash) || queue.items.iter().any(|q| q.block.hash() == *hash) {
                return true;
            }
        }
        if self.shared.lock().orphans.contains(hash) {
            return true;
        }
        match self.store.block_exists(hash) {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!("⚠️ Block lookup failed: {}", e);
                false
            }
        }
    }

    /// Mark a branch as busy so the validator will not evict it.
    pub fn set_working(&self, branch: BranchId, count: u16) {
        if (branch as usize) < MAX_BRANCH_CACHE {
            self.shared.lock().working[branch as usize] = count;
        }
    }

    pub fn summary(&self) -> ChainSummary {
        self.shared.lock().summary.clone()
    }

    /// Block until every queued block has been processed.
    pub fn wait_idle(&self) {
        let mut queue = self.channel.queue.lock();
        while !queue.items.is_empty() || queue.in_flight.is_some() {
            self.channel.idle.wait(&mut queue);
        }
    }

    /// Process what is queued, stop the worker and flush the store. Hands
    /// the validator back.
    pub fn shutdown(mut self) -> Option<Validator<E>> {
        self.stop()
    }

    fn stop(&mut self) -> Option<Validator<E>> {
        let worker = self.worker.take()?;
        {
            let mut queue = self.channel.queue.lock();
            queue.stopping = true;
        }
        self.channel.not_empty.notify_all();
        self.channel.not_full.notify_all();
        match worker.join() {
            Ok(validator) => {
                tracing::info!("⚙️ Block processor stopped");
                Some(validator)
            }
            Err(_) => {
                tracing::error!("❌ Block processor thread panicked");
                None
            }
        }
    }
}

impl<E: ValidatorEvents> Drop for BlockProcessor<E> {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else { return };
        self.channel.queue.lock().stopping = true;
        self.channel.not_empty.notify_all();
        self.channel.not_full.notify_all();
        let _ = worker.join();
    }
}

/// Clear the in-flight marker. After a storage failure the processor is
/// marked stopped and the backlog dropped; returns whether to keep going.
fn finish_block<C>(channel: &Channel<C>, status: BlockStatus) -> bool {
    let mut queue = channel.queue.lock();
    queue.in_flight = None;
    let keep_going = status != BlockStatus::Error;
    if !keep_going {
        tracing::error!("❌ Block processor stopping after a storage failure, {} queued blocks dropped", queue.items.len());
        queue.stopping = true;
        queue.items.clear();
        channel.not_full.notify_all();
    }
    if queue.items.is_empty() {
        channel.idle.notify_all();
    }
    keep_going
}

fn run_worker<E: ValidatorEvents>(mut validator: Validator<E>, channel: Arc<Channel<E::Context>>) -> Validator<E> {
    loop {
        let next = {
            let mut queue = channel.queue.lock();
            while queue.items.is_empty() && !queue.stopping {
                channel.not_empty.wait(&mut queue);
            }
            let next = queue.items.pop_front();
            if let Some(item) = &next {
                queue.in_flight = Some(item.block.hash());
                channel.not_full.notify_one();
            }
            next
        };
        let Some(QueuedBlock { block, network_time, mut ctx }) = next else { break };

        let hash = block.hash();
        let status = validator.process_block(block, network_time, &mut ctx);
        tracing::debug!("⚙️ Processed {}: {:?}", hash_to_hex(&hash), status);
        if !finish_block(&channel, status) {
            break;
        }
    }

    if let Err(e) = validator.shutdown() {
        tracing::error!("❌ Flushing chain state failed: {}", e);
    }
    channel.idle.notify_all();
    validator
}
