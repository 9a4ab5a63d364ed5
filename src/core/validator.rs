//! Block and chain validator.
//!
//! Every block passes basic validation, then lands on a branch: it extends
//! the branch whose tip is its parent, or starts a new branch forking off
//! the parent. At most [`MAX_BRANCH_CACHE`] branches live at once; when all
//! slots are taken the lowest idle side branch is evicted (merged into its
//! deepest dependent if it has any). The branch with the most cumulative
//! work is the main chain and the UTXO set always reflects it.
//!
//! Store changes made while processing one block sit in the store's
//! current change set; a block that fails is reverted as a whole. Branch
//! and main-chain notifications are held back until the block commits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use parking_lot::Mutex;

use crate::core::branch::*;
use crate::core::orphans::OrphanPool;
use crate::core::params::*;
use crate::core::script::ScriptEngine;
use crate::core::types::*;
use crate::core::validation::{self, CheckContext};
use crate::pow;
use crate::storage::{ChainStore, StorageError, ValidatorInfo};

pub use crate::core::validation::{BlockError, ValidatorError};

/// Outcome of processing one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Now the tip of the main chain
    Main,
    /// Stored on a side branch
    Side,
    /// Parent unknown; held in the orphan pool
    Orphan,
    Bad,
    /// Timestamp too far in the future; may become valid later
    BadTime,
    Duplicate,
    /// Would need a new branch and none could be freed
    NoNew,
    /// Storage failed; the block was not processed
    Error,
}

/// How a block joined the main chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddType {
    /// Validated for the first time while reorganising
    New,
    /// Validated earlier, reapplied while reorganising
    Prev,
    /// The block being processed
    Last,
}

#[derive(Debug, Clone, Copy)]
pub struct ValidatorFlags {
    /// Check headers against their target
    pub check_pow: bool,
    /// Check merkle roots and input scripts
    pub full_validation: bool,
}

impl Default for ValidatorFlags {
    fn default() -> Self {
        ValidatorFlags { check_pow: true, full_validation: true }
    }
}

/// Notifications raised while processing. Every method defaults to doing
/// nothing; `Context` is passed through from the caller of
/// [`Validator::process_block`].
#[allow(unused_variables)]
pub trait ValidatorEvents {
    type Context;

    fn on_delete_branch(&mut self, branch: BranchId, ctx: &mut Self::Context) {}
    fn on_new_branch(&mut self, branch: BranchId, parent: BranchId, fork_index: u32, ctx: &mut Self::Context) {}
    fn on_add_block(&mut self, branch: BranchId, block: &Block, height: u32, add: AddType, ctx: &mut Self::Context) {}
    fn on_remove_block(&mut self, branch: BranchId, block: &Block, height: u32, ctx: &mut Self::Context) {}
    fn on_block_finished(&mut self, block: &Block, status: BlockStatus, ctx: &mut Self::Context) {}
    fn on_block_invalid(&mut self, block: &Block, reason: &BlockError, ctx: &mut Self::Context) {}
    fn on_no_new_branches(&mut self, block: &Block, ctx: &mut Self::Context) {}
    fn on_fatal_error(&mut self, error: &StorageError, ctx: &mut Self::Context) {}
}

/// No notifications.
impl ValidatorEvents for () {
    type Context = ();
}

/// Main-chain facts published for other threads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSummary {
    pub main_branch: BranchId,
    pub height: u32,
    pub tip: Hash256,
    pub work: BigUint,
    pub branches: usize,
}

/// State shared with threads outside the validator. Other threads may read
/// everything but only ever change `working`.
#[derive(Debug, Default)]
pub struct SharedState {
    pub orphans: OrphanPool,
    /// Per-branch count of outstanding work; a busy branch is never evicted
    pub working: [u16; MAX_BRANCH_CACHE],
    pub summary: ChainSummary,
}

/// Seconds since the Unix epoch.
pub fn network_time_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct Snapshot {
    branches: Branches,
    main_branch: BranchId,
}

/// A chain change, reported once the attempt that made it commits.
enum ChainEvent {
    NewBranch { branch: BranchId, parent: BranchId, fork_index: u32 },
    DeleteBranch(BranchId),
    Add { branch: BranchId, block: Block, height: u32, add: AddType },
    Remove { branch: BranchId, block: Block, height: u32 },
}

/// Bookkeeping for one placement attempt.
#[derive(Default)]
struct Attempt {
    /// Blocks that passed complete validation
    proven: Vec<BlockLocation>,
    /// Branch ids were reshuffled, so `proven` cannot be replayed
    evicted: bool,
    events: Vec<ChainEvent>,
    /// A merged branch changed id from `.0` to `.1`; its working count follows
    renamed: Option<(BranchId, BranchId)>,
}

fn missing(what: String) -> StorageError {
    StorageError::NotFound(what)
}

pub struct Validator<E: ValidatorEvents> {
    params: NetworkParams,
    flags: ValidatorFlags,
    store: Arc<ChainStore>,
    engine: Box<dyn ScriptEngine>,
    events: E,
    branches: Branches,
    main_branch: BranchId,
    shared: Arc<Mutex<SharedState>>,
}

impl<E: ValidatorEvents> Validator<E> {
    /// Load validator state from the store, writing the genesis block on
    /// first use.
    pub fn open(
        params: NetworkParams,
        flags: ValidatorFlags,
        store: Arc<ChainStore>,
        engine: Box<dyn ScriptEngine>,
        events: E,
    ) -> Result<Self, StorageError> {
        let mut validator = Validator {
            params,
            flags,
            store,
            engine,
            events,
            branches: Default::default(),
            main_branch: 0,
            shared: Arc::new(Mutex::new(SharedState::default())),
        };

        match validator.store.load_validator_info()? {
            Some(info) => validator.load_state(info)?,
            None => validator.init_genesis()?,
        }
        validator.publish_summary();
        Ok(validator)
    }

    fn load_state(&mut self, info: ValidatorInfo) -> Result<(), StorageError> {
        for id in 0..MAX_BRANCH_CACHE {
            self.branches[id] = self.store.load_branch(id as BranchId)?;
        }
        self.main_branch = info.main_branch;
        self.branch(self.main_branch)?;

        let first = info.first_orphan as usize;
        let mut orphans = Vec::with_capacity(info.num_orphans as usize);
        for position in 0..info.num_orphans as usize {
            let slot = (first + position) % MAX_ORPHAN_CACHE;
            if let Some(block) = self.store.load_orphan(slot)? {
                orphans.push((slot, block));
            }
        }
        let orphan_count = orphans.len();
        self.shared.lock().orphans = OrphanPool::restore(first, orphans);

        tracing::info!(
            "💾 Loaded {} chain: main branch {}, height {}, {} branches, {} orphans",
            self.params.name,
            self.main_branch,
            self.main_height(),
            self.branch_count(),
            orphan_count
        );
        Ok(())
    }

    fn init_genesis(&mut self) -> Result<(), StorageError> {
        let genesis = self.params.genesis_block();
        let mut root = Branch::root(genesis.time());
        root.num_blocks = 1;
        root.last_validation = Some(0);
        self.store.save_block(BlockLocation::new(0, 0), &genesis)?;
        self.branches[0] = Some(root);
        self.main_branch = 0;
        self.persist_state()?;
        self.store.stage()?;
        self.store.flush()?;
        tracing::info!("⛓️ Initialised {} chain at genesis {}", self.params.name, hash_to_hex(&genesis.hash()));
        Ok(())
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub fn shared(&self) -> Arc<Mutex<SharedState>> {
        Arc::clone(&self.shared)
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn branches(&self) -> &Branches {
        &self.branches
    }

    pub fn main_branch(&self) -> BranchId {
        self.main_branch
    }

    pub fn main_height(&self) -> u32 {
        self.branches[self.main_branch as usize]
            .as_ref()
            .and_then(Branch::tip_height)
            .unwrap_or(0)
    }

    pub fn main_work(&self) -> BigUint {
        self.branches[self.main_branch as usize].as_ref().map(|b| b.work.clone()).unwrap_or_default()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.iter().flatten().count()
    }

    pub fn summary(&self) -> ChainSummary {
        self.shared.lock().summary.clone()
    }

    /// Stage and force everything pending to disk.
    pub fn shutdown(&self) -> Result<(), StorageError> {
        self.store.stage()?;
        self.store.flush()
    }

    fn branch(&self, id: BranchId) -> Result<&Branch, StorageError> {
        self.branches
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| StorageError::Corrupt(format!("branch {} is not live", id)))
    }

    fn branch_mut(&mut self, id: BranchId) -> Result<&mut Branch, StorageError> {
        self.branches
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| StorageError::Corrupt(format!("branch {} is not live", id)))
    }

    fn load_header(&self, location: BlockLocation) -> Result<BlockHeader, StorageError> {
        self.store
            .load_header(location)?
            .ok_or_else(|| missing(format!("header at {}:{}", location.branch, location.index)))
    }

    fn load_block(&self, location: BlockLocation) -> Result<Block, StorageError> {
        self.store
            .load_block(location)?
            .ok_or_else(|| missing(format!("block at {}:{}", location.branch, location.index)))
    }

    fn main_tip(&self) -> Result<BlockLocation, StorageError> {
        let main = self.branch(self.main_branch)?;
        let index = main.tip_index().ok_or_else(|| StorageError::Corrupt("main branch is empty".into()))?;
        Ok(BlockLocation::new(self.main_branch, index))
    }

    // ─── Entry points ────────────────────────────────────────────────

    /// Checks that need no chain context, in order: not already known, has
    /// transactions, proof of work, timestamp not too far ahead of
    /// `network_time`, merkle root.
    pub fn basic_block_validation(&self, block: &Block, network_time: u64) -> Result<(), ValidatorError> {
        let hash = block.hash();
        if self.shared.lock().orphans.contains(&hash) || self.store.block_exists(&hash)? {
            return Err(BlockError::Duplicate.into());
        }
        if block.transactions.is_empty() {
            return Err(BlockError::NoTransactions.into());
        }
        if self.flags.check_pow && !pow::check_proof_of_work(&hash, block.target(), self.params.max_target) {
            return Err(BlockError::BadProofOfWork.into());
        }
        let limit = network_time + BLOCK_ALLOWED_TIME_DRIFT;
        if block.time() as u64 > limit {
            return Err(BlockError::TimeTooNew { time: block.time(), limit }.into());
        }
        if self.flags.full_validation && block.compute_merkle_root() != block.header().merkle_root {
            return Err(BlockError::BadMerkleRoot.into());
        }
        Ok(())
    }

    /// Validate a block and fold it into the chain state, then promote any
    /// orphans it unblocks.
    pub fn process_block(&mut self, block: Block, network_time: u64, ctx: &mut E::Context) -> BlockStatus {
        let hash = block.hash();
        let status = match self.basic_block_validation(&block, network_time) {
            Err(ValidatorError::Rejected(reason)) => {
                let status = match reason {
                    BlockError::Duplicate => BlockStatus::Duplicate,
                    BlockError::TimeTooNew { .. } => BlockStatus::BadTime,
                    _ => BlockStatus::Bad,
                };
                if status != BlockStatus::Duplicate {
                    tracing::debug!("❌ Block {} failed basic validation: {}", hash_to_hex(&hash), reason);
                    self.events.on_block_invalid(&block, &reason, ctx);
                }
                status
            }
            Err(ValidatorError::Storage(e)) => self.fatal(e, ctx),
            Ok(()) => match self.store.block_location(block.prev_hash()) {
                Err(e) => self.fatal(e, ctx),
                Ok(None) => self.add_orphan(&block, ctx),
                Ok(Some(_)) => self.place_block(&block, ctx),
            },
        };
        self.events.on_block_finished(&block, status, ctx);

        if matches!(status, BlockStatus::Main | BlockStatus::Side) {
            self.promote_orphans(hash, ctx);
        }
        self.publish_summary();
        status
    }

    fn fatal(&mut self, error: StorageError, ctx: &mut E::Context) -> BlockStatus {
        self.store.revert();
        tracing::error!("❌ Storage failure while processing block: {}", error);
        self.events.on_fatal_error(&error, ctx);
        BlockStatus::Error
    }

    // ─── Orphans ─────────────────────────────────────────────────────

    fn add_orphan(&mut self, block: &Block, ctx: &mut E::Context) -> BlockStatus {
        let (slot, evicted) = self.shared.lock().orphans.push(block.clone());
        if let Some(old) = evicted {
            tracing::debug!("📦 Orphan pool full, dropped {}", hash_to_hex(&old.hash()));
        }
        let saved = self
            .store
            .save_orphan(slot, block)
            .and_then(|_| self.save_info())
            .and_then(|_| self.store.stage())
            .and_then(|_| self.store.commit());
        if let Err(e) = saved {
            return self.fatal(e, ctx);
        }
        tracing::info!("📦 Orphan {} held in slot {}", hash_to_hex(&block.hash()), slot);
        BlockStatus::Orphan
    }

    fn persist_orphan_slots(&self, touched: &[usize]) -> Result<(), StorageError> {
        let contents: Vec<(usize, Option<Block>)> = {
            let shared = self.shared.lock();
            touched.iter().map(|s| (*s, shared.orphans.slot(*s).cloned())).collect()
        };
        for (slot, block) in contents {
            match block {
                Some(block) => self.store.save_orphan(slot, &block)?,
                None => {
                    self.store.delete_orphan(slot)?;
                }
            }
        }
        self.save_info()?;
        self.store.stage()
    }

    /// Place every orphan descending from `root`, breadth first.
    fn promote_orphans(&mut self, root: Hash256, ctx: &mut E::Context) {
        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            loop {
                let removed = {
                    let mut shared = self.shared.lock();
                    match shared.orphans.find_child(&parent) {
                        Some(position) => shared.orphans.remove(position),
                        None => None,
                    }
                };
                let Some((orphan, touched)) = removed else { break };
                if let Err(e) = self.persist_orphan_slots(&touched) {
                    let status = self.fatal(e, ctx);
                    self.events.on_block_finished(&orphan, status, ctx);
                    return;
                }

                let status = self.place_block(&orphan, ctx);
                tracing::info!("📦 Orphan {} promoted: {:?}", hash_to_hex(&orphan.hash()), status);
                self.events.on_block_finished(&orphan, status, ctx);
                if matches!(status, BlockStatus::Main | BlockStatus::Side) {
                    queue.push_back(orphan.hash());
                }
            }
        }
    }

    // ─── Placement ───────────────────────────────────────────────────

    /// Place a block whose parent is stored, committing on success and
    /// rolling back everything on failure.
    fn place_block(&mut self, block: &Block, ctx: &mut E::Context) -> BlockStatus {
        let snapshot = Snapshot { branches: self.branches.clone(), main_branch: self.main_branch };
        let mut attempt = Attempt::default();

        let result = self.try_place(block, &mut attempt, ctx);
        let result = match result {
            Ok(BlockStatus::NoNew) => {
                self.store.revert();
                return BlockStatus::NoNew;
            }
            Ok(status) => self
                .persist_state()
                .and_then(|_| self.store.stage())
                .and_then(|_| self.store.commit())
                .map(|_| status)
                .map_err(ValidatorError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(status) => {
                self.announce(attempt, ctx);
                status
            }
            Err(err) => {
                self.store.revert();
                self.branches = snapshot.branches;
                self.main_branch = snapshot.main_branch;
                match err {
                    ValidatorError::Rejected(reason) => {
                        tracing::debug!("❌ Block {} rejected: {}", hash_to_hex(&block.hash()), reason);
                        if let Err(e) = self.keep_proven(&attempt) {
                            return self.fatal(e, ctx);
                        }
                        self.events.on_block_invalid(block, &reason, ctx);
                        BlockStatus::Bad
                    }
                    ValidatorError::Storage(e) => self.fatal(e, ctx),
                }
            }
        }
    }

    /// Publish what a committed attempt changed.
    fn announce(&mut self, attempt: Attempt, ctx: &mut E::Context) {
        if let Some((from, to)) = attempt.renamed {
            let mut shared = self.shared.lock();
            let count = shared.working[from as usize];
            shared.working[to as usize] = count;
            shared.working[from as usize] = 0;
        }
        for event in attempt.events {
            match event {
                ChainEvent::NewBranch { branch, parent, fork_index } => {
                    self.events.on_new_branch(branch, parent, fork_index, ctx)
                }
                ChainEvent::DeleteBranch(branch) => self.events.on_delete_branch(branch, ctx),
                ChainEvent::Add { branch, block, height, add } => self.events.on_add_block(branch, &block, height, add, ctx),
                ChainEvent::Remove { branch, block, height } => self.events.on_remove_block(branch, &block, height, ctx),
            }
        }
    }

    /// After a rollback, keep the validation progress of blocks that did
    /// pass, so a later reorganisation need not check them again.
    fn keep_proven(&mut self, attempt: &Attempt) -> Result<(), StorageError> {
        if attempt.evicted || attempt.proven.is_empty() {
            return Ok(());
        }
        let mut changed = Vec::new();
        for location in &attempt.proven {
            let Some(branch) = self.branches[location.branch as usize].as_mut() else { continue };
            if location.index >= branch.num_blocks || branch.is_validated(location.index) {
                continue;
            }
            branch.last_validation = Some(location.index);
            changed.push(location.branch);
        }
        for id in changed {
            self.store.save_branch(id, self.branch(id)?)?;
        }
        self.store.stage()
    }

    fn try_place(&mut self, block: &Block, attempt: &mut Attempt, ctx: &mut E::Context) -> Result<BlockStatus, ValidatorError> {
        let parent = self.locate(block.prev_hash())?;
        let parent_branch = self.branch(parent.branch)?;

        let location = if parent_branch.tip_index() == Some(parent.index) {
            BlockLocation::new(parent.branch, parent_branch.num_blocks)
        } else {
            match self.create_branch(block.prev_hash(), attempt)? {
                Some(id) => BlockLocation::new(id, 0),
                None => {
                    tracing::warn!("⛓️ No branch slot free for {}", hash_to_hex(&block.hash()));
                    self.events.on_no_new_branches(block, ctx);
                    return Ok(BlockStatus::NoNew);
                }
            }
        };

        let branch = self.branch(location.branch)?;
        let height = branch.next_height();
        let last_retarget_time = branch.last_retarget_time;
        let prev_location = previous_location(&self.branches, location)
            .ok_or_else(|| StorageError::Corrupt("new block has no parent location".into()))?;
        let prev = self.load_header(prev_location)?;
        self.check_target(block, &prev, height, last_retarget_time)?;
        self.check_median_time(block, prev_location)?;

        self.store.save_block(location, block)?;
        let work = pow::block_work(block.target());
        let branch = self.branch_mut(location.branch)?;
        branch.num_blocks += 1;
        branch.work += work;
        if height % RETARGET_INTERVAL == 0 {
            branch.last_retarget_time = block.time();
        }

        if location.branch == self.main_branch {
            self.validate_and_connect(block, location, height, attempt)?;
            attempt.events.push(ChainEvent::Add { branch: location.branch, block: block.clone(), height, add: AddType::Last });
            tracing::info!("⛓️ Block {} extends main chain to height {}", hash_to_hex(&block.hash()), height);
            return Ok(BlockStatus::Main);
        }

        if self.branch(location.branch)?.work > self.branch(self.main_branch)?.work {
            self.reorganize(block, location, height, attempt)?;
            return Ok(BlockStatus::Main);
        }

        tracing::debug!(
            "⛓️ Block {} stored on side branch {} at height {}",
            hash_to_hex(&block.hash()),
            location.branch,
            height
        );
        Ok(BlockStatus::Side)
    }

    fn locate(&self, hash: &Hash256) -> Result<BlockLocation, StorageError> {
        self.store
            .block_location(hash)?
            .ok_or_else(|| missing(format!("block {}", hash_to_hex(hash))))
    }

    fn check_target(&self, block: &Block, prev: &BlockHeader, height: u32, last_retarget_time: u32) -> Result<(), BlockError> {
        let expected = if height % RETARGET_INTERVAL == 0 && !self.params.no_retargeting {
            pow::retarget(prev.target, prev.time.saturating_sub(last_retarget_time), self.params.max_target)
        } else {
            prev.target
        };
        if block.target() != expected {
            return Err(BlockError::BadTarget { expected, actual: block.target() });
        }
        Ok(())
    }

    fn check_median_time(&self, block: &Block, prev: BlockLocation) -> Result<(), ValidatorError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(prev);
        while let Some(location) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.load_header(location)?.time);
            cursor = previous_location(&self.branches, location);
        }
        times.sort_unstable();
        let median = times[times.len() / 2];
        if block.time() <= median {
            return Err(BlockError::TimeTooOld { time: block.time(), median }.into());
        }
        Ok(())
    }

    // ─── Branch slots ────────────────────────────────────────────────

    /// Open a branch forking off the block `parent_hash`, evicting one if
    /// every slot is taken. `None` when nothing could be evicted.
    fn create_branch(&mut self, parent_hash: &Hash256, attempt: &mut Attempt) -> Result<Option<BranchId>, ValidatorError> {
        let id = match self.branches.iter().position(Option::is_none) {
            Some(free) => free as BranchId,
            None => {
                let parent_branch = self.locate(parent_hash)?.branch;
                match self.evict(parent_branch, attempt)? {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
        };

        // Eviction may have renumbered the parent.
        let parent = self.locate(parent_hash)?;
        let parent_branch = self.branch(parent.branch)?.clone();
        let mut work = parent_branch.work.clone();
        for index in parent.index + 1..parent_branch.num_blocks {
            let above = pow::block_work(self.load_header(BlockLocation::new(parent.branch, index))?.target);
            work = if work > above { work - above } else { BigUint::default() };
        }

        let parent_height = parent_branch.height_of(parent.index);
        let period_start = parent_height - parent_height % RETARGET_INTERVAL;
        let period_block = ancestor_at_height(&self.branches, parent, period_start)
            .ok_or_else(|| StorageError::Corrupt(format!("no ancestor at height {}", period_start)))?;
        let last_retarget_time = self.load_header(period_block)?.time;

        self.branches[id as usize] = Some(Branch {
            num_blocks: 0,
            start_height: parent_height + 1,
            parent_branch: parent.branch,
            parent_block_index: parent.index,
            last_retarget_time,
            last_validation: None,
            work,
        });
        tracing::info!("⛓️ New branch {} forks off {}:{} at height {}", id, parent.branch, parent.index, parent_height);
        attempt.events.push(ChainEvent::NewBranch { branch: id, parent: parent.branch, fork_index: parent.index });
        Ok(Some(id))
    }

    /// Free a branch slot. The candidate is the idle side branch with the
    /// lowest tip, ties going to the lowest id; `keep` is never chosen.
    fn evict(&mut self, keep: BranchId, attempt: &mut Attempt) -> Result<Option<BranchId>, StorageError> {
        let working = self.shared.lock().working;
        let candidate = self
            .branches
            .iter()
            .enumerate()
            .filter_map(|(id, b)| {
                let b = b.as_ref()?;
                let id = id as BranchId;
                (id != self.main_branch && id != keep && working[id as usize] == 0).then_some((b.next_height(), id))
            })
            .min();
        let Some((_, evicted)) = candidate else {
            return Ok(None);
        };
        attempt.evicted = true;

        let deps = dependents(&self.branches, evicted);
        let deepest = deps
            .iter()
            .filter_map(|id| Some((self.branches[*id as usize].as_ref()?.parent_block_index, std::cmp::Reverse(*id))))
            .max()
            .map(|(_, std::cmp::Reverse(id))| id);

        let Some(dependent) = deepest else {
            let num_blocks = self.branch(evicted)?.num_blocks;
            for index in 0..num_blocks {
                self.store.delete_block(BlockLocation::new(evicted, index))?;
            }
            self.store.delete_branch(evicted)?;
            self.branches[evicted as usize] = None;
            tracing::info!("🗑️ Evicted branch {} ({} blocks)", evicted, num_blocks);
            attempt.events.push(ChainEvent::DeleteBranch(evicted));
            return Ok(Some(evicted));
        };

        self.merge_into(evicted, dependent)?;
        attempt.renamed = Some((dependent, evicted));
        tracing::info!("🗑️ Branch {} merged into branch {}", dependent, evicted);
        attempt.events.push(ChainEvent::DeleteBranch(dependent));
        Ok(Some(dependent))
    }

    /// Splice `dependent` onto `target` at its fork point. Blocks of
    /// `target` above the fork are dropped; `dependent`'s slot is freed.
    fn merge_into(&mut self, target: BranchId, dependent: BranchId) -> Result<(), StorageError> {
        let kept = self.branch(target)?.clone();
        let moved = self.branch(dependent)?.clone();
        let fork = moved.parent_block_index;
        let shift = fork + 1;

        for index in shift..kept.num_blocks {
            self.store.delete_block(BlockLocation::new(target, index))?;
        }
        for index in 0..moved.num_blocks {
            let from = BlockLocation::new(dependent, index);
            let to = BlockLocation::new(target, shift + index);
            self.store.move_block(from, to)?;
            let block = self.load_block(to)?;
            for tx in &block.transactions {
                let txid = tx.hash();
                if let Some(mut tx_ref) = self.store.load_tx_ref(&txid)? {
                    if tx_ref.branch == dependent && tx_ref.block_index == index {
                        tx_ref.branch = target;
                        tx_ref.block_index = shift + index;
                        self.store.save_tx_ref(&txid, &tx_ref)?;
                    }
                }
            }
        }

        let last_validation = match moved.last_validation {
            Some(v) => Some(shift + v),
            None => kept.last_validation.map(|v| v.min(fork)),
        };
        self.branches[target as usize] = Some(Branch {
            num_blocks: shift + moved.num_blocks,
            last_retarget_time: moved.last_retarget_time,
            last_validation,
            work: moved.work,
            ..kept
        });
        for branch in self.branches.iter_mut().flatten() {
            if !branch.is_root() && branch.parent_branch == dependent {
                branch.parent_branch = target;
                branch.parent_block_index += shift;
            }
        }
        if self.main_branch == dependent {
            self.main_branch = target;
        }
        self.branches[dependent as usize] = None;
        self.store.delete_branch(dependent)?;
        Ok(())
    }

    // ─── Main chain ──────────────────────────────────────────────────

    /// Fully validate a block unless already proven, then apply it to the
    /// UTXO set. Returns whether validation ran.
    fn validate_and_connect(
        &mut self,
        block: &Block,
        location: BlockLocation,
        height: u32,
        attempt: &mut Attempt,
    ) -> Result<bool, ValidatorError> {
        let validated_now = !self.branch(location.branch)?.is_validated(location.index);
        if validated_now {
            let check = CheckContext {
                params: &self.params,
                store: &self.store,
                engine: self.engine.as_ref(),
                verify_scripts: self.flags.full_validation,
            };
            validation::check_block(&check, block, height)?;
            self.branch_mut(location.branch)?.last_validation = Some(location.index);
            attempt.proven.push(location);
        }
        validation::connect_block(&self.store, block, location, height)?;
        Ok(validated_now)
    }

    /// Switch the main chain to end at `location`, the block just stored.
    fn reorganize(
        &mut self,
        block: &Block,
        location: BlockLocation,
        height: u32,
        attempt: &mut Attempt,
    ) -> Result<(), ValidatorError> {
        let old_tip = self.main_tip()?;
        let old_path = chain_path(&self.branches, old_tip);
        let new_path = chain_path(&self.branches, location);
        let (fork, fork_height) = common_point(&self.branches, &old_path, &new_path)
            .ok_or_else(|| StorageError::Corrupt("branches share no ancestor".into()))?;
        let old_height = self.main_height();
        tracing::info!(
            "🔄 Reorganising: main {}@{} -> {}@{}, fork at {}:{} (height {})",
            self.main_branch,
            old_height,
            location.branch,
            height,
            fork.branch,
            fork.index,
            fork_height
        );

        let mut cursor = old_tip;
        for h in (fork_height + 1..=old_height).rev() {
            let old = self.load_block(cursor)?;
            validation::disconnect_block(&self.store, &self.branches, &old)?;
            attempt.events.push(ChainEvent::Remove { branch: cursor.branch, block: old, height: h });
            if let Some(prev) = previous_location(&self.branches, cursor) {
                cursor = prev;
            }
        }

        for h in fork_height + 1..height {
            let at = ancestor_at_height(&self.branches, location, h)
                .ok_or_else(|| StorageError::Corrupt(format!("no block at height {} on new chain", h)))?;
            let replayed = self.load_block(at)?;
            let add = if self.validate_and_connect(&replayed, at, h, attempt)? { AddType::New } else { AddType::Prev };
            attempt.events.push(ChainEvent::Add { branch: at.branch, block: replayed, height: h, add });
        }

        self.validate_and_connect(block, location, height, attempt)?;
        self.main_branch = location.branch;
        attempt.events.push(ChainEvent::Add { branch: location.branch, block: block.clone(), height, add: AddType::Last });
        tracing::info!("🔄 Reorganisation complete, main tip {} at height {}", hash_to_hex(&block.hash()), height);
        Ok(())
    }

    // ─── Persistence ─────────────────────────────────────────────────

    fn save_info(&self) -> Result<(), StorageError> {
        let (first_orphan, num_orphans) = {
            let shared = self.shared.lock();
            (shared.orphans.first() as u8, shared.orphans.len() as u8)
        };
        self.store.save_validator_info(&ValidatorInfo {
            main_branch: self.main_branch,
            num_branches: self.branch_count() as u8,
            first_orphan,
            num_orphans,
        })
    }

    fn persist_state(&self) -> Result<(), StorageError> {
        for (id, branch) in self.branches.iter().enumerate() {
            if let Some(branch) = branch {
                self.store.save_branch(id as BranchId, branch)?;
            }
        }
        self.save_info()
    }

    fn publish_summary(&self) {
        let tip = self
            .main_tip()
            .ok()
            .and_then(|loc| self.store.load_block_hash(loc).ok().flatten())
            .unwrap_or(NULL_HASH);
        let summary = ChainSummary {
            main_branch: self.main_branch,
            height: self.main_height(),
            tip,
            work: self.main_work(),
            branches: self.branch_count(),
        };
        self.shared.lock().summary = summary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::*;
    use crate::storage::UtxoEntry;
    use tempfile::TempDir;

    fn regtest() -> (TempDir, Validator<Recorder>, Block) {
        let dir = TempDir::new().unwrap();
        let validator = open_validator(NetworkParams::regtest(), open_store(dir.path()));
        let genesis = NetworkParams::regtest().genesis_block();
        (dir, validator, genesis)
    }

    fn submit(validator: &mut Validator<Recorder>, block: &Block) -> BlockStatus {
        validator.process_block(block.clone(), NOW, &mut ())
    }

    fn coinbase_outpoint(block: &Block) -> OutPoint {
        OutPoint { txid: block.transactions[0].hash(), vout: 0 }
    }

    /// A validator that only ever saw `blocks`, each extending the main chain.
    fn fed<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> (TempDir, Validator<Recorder>) {
        let (dir, mut validator, _) = regtest();
        for block in blocks {
            assert_eq!(submit(&mut validator, block), BlockStatus::Main);
        }
        (dir, validator)
    }

    /// Unspent outputs and transaction references agree for every
    /// transaction in `blocks`. Block positions may differ.
    fn assert_same_chain_state(left: &Validator<Recorder>, right: &Validator<Recorder>, blocks: &[&Block]) {
        let tx_ref = |v: &Validator<Recorder>, txid: &Hash256| {
            v.store()
                .load_tx_ref(txid)
                .unwrap()
                .map(|r| (r.instance_count, r.unspent_outputs, r.coinbase, r.output_count))
        };
        for block in blocks {
            for tx in &block.transactions {
                let txid = tx.hash();
                assert_eq!(left.store().utxos_of(&txid).unwrap(), right.store().utxos_of(&txid).unwrap());
                assert_eq!(tx_ref(left, &txid), tx_ref(right, &txid), "tx {}", hash_to_hex(&txid));
            }
        }
    }

    fn mainnet_block_one(genesis: &Block) -> Block {
        let script_pubkey = hex::decode(
            "410496b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da7589379515d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac",
        )
        .unwrap();
        let coinbase = Transaction::new_coinbase(
            hex::decode("04ffff001d0104").unwrap(),
            vec![TxOutput { value: 50 * COIN, script_pubkey }],
        );
        Block::new(
            BlockHeader {
                version: 1,
                prev_hash: genesis.hash(),
                merkle_root: hash_from_hex("0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098").unwrap(),
                time: 1231469665,
                target: 0x1d00ffff,
                nonce: 2573394689,
            },
            vec![coinbase],
        )
    }

    #[test]
    fn test_genesis_initialisation() {
        let (_dir, validator, genesis) = regtest();
        assert_eq!(validator.main_branch(), 0);
        assert_eq!(validator.main_height(), 0);
        assert_eq!(validator.branch_count(), 1);
        assert!(validator.store().block_exists(&genesis.hash()).unwrap());
        // Genesis outputs are never spendable
        assert!(validator.store().load_utxo(&coinbase_outpoint(&genesis)).unwrap().is_none());
        assert_eq!(validator.summary().tip, genesis.hash());
    }

    #[test]
    fn test_mainnet_block_one() {
        let dir = TempDir::new().unwrap();
        let mut validator = open_validator(NetworkParams::mainnet(), open_store(dir.path()));
        let genesis = NetworkParams::mainnet().genesis_block();
        let block = mainnet_block_one(&genesis);
        assert_eq!(block.compute_merkle_root(), block.header().merkle_root);
        assert_eq!(hash_to_hex(&block.hash()), "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048");

        let status = validator.process_block(block.clone(), 1349643202, &mut ());
        assert_eq!(status, BlockStatus::Main);
        assert_eq!(validator.main_branch(), 0);
        assert_eq!(validator.main_height(), 1);
        assert_eq!(validator.main_work().to_bytes_le(), vec![1, 0, 1, 0, 1]);
        assert!(validator.store().load_utxo(&coinbase_outpoint(&block)).unwrap().is_some());
        assert_eq!(validator.events().added(), vec![(1, AddType::Last)]);
    }

    #[test]
    fn test_basic_validation_statuses() {
        let (_dir, mut validator, genesis) = regtest();
        let b1 = next_block(&genesis, 1, 0);
        assert_eq!(submit(&mut validator, &b1), BlockStatus::Main);
        assert_eq!(submit(&mut validator, &b1), BlockStatus::Duplicate);

        let future = mine(&b1, (NOW + BLOCK_ALLOWED_TIME_DRIFT + 1) as u32, vec![coinbase(2, 0, block_reward(2))]);
        assert_eq!(submit(&mut validator, &future), BlockStatus::BadTime);

        let mut bad_merkle = next_block(&b1, 2, 0);
        bad_merkle.header_mut().merkle_root = [7u8; 32];
        assert_eq!(submit(&mut validator, &bad_merkle), BlockStatus::Bad);

        let empty = mine(&b1, b1.time() + 600, Vec::new());
        assert_eq!(submit(&mut validator, &empty), BlockStatus::Bad);
        assert!(matches!(
            validator.events().events.last(),
            Some(Event::Finished { status: BlockStatus::Bad, .. })
        ));
        assert_eq!(validator.main_height(), 1);
    }

    #[test]
    fn test_contextual_rejections_leave_state_untouched() {
        let (_dir, mut validator, genesis) = regtest();
        let b1 = next_block(&genesis, 1, 0);
        submit(&mut validator, &b1);

        let stale = mine(&b1, genesis.time(), vec![coinbase(2, 0, block_reward(2))]);
        assert_eq!(submit(&mut validator, &stale), BlockStatus::Bad);
        assert!(validator
            .events()
            .events
            .iter()
            .any(|e| matches!(e, Event::Invalid { reason: BlockError::TimeTooOld { .. }, .. })));

        let greedy = mine(&b1, b1.time() + 600, vec![coinbase(2, 0, block_reward(2) + 1)]);
        assert_eq!(submit(&mut validator, &greedy), BlockStatus::Bad);
        assert!(!validator.store().block_exists(&greedy.hash()).unwrap());
        assert_eq!(validator.main_height(), 1);
        assert_eq!(validator.summary().tip, b1.hash());
    }

    #[test]
    fn test_orphans_are_promoted() {
        let (_dir, mut validator, genesis) = regtest();
        let blocks = chain_from(&genesis, 0, 3, 0);
        assert_eq!(submit(&mut validator, &blocks[2]), BlockStatus::Orphan);
        assert_eq!(submit(&mut validator, &blocks[1]), BlockStatus::Orphan);
        assert_eq!(submit(&mut validator, &blocks[2]), BlockStatus::Duplicate);
        assert_eq!(validator.shared().lock().orphans.len(), 2);

        assert_eq!(submit(&mut validator, &blocks[0]), BlockStatus::Main);
        assert_eq!(validator.main_height(), 3);
        assert!(validator.shared().lock().orphans.is_empty());
        assert_eq!(
            validator.events().added(),
            vec![(1, AddType::Last), (2, AddType::Last), (3, AddType::Last)]
        );
        assert_eq!(validator.events().finished(&blocks[2].hash()), Some(BlockStatus::Main));
    }

    #[test]
    fn test_coinbase_may_claim_reward_plus_fees() {
        let (_dir, mut validator, genesis) = regtest();
        let blocks = chain_from(&genesis, 0, COINBASE_MATURITY, 0);
        for block in &blocks {
            assert_eq!(submit(&mut validator, block), BlockStatus::Main);
        }
        let tip = blocks.last().unwrap();
        let height = COINBASE_MATURITY + 1;
        let fee = 1_000;
        let payment = spend(coinbase_outpoint(&blocks[0]), block_reward(1) - fee);

        let greedy = mine(tip, tip.time() + 600, vec![coinbase(height, 0, block_reward(height) + fee + 1), payment.clone()]);
        assert_eq!(submit(&mut validator, &greedy), BlockStatus::Bad);
        assert!(validator
            .events()
            .events
            .iter()
            .any(|e| matches!(e, Event::Invalid { reason: BlockError::CoinbaseTooLarge { .. }, .. })));

        let exact = mine(tip, tip.time() + 600, vec![coinbase(height, 1, block_reward(height) + fee), payment.clone()]);
        assert_eq!(submit(&mut validator, &exact), BlockStatus::Main);
        assert_eq!(validator.main_height(), height);
        let store = validator.store();
        assert!(store.load_utxo(&coinbase_outpoint(&blocks[0])).unwrap().is_none());
        assert!(store.load_utxo(&OutPoint { txid: payment.hash(), vout: 0 }).unwrap().is_some());
    }

    #[test]
    fn test_immature_coinbase_spend_is_rejected() {
        let (_dir, mut validator, genesis) = regtest();
        let blocks = chain_from(&genesis, 0, 2, 0);
        for block in &blocks {
            submit(&mut validator, block);
        }
        let tip = &blocks[1];
        let payment = spend(coinbase_outpoint(&blocks[0]), 1);
        let block = mine(tip, tip.time() + 600, vec![coinbase(3, 0, block_reward(3)), payment]);
        assert_eq!(submit(&mut validator, &block), BlockStatus::Bad);
        assert!(validator
            .events()
            .events
            .iter()
            .any(|e| matches!(e, Event::Invalid { reason: BlockError::ImmatureSpend(_), .. })));
    }

    #[test]
    fn test_reorganisation_round_trip() {
        let (_dir, mut validator, genesis) = regtest();
        let a = chain_from(&genesis, 0, 2, 0);
        let b = chain_from(&genesis, 0, 3, 1);
        for block in &a {
            assert_eq!(submit(&mut validator, block), BlockStatus::Main);
        }
        assert_eq!(submit(&mut validator, &b[0]), BlockStatus::Side);
        assert_eq!(submit(&mut validator, &b[1]), BlockStatus::Side);
        assert!(validator.events().events.contains(&Event::NewBranch { branch: 1, parent: 0, fork_index: 0 }));

        validator.events_mut().events.clear();
        assert_eq!(submit(&mut validator, &b[2]), BlockStatus::Main);
        assert_eq!(validator.main_branch(), 1);
        assert_eq!(validator.main_height(), 3);
        let removed: Vec<u32> = validator
            .events()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Remove { height, .. } => Some(*height),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec![2, 1]);
        assert_eq!(validator.events().added(), vec![(1, AddType::New), (2, AddType::New), (3, AddType::Last)]);
        {
            let store = validator.store();
            assert!(store.load_utxo(&coinbase_outpoint(&a[0])).unwrap().is_none());
            assert!(store.load_utxo(&coinbase_outpoint(&b[0])).unwrap().is_some());
        }

        // Back to the original branch, which now overtakes
        let more = chain_from(&a[1], 2, 2, 0);
        assert_eq!(submit(&mut validator, &more[0]), BlockStatus::Side);
        validator.events_mut().events.clear();
        assert_eq!(submit(&mut validator, &more[1]), BlockStatus::Main);
        assert_eq!(validator.main_branch(), 0);
        assert_eq!(validator.main_height(), 4);
        assert_eq!(
            validator.events().added(),
            vec![(1, AddType::Prev), (2, AddType::Prev), (3, AddType::New), (4, AddType::Last)]
        );
        let store = validator.store();
        for block in a.iter().chain(&more) {
            assert!(store.load_utxo(&coinbase_outpoint(block)).unwrap().is_some());
        }
        for block in &b {
            assert!(store.load_utxo(&coinbase_outpoint(block)).unwrap().is_none());
        }
    }

    #[test]
    fn test_reorganisation_restores_spent_outputs() {
        let (_dir, mut validator, genesis) = regtest();
        let base = chain_from(&genesis, 0, COINBASE_MATURITY, 0);
        for block in &base {
            assert_eq!(submit(&mut validator, block), BlockStatus::Main);
        }
        let tip = base.last().unwrap();
        let height = COINBASE_MATURITY + 1;
        let funding = coinbase_outpoint(&base[0]);
        let payment = spend(funding, block_reward(1));
        let spender = mine(tip, tip.time() + 600, vec![coinbase(height, 0, block_reward(height)), payment.clone()]);
        assert_eq!(submit(&mut validator, &spender), BlockStatus::Main);
        assert!(validator.store().load_utxo(&funding).unwrap().is_none());

        // A heavier rival drops the spending block
        let rival = chain_from(tip, COINBASE_MATURITY, 2, 1);
        assert_eq!(submit(&mut validator, &rival[0]), BlockStatus::Side);
        assert_eq!(submit(&mut validator, &rival[1]), BlockStatus::Main);
        assert_eq!(
            validator.store().load_utxo(&funding).unwrap(),
            Some(UtxoEntry { value: block_reward(1), height: 1, coinbase: true, script_pubkey: OP_TRUE_SCRIPT.to_vec() })
        );
        assert!(validator.store().load_utxo(&OutPoint { txid: payment.hash(), vout: 0 }).unwrap().is_none());
        assert!(validator.store().load_tx_ref(&payment.hash()).unwrap().is_none());
        assert_eq!(validator.store().load_tx_ref(&funding.txid).unwrap().unwrap().unspent_outputs, 1);

        let mut seen: Vec<&Block> = base.iter().chain([&spender]).chain(&rival).collect();
        let (_rival_dir, direct) = fed(base.iter().chain(&rival));
        assert_same_chain_state(&validator, &direct, &seen);

        // The spending branch overtakes again and its spend is reapplied
        let more = chain_from(&spender, height, 2, 0);
        assert_eq!(submit(&mut validator, &more[0]), BlockStatus::Side);
        assert_eq!(submit(&mut validator, &more[1]), BlockStatus::Main);
        assert_eq!(validator.main_branch(), 0);
        assert!(validator.store().load_utxo(&funding).unwrap().is_none());
        assert!(validator.store().load_utxo(&OutPoint { txid: payment.hash(), vout: 0 }).unwrap().is_some());

        seen.extend(&more);
        let (_main_dir, direct) = fed(base.iter().chain([&spender]).chain(&more));
        assert_same_chain_state(&validator, &direct, &seen);
    }

    #[test]
    fn test_failed_reorganisation_keeps_main_chain() {
        let (_dir, mut validator, genesis) = regtest();
        let a = chain_from(&genesis, 0, 1, 0);
        submit(&mut validator, &a[0]);
        let side = next_block(&genesis, 1, 1);
        assert_eq!(submit(&mut validator, &side), BlockStatus::Side);

        // Valid header, but the coinbase overpays: found only once the
        // reorganisation validates it
        let bad = mine(&side, side.time() + 600, vec![coinbase(2, 1, block_reward(2) + 1)]);
        assert_eq!(submit(&mut validator, &bad), BlockStatus::Bad);
        assert_eq!(validator.main_branch(), 0);
        assert_eq!(validator.main_height(), 1);
        assert!(validator.store().block_exists(&side.hash()).unwrap());
        assert!(!validator.store().block_exists(&bad.hash()).unwrap());
        assert!(validator.store().load_utxo(&coinbase_outpoint(&a[0])).unwrap().is_some());
        // The side block passed validation during the attempt
        assert!(validator.branches()[1].as_ref().unwrap().is_validated(0));
    }

    #[test]
    fn test_eviction_and_no_new_branches() {
        let (_dir, mut validator, genesis) = regtest();
        let a = chain_from(&genesis, 0, 3, 0);
        for block in &a {
            submit(&mut validator, block);
        }
        let s1 = next_block(&genesis, 1, 1);
        let s2 = next_block(&a[0], 2, 2);
        let s3 = next_block(&a[1], 3, 3);
        let s4 = next_block(&genesis, 1, 4);
        for block in [&s1, &s2, &s3, &s4] {
            assert_eq!(submit(&mut validator, block), BlockStatus::Side);
        }
        assert_eq!(validator.branch_count(), MAX_BRANCH_CACHE);

        // Every side branch busy: nothing can go
        validator.shared().lock().working = [0, 1, 1, 1, 1];
        let fork = next_block(&a[0], 2, 5);
        assert_eq!(submit(&mut validator, &fork), BlockStatus::NoNew);
        assert!(validator.events().events.contains(&Event::NoNew(fork.hash())));
        assert!(!validator.store().block_exists(&fork.hash()).unwrap());

        // The lowest idle branch is dropped
        validator.shared().lock().working = [0; MAX_BRANCH_CACHE];
        validator.events_mut().events.clear();
        assert_eq!(submit(&mut validator, &fork), BlockStatus::Side);
        assert!(validator.events().events.contains(&Event::DeleteBranch(1)));
        assert!(validator.events().events.contains(&Event::NewBranch { branch: 1, parent: 0, fork_index: 1 }));
        assert!(!validator.store().block_exists(&s1.hash()).unwrap());
        assert!(validator.store().block_exists(&s4.hash()).unwrap());
        assert_eq!(validator.store().block_location(&fork.hash()).unwrap(), Some(BlockLocation::new(1, 0)));
    }

    #[test]
    fn test_eviction_merges_dependent_branch() {
        let (_dir, mut validator, genesis) = regtest();
        let a = chain_from(&genesis, 0, 4, 0);
        for block in &a {
            submit(&mut validator, block);
        }
        let c2 = next_block(&a[0], 2, 1);
        let c3 = next_block(&c2, 3, 1);
        let d3 = next_block(&c2, 3, 2);
        let e1 = next_block(&genesis, 1, 3);
        let f1 = next_block(&genesis, 1, 4);
        for block in [&c2, &c3, &d3, &e1, &f1] {
            assert_eq!(submit(&mut validator, block), BlockStatus::Side);
        }
        let store = Arc::clone(validator.store());
        assert_eq!(store.block_location(&d3.hash()).unwrap(), Some(BlockLocation::new(2, 0)));

        validator.shared().lock().working = [0, 0, 0, 1, 1];
        validator.events_mut().events.clear();
        let fork = next_block(&a[1], 3, 5);
        assert_eq!(submit(&mut validator, &fork), BlockStatus::Side);

        // Branch 1 absorbed branch 2; c3 was dropped and d3 moved
        assert!(validator.events().events.contains(&Event::DeleteBranch(2)));
        assert!(!store.block_exists(&c3.hash()).unwrap());
        assert_eq!(store.block_location(&c2.hash()).unwrap(), Some(BlockLocation::new(1, 0)));
        assert_eq!(store.block_location(&d3.hash()).unwrap(), Some(BlockLocation::new(1, 1)));
        assert_eq!(store.block_location(&fork.hash()).unwrap(), Some(BlockLocation::new(2, 0)));
        assert_eq!(validator.branches()[1].as_ref().unwrap().num_blocks, 2);

        // The merged branch still grows and can take over
        let d = chain_from(&d3, 3, 2, 2);
        assert_eq!(submit(&mut validator, &d[0]), BlockStatus::Side);
        assert_eq!(submit(&mut validator, &d[1]), BlockStatus::Main);
        assert_eq!(validator.main_branch(), 1);
        assert_eq!(validator.main_height(), 5);
        assert!(store.load_utxo(&coinbase_outpoint(&d3)).unwrap().is_some());
        assert!(store.load_utxo(&coinbase_outpoint(&a[2])).unwrap().is_none());
    }

    #[test]
    fn test_rejected_fork_undoes_eviction() {
        let (_dir, mut validator, genesis) = regtest();
        let a = chain_from(&genesis, 0, 4, 0);
        for block in &a {
            submit(&mut validator, block);
        }
        let c2 = next_block(&a[0], 2, 1);
        let c3 = next_block(&c2, 3, 1);
        let d3 = next_block(&c2, 3, 2);
        let e1 = next_block(&genesis, 1, 3);
        let f1 = next_block(&genesis, 1, 4);
        for block in [&c2, &c3, &d3, &e1, &f1] {
            assert_eq!(submit(&mut validator, block), BlockStatus::Side);
        }
        let store = Arc::clone(validator.store());
        let branches = validator.branches().clone();

        // Only branch 1 is idle; placing a fork merges branch 2 into it
        validator.shared().lock().working = [0, 0, 2, 1, 1];
        validator.events_mut().events.clear();
        let stale = mine(&a[1], genesis.time(), vec![coinbase(3, 5, block_reward(3))]);
        assert_eq!(submit(&mut validator, &stale), BlockStatus::Bad);

        let events = &validator.events().events;
        assert!(events.iter().any(|e| matches!(e, Event::Invalid { reason: BlockError::TimeTooOld { .. }, .. })));
        assert!(!events.iter().any(|e| matches!(e, Event::DeleteBranch(_) | Event::NewBranch { .. })));
        assert_eq!(validator.branches(), &branches);
        assert_eq!(validator.shared().lock().working, [0, 0, 2, 1, 1]);
        assert_eq!(store.block_location(&c3.hash()).unwrap(), Some(BlockLocation::new(1, 1)));
        assert_eq!(store.block_location(&d3.hash()).unwrap(), Some(BlockLocation::new(2, 0)));

        // The same merge goes through for a valid fork
        validator.events_mut().events.clear();
        let fork = next_block(&a[1], 3, 5);
        assert_eq!(submit(&mut validator, &fork), BlockStatus::Side);
        let events = &validator.events().events;
        let delete = events.iter().position(|e| *e == Event::DeleteBranch(2));
        let create = events.iter().position(|e| *e == Event::NewBranch { branch: 2, parent: 0, fork_index: 2 });
        assert!(matches!((delete, create), (Some(d), Some(c)) if d < c));
        assert_eq!(validator.shared().lock().working, [0, 2, 0, 1, 1]);
        assert_eq!(store.block_location(&d3.hash()).unwrap(), Some(BlockLocation::new(1, 1)));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let genesis = NetworkParams::regtest().genesis_block();
        let blocks = chain_from(&genesis, 0, 4, 0);
        let side = next_block(&genesis, 1, 9);
        {
            let mut validator = open_validator(NetworkParams::regtest(), open_store(dir.path()));
            for block in &blocks[..3] {
                submit(&mut validator, block);
            }
            submit(&mut validator, &side);
            let orphan = next_block(&blocks[3], 5, 0);
            assert_eq!(submit(&mut validator, &orphan), BlockStatus::Orphan);
            validator.shutdown().unwrap();
        }

        let mut validator = open_validator(NetworkParams::regtest(), open_store(dir.path()));
        assert_eq!(validator.main_height(), 3);
        assert_eq!(validator.branch_count(), 2);
        assert_eq!(validator.shared().lock().orphans.len(), 1);
        assert_eq!(validator.summary().tip, blocks[2].hash());

        assert_eq!(submit(&mut validator, &blocks[3]), BlockStatus::Main);
        assert_eq!(validator.main_height(), 5);
        assert!(validator.shared().lock().orphans.is_empty());
    }
}
