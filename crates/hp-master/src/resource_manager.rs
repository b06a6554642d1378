//! Scheduling seam: the cluster resource manager that places an
//! experiment's trials.

use async_trait::async_trait;
use hp_types::{JobId, JobPosition, ResourceManagerError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

pub type RmResult<T> = Result<T, ResourceManagerError>;

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Check `pool` exists and can host trials needing `slots` each.
    async fn validate_resource_pool(&self, pool: &str, slots: usize) -> RmResult<()>;

    async fn set_group_max_slots(&self, job_id: &JobId, max_slots: Option<usize>) -> RmResult<()>;

    async fn set_group_weight(&self, job_id: &JobId, weight: f64) -> RmResult<()>;

    async fn set_group_priority(&self, job_id: &JobId, priority: i32) -> RmResult<()>;

    async fn move_job(&self, job_id: &JobId, pool: &str) -> RmResult<()>;

    async fn recover_job_position(&self, job_id: &JobId, position: JobPosition, pool: &str) -> RmResult<()>;
}

/// A call received by [`MemoryResourceManager`].
#[derive(Debug, Clone, PartialEq)]
pub enum RmCall {
    SetMaxSlots(Option<usize>),
    SetWeight(f64),
    SetPriority(i32),
    MoveJob(String),
    RecoverJobPosition(JobPosition),
}

/// In-process resource manager with a fixed set of pools. Records every call
/// and can be told to reject group updates.
#[derive(Debug)]
pub struct MemoryResourceManager {
    pools: HashSet<String>,
    supports_pools: bool,
    reject_priority: AtomicBool,
    reject_weight: AtomicBool,
    reject_moves: AtomicBool,
    calls: Mutex<Vec<RmCall>>,
}

impl Default for MemoryResourceManager {
    fn default() -> Self {
        Self::new(["default"])
    }
}

impl MemoryResourceManager {
    pub fn new<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pools: pools.into_iter().map(Into::into).collect(),
            supports_pools: true,
            reject_priority: AtomicBool::new(false),
            reject_weight: AtomicBool::new(false),
            reject_moves: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A manager that schedules everything in one implicit pool and refuses
    /// pool changes.
    pub fn without_pools() -> Self {
        Self {
            supports_pools: false,
            ..Self::default()
        }
    }

    pub fn reject_priority(&self, reject: bool) {
        self.reject_priority.store(reject, Ordering::SeqCst);
    }

    pub fn reject_weight(&self, reject: bool) {
        self.reject_weight.store(reject, Ordering::SeqCst);
    }

    pub fn reject_moves(&self, reject: bool) {
        self.reject_moves.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RmCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: RmCall) {
        self.calls.lock().push(call);
    }

    fn gate(flag: &AtomicBool, what: &str) -> RmResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ResourceManagerError::Rejected {
                reason: format!("{what} change refused"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceManager for MemoryResourceManager {
    async fn validate_resource_pool(&self, pool: &str, _slots: usize) -> RmResult<()> {
        if !self.supports_pools {
            return Err(ResourceManagerError::ResourcePoolsUnsupported);
        }
        if !self.pools.contains(pool) {
            return Err(ResourceManagerError::InvalidResourcePool(pool.to_string()));
        }
        Ok(())
    }

    async fn set_group_max_slots(&self, _job_id: &JobId, max_slots: Option<usize>) -> RmResult<()> {
        self.record(RmCall::SetMaxSlots(max_slots));
        Ok(())
    }

    async fn set_group_weight(&self, _job_id: &JobId, weight: f64) -> RmResult<()> {
        Self::gate(&self.reject_weight, "weight")?;
        self.record(RmCall::SetWeight(weight));
        Ok(())
    }

    async fn set_group_priority(&self, _job_id: &JobId, priority: i32) -> RmResult<()> {
        Self::gate(&self.reject_priority, "priority")?;
        self.record(RmCall::SetPriority(priority));
        Ok(())
    }

    async fn move_job(&self, _job_id: &JobId, pool: &str) -> RmResult<()> {
        Self::gate(&self.reject_moves, "resource pool")?;
        self.record(RmCall::MoveJob(pool.to_string()));
        Ok(())
    }

    async fn recover_job_position(&self, _job_id: &JobId, position: JobPosition, _pool: &str) -> RmResult<()> {
        self.record(RmCall::RecoverJobPosition(position));
        Ok(())
    }
}
