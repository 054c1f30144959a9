//! Distributed-run node reservation.
//!
//! Nodes live in the shared registry as `idle` or `working`. Reserving moves
//! them to `working` one compare-and-set at a time, so two workers racing for
//! the same pool never end up holding the same node.

mod strategy;

pub use strategy::{OrderedSelection, RandomSelection, SelectionStrategy};

use tracing::{debug, info, warn};

use crate::storage::{Database, DatabaseError};

/// Node allocation errors.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("Insufficient capacity: requested {requested} nodes, {available} idle")]
    InsufficientCapacity { requested: usize, available: usize },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Nodes held by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: String,
    pub nodes: Vec<String>,
}

impl Reservation {
    /// Node names as passed to the bench step, comma-joined.
    pub fn workers(&self) -> String {
        self.nodes.join(",")
    }
}

/// Reserves and releases nodes of the shared registry.
pub struct NodeAllocator<St = RandomSelection> {
    db: Database,
    strategy: St,
}

impl NodeAllocator<RandomSelection> {
    pub const fn new(db: Database) -> Self {
        Self {
            db,
            strategy: RandomSelection,
        }
    }
}

impl<St: SelectionStrategy> NodeAllocator<St> {
    pub const fn with_strategy(db: Database, strategy: St) -> Self {
        Self { db, strategy }
    }

    /// Reserve `n` idle nodes for `job_id`.
    ///
    /// Either all `n` nodes end up `working` under `job_id`, or none of the
    /// nodes this call touched do.
    pub async fn reserve(&self, job_id: &str, n: usize) -> Result<Reservation, AllocationError> {
        let idle = self.db.list_idle_nodes().await?;
        if idle.len() < n {
            return Err(AllocationError::InsufficientCapacity {
                requested: n,
                available: idle.len(),
            });
        }

        let candidates = self.strategy.select(&idle, n);
        let mut held = Vec::with_capacity(n);

        for node in candidates {
            if held.len() == n {
                break;
            }
            match self.db.try_reserve_node(&node.name, job_id).await {
                Ok(true) => {
                    debug!(job_id, node = %node.name, "Node reserved");
                    held.push(node.name);
                }
                Ok(false) => {
                    debug!(job_id, node = %node.name, "Node taken by another worker, trying next");
                }
                Err(e) => {
                    self.rollback(job_id, &held).await;
                    return Err(e.into());
                }
            }
        }

        if held.len() < n {
            let available = held.len();
            self.rollback(job_id, &held).await;
            return Err(AllocationError::InsufficientCapacity {
                requested: n,
                available,
            });
        }

        info!(job_id, nodes = %held.join(","), "Nodes reserved");
        Ok(Reservation {
            job_id: job_id.to_string(),
            nodes: held,
        })
    }

    /// Return the nodes of `reservation` to idle.
    pub async fn release(&self, reservation: &Reservation) -> Result<u64, AllocationError> {
        let released = self
            .db
            .release_nodes(&reservation.job_id, &reservation.nodes)
            .await?;
        info!(job_id = %reservation.job_id, released, "Nodes released");
        Ok(released)
    }

    async fn rollback(&self, job_id: &str, held: &[String]) {
        if held.is_empty() {
            return;
        }
        if let Err(e) = self.db.release_nodes(job_id, held).await {
            warn!(job_id, error = %e, "Failed to roll back partial reservation");
        }
    }
}
