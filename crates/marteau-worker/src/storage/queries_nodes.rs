//! Node registry queries.

use marteau_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{NodeRow, NodeStatus};

impl Database {
    /// Register a worker node as idle. Returns `false` if it already exists.
    pub async fn register_node(&self, name: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO nodes (name, status, created_at, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(NodeStatus::Idle.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a node by name.
    pub async fn get_node(&self, name: &str) -> Result<NodeRow, DatabaseError> {
        sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Node {name}")))
    }

    /// List every registered node.
    pub async fn list_nodes(&self) -> Result<Vec<NodeRow>, DatabaseError> {
        let nodes = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY name ASC")
            .fetch_all(self.pool())
            .await?;

        Ok(nodes)
    }

    /// List nodes currently idle.
    pub async fn list_idle_nodes(&self) -> Result<Vec<NodeRow>, DatabaseError> {
        let nodes =
            sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE status = ? ORDER BY name ASC")
                .bind(NodeStatus::Idle.as_str())
                .fetch_all(self.pool())
                .await?;

        Ok(nodes)
    }

    /// Compare-and-set a node from idle to working on behalf of `job_id`.
    ///
    /// Returns `false` when the node was no longer idle.
    pub async fn try_reserve_node(&self, name: &str, job_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE nodes SET status = ?, reserved_by = ?, updated_at = ? WHERE name = ? AND status = ?",
        )
        .bind(NodeStatus::Working.as_str())
        .bind(job_id)
        .bind(unix_timestamp())
        .bind(name)
        .bind(NodeStatus::Idle.as_str())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Return the given nodes to idle, touching only those still held by
    /// `job_id`. Returns the number of nodes released.
    pub async fn release_nodes(&self, job_id: &str, names: &[String]) -> Result<u64, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        let mut released = 0;

        for name in names {
            released += sqlx::query(
                "UPDATE nodes SET status = ?, reserved_by = NULL, updated_at = ? WHERE name = ? AND reserved_by = ?",
            )
            .bind(NodeStatus::Idle.as_str())
            .bind(now)
            .bind(name)
            .bind(job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(released)
    }
}
