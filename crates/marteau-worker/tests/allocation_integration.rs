#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Node reservation across two store handles on the same database file,
//! standing in for two worker processes.

use std::collections::HashSet;

use marteau_worker::nodes::{AllocationError, NodeAllocator};
use marteau_worker::storage::Database;

async fn two_workers(nodes: &[&str]) -> (tempfile::TempDir, Database, Database) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marteau.db");
    let first = Database::open(&path).await.unwrap();
    let second = Database::open(&path).await.unwrap();
    for node in nodes {
        first.register_node(node).await.unwrap();
    }
    (dir, first, second)
}

#[tokio::test]
async fn concurrent_reservations_never_intersect() {
    let (_dir, first, second) = two_workers(&["n1", "n2", "n3", "n4"]).await;
    let a = NodeAllocator::new(first.clone());
    let b = NodeAllocator::new(second);

    let (left, right) = tokio::join!(a.reserve("job-a", 2), b.reserve("job-b", 2));
    let left = left.unwrap();
    let right = right.unwrap();

    let left_nodes: HashSet<_> = left.nodes.iter().collect();
    assert_eq!(left_nodes.len(), 2);
    assert!(right.nodes.iter().all(|n| !left_nodes.contains(n)));
    assert!(first.list_idle_nodes().await.unwrap().is_empty());

    for node in first.list_nodes().await.unwrap() {
        let owner = node.reserved_by.unwrap();
        if left.nodes.contains(&node.name) {
            assert_eq!(owner, "job-a");
        } else {
            assert_eq!(owner, "job-b");
        }
    }
}

#[tokio::test]
async fn contended_pool_grants_at_most_its_size() {
    let (_dir, first, second) = two_workers(&["n1", "n2", "n3"]).await;
    let a = NodeAllocator::new(first.clone());
    let b = NodeAllocator::new(second);

    let (left, right) = tokio::join!(a.reserve("job-a", 2), b.reserve("job-b", 2));

    let granted: Vec<_> = [&left, &right]
        .into_iter()
        .filter_map(|r| r.as_ref().ok())
        .collect();
    assert_eq!(granted.len(), 1);
    assert!(matches!(
        left.as_ref().err().or(right.as_ref().err()),
        Some(AllocationError::InsufficientCapacity { .. })
    ));
    // The loser holds nothing.
    assert_eq!(first.list_idle_nodes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn release_from_other_handle_frees_nodes() {
    let (_dir, first, second) = two_workers(&["A", "B"]).await;
    let reservation = NodeAllocator::new(first.clone())
        .reserve("job-a", 2)
        .await
        .unwrap();

    let released = NodeAllocator::new(second)
        .release(&reservation)
        .await
        .unwrap();

    assert_eq!(released, 2);
    assert_eq!(first.list_idle_nodes().await.unwrap().len(), 2);
}
