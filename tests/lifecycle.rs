//! Environment lifecycle scenarios against an in-memory cluster

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use hive::environment::EnvironmentStatus;
use hive::retry::RetryConfig;
use hive::store::{ResourceKind, ResourceStore};
use hive::Error;

use common::{coordinator, descriptor, routing_table, FakeStore, PROXY, PROXY_ADDRESS};

#[tokio::test]
async fn single_environment_is_routed_through_the_proxy() {
    let store = FakeStore::new();
    store.preset_address("hive-cs101-hw1-abc123", "10.0.0.5");
    let coordinator = coordinator(&store);
    coordinator.start(&RetryConfig::once()).await.unwrap();

    let env = coordinator
        .create_environment(&descriptor("cs101", "hw1", "abc123"))
        .await
        .unwrap();

    assert_eq!(env.status, EnvironmentStatus::Ready);
    let config = store.routing_config(PROXY).unwrap();
    assert_eq!(config.location_count(), 1);
    assert!(config.as_str().contains("location /cs101/hw1/abc123/ {"));
    assert!(config.as_str().contains("proxy_pass http://10.0.0.5:80/;"));
}

#[tokio::test]
async fn failed_endpoint_leaves_no_workload_behind() {
    let store = FakeStore::new();
    let coordinator = coordinator(&store);
    coordinator.start(&RetryConfig::once()).await.unwrap();
    store.fail_endpoint_creates(true);

    let err = coordinator
        .create_environment(&descriptor("cs101", "hw1", "abc123"))
        .await
        .unwrap_err();

    match err {
        Error::ResourceCreateFailed { kind, name, .. } => {
            assert_eq!(kind, ResourceKind::Network);
            assert_eq!(name, "hive-cs101-hw1-abc123");
        }
        other => panic!("Expected ResourceCreateFailed, got {other:?}"),
    }
    assert!(!store.workload_exists("hive-cs101-hw1-abc123").await.unwrap());
    assert_eq!(store.endpoint_count(), 0);
    assert!(coordinator.routing().snapshot().routes.is_empty());
}

#[tokio::test]
async fn deleting_twice_succeeds_and_unroutes() {
    let store = FakeStore::new();
    let coordinator = coordinator(&store);
    coordinator.start(&RetryConfig::once()).await.unwrap();

    let desc = descriptor("cs101", "hw1", "abc123");
    coordinator.create_environment(&desc).await.unwrap();
    assert_eq!(store.routing_config(PROXY).unwrap().location_count(), 1);

    coordinator.delete_environment(&desc.id).await.unwrap();
    coordinator.delete_environment(&desc.id).await.unwrap();

    assert!(coordinator.environment(&desc.id).is_none());
    assert!(!store.workload_exists(&desc.id.resource_name()).await.unwrap());
    let config = store.routing_config(PROXY).unwrap();
    assert!(!config.as_str().contains("/cs101/hw1/abc123/"));
    assert_eq!(config.location_count(), 0);
}

#[tokio::test]
async fn colliding_identities_do_not_share_resources() {
    let store = FakeStore::new();
    let coordinator = coordinator(&store);
    coordinator.start(&RetryConfig::once()).await.unwrap();

    let first = descriptor("a-b", "c", "d");
    let second = descriptor("a", "b-c", "d");
    assert_eq!(first.id.resource_name(), second.id.resource_name());

    coordinator.create_environment(&first).await.unwrap();
    let err = coordinator.create_environment(&second).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "got {err:?}");
    assert!(coordinator.environment(&second.id).is_none());

    coordinator.delete_environment(&second.id).await.unwrap();

    assert!(store.workload_exists("hive-a-b-c-d").await.unwrap());
    assert_eq!(store.endpoint_count(), 1);
    assert!(coordinator.routing().snapshot().routes.contains_key("a-b/c/d"));
    assert_eq!(
        coordinator.environment(&first.id).map(|e| e.status),
        Some(EnvironmentStatus::Ready)
    );
}

#[tokio::test]
async fn creating_twice_keeps_the_running_environment() {
    let store = FakeStore::new();
    let coordinator = coordinator(&store);
    coordinator.start(&RetryConfig::once()).await.unwrap();

    let desc = descriptor("cs101", "hw1", "abc123");
    let running = coordinator.create_environment(&desc).await.unwrap();

    let err = coordinator.create_environment(&desc).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "got {err:?}");

    let tracked = coordinator.environment(&desc.id).unwrap();
    assert_eq!(tracked.status, EnvironmentStatus::Ready);
    assert_eq!(tracked.backend_address, running.backend_address);
    assert_eq!(store.routing_config(PROXY).unwrap().location_count(), 1);
}

#[tokio::test]
async fn rendered_config_ignores_insertion_order() {
    let routes = [
        ("cs101/hw1/abc123", "10.0.0.5"),
        ("cs101/hw1/def456", "10.0.0.6"),
        ("cs202/lab2/xyz789", "10.0.0.7"),
    ];

    let forward_store = FakeStore::new();
    let forward = routing_table(&forward_store);
    forward.provision(BTreeMap::new()).await.unwrap();
    for (key, backend) in routes {
        forward.add_route(key, backend).await.unwrap();
    }

    let reverse_store = FakeStore::new();
    let reverse = routing_table(&reverse_store);
    reverse.provision(BTreeMap::new()).await.unwrap();
    for (key, backend) in routes.iter().rev() {
        reverse.add_route(key, backend).await.unwrap();
    }

    assert_eq!(
        forward_store.routing_config(PROXY),
        reverse_store.routing_config(PROXY)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_route_additions_are_serialised() {
    const N: usize = 24;
    let store = FakeStore::new();
    let table = routing_table(&store);
    table.provision(BTreeMap::new()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..N {
        let table = table.clone();
        handles.push(tokio::spawn(async move {
            table
                .add_route(&format!("cs101/hw1/student{i}"), &format!("10.1.0.{}", i + 1))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(!store.saw_overlapping_applies());
    let snapshot = table.snapshot();
    assert_eq!(snapshot.routes.len(), N);
    assert_eq!(snapshot.version, N as u64);
    assert_eq!(store.routing_config(PROXY).unwrap().location_count(), N);
    // One apply for provisioning plus one per added route.
    assert_eq!(store.applies().len(), N + 1);
}

#[tokio::test]
async fn restart_rebuilds_routes_from_existing_environments() {
    let store = FakeStore::new();
    let first = coordinator(&store);
    first.start(&RetryConfig::once()).await.unwrap();
    let a = descriptor("cs101", "hw1", "abc123");
    let b = descriptor("cs101", "hw1", "def456");
    first.create_environment(&a).await.unwrap();
    first.create_environment(&b).await.unwrap();
    let before = first.routing().snapshot().routes;
    drop(first);

    let second = coordinator(&store);
    let found = second.start(&RetryConfig::once()).await.unwrap();

    assert_eq!(found, 2);
    assert_eq!(second.routing().snapshot().routes, before);
    assert_eq!(
        second.environment(&a.id).map(|e| e.status),
        Some(EnvironmentStatus::Ready)
    );
    assert_eq!(store.routing_config(PROXY).unwrap().location_count(), 2);
}

#[tokio::test]
async fn batch_of_students_get_distinct_routes() {
    let store = FakeStore::new();
    let coordinator = Arc::new(coordinator(&store));
    coordinator.start(&RetryConfig::once()).await.unwrap();

    let students = ["abc123", "def456", "ghi789", "jkl012"];
    let mut handles = Vec::new();
    for student in students {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .create_environment(&descriptor("Intro to CS", "Homework 1", student))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let routes = coordinator.routing().snapshot().routes;
    assert_eq!(routes.len(), students.len());
    for student in students {
        assert!(routes.contains_key(&format!("intro-to-cs/homework-1/{student}")));
    }
    assert_eq!(coordinator.environments().len(), students.len());
}

#[tokio::test]
async fn proxy_address_is_looked_up_once() {
    let store = FakeStore::new();
    let coordinator = coordinator(&store);
    coordinator.start(&RetryConfig::once()).await.unwrap();

    assert_eq!(coordinator.proxy_address().await.unwrap(), PROXY_ADDRESS);
    assert_eq!(coordinator.proxy_address().await.unwrap(), PROXY_ADDRESS);
    assert_eq!(store.proxy_lookups(), 1);
}

#[tokio::test]
async fn teardown_removes_the_routing_resource() {
    let store = FakeStore::new();
    let table = routing_table(&store);
    table.provision(BTreeMap::new()).await.unwrap();
    assert!(store.routing_config(PROXY).is_some());

    table.teardown().await.unwrap();
    table.teardown().await.unwrap();
    assert!(store.routing_config(PROXY).is_none());
}
