// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! IPAM store tests: durable allocation, concurrency and idempotence.
//! Gated on `TEST_DATABASE_URL`.

mod common;

use std::collections::HashSet;

use rangelab_agent::ipam::{IpamError, IpamManager};

#[tokio::test]
async fn child_cidrs_are_lowest_first_and_durable() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.120.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.120.0.0/16".parse().unwrap())
        .await
        .unwrap();

    let first = ipam.acquire_child_cidr(26).await.unwrap();
    let second = ipam.acquire_child_cidr(26).await.unwrap();
    assert_eq!(first.cidr().to_string(), "10.120.0.0/26");
    assert_eq!(second.cidr().to_string(), "10.120.0.64/26");

    // A fresh manager over the same pool sees the same state
    let rebound = IpamManager::new(pool.clone(), "10.120.0.0/16".parse().unwrap())
        .await
        .unwrap();
    rebound.get_child_cidr(first.cidr()).await.unwrap();
    let third = rebound.acquire_child_cidr(26).await.unwrap();
    assert_eq!(third.cidr().to_string(), "10.120.0.128/26");
}

#[tokio::test]
async fn concurrent_child_acquisitions_never_overlap() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.121.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.121.0.0/16".parse().unwrap())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ipam = ipam.clone();
        handles.push(tokio::spawn(async move {
            ipam.acquire_child_cidr(26).await.unwrap().cidr()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let cidr = handle.await.unwrap();
        assert!(seen.insert(cidr), "duplicate child {cidr}");
    }
}

#[tokio::test]
async fn release_is_idempotent_and_frees_the_block() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.122.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.122.0.0/16".parse().unwrap())
        .await
        .unwrap();

    let child = ipam.acquire_child_cidr(26).await.unwrap();
    let held = ipam.acquire_child_cidr(26).await.unwrap();
    assert_eq!(held.cidr().to_string(), "10.122.0.64/26");

    ipam.release_child_cidr(child.cidr()).await.unwrap();
    // Double release is tolerated
    ipam.release_child_cidr(child.cidr()).await.unwrap();

    // The freed gap is reused before higher blocks
    let reused = ipam.acquire_child_cidr(26).await.unwrap();
    assert_eq!(reused.cidr().to_string(), "10.122.0.0/26");
}

#[tokio::test]
async fn single_ips_start_after_the_network_address() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.123.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.123.0.0/16".parse().unwrap())
        .await
        .unwrap();
    let child = ipam.acquire_child_cidr(29).await.unwrap();

    assert_eq!(child.first_ip().to_string(), "10.123.0.1");

    let first = child.acquire_single_ip(None).await.unwrap();
    let second = child.acquire_single_ip(None).await.unwrap();
    assert_eq!(first.to_string(), "10.123.0.1");
    assert_eq!(second.to_string(), "10.123.0.2");

    // Release and re-acquire hands back the lowest free host
    child.release_single_ip(first).await.unwrap();
    child.release_single_ip(first).await.unwrap(); // tolerated
    let reacquired = child.acquire_single_ip(None).await.unwrap();
    assert_eq!(reacquired, first);
}

#[tokio::test]
async fn specific_ip_requests_are_validated() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.124.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.124.0.0/16".parse().unwrap())
        .await
        .unwrap();
    let child = ipam.acquire_child_cidr(29).await.unwrap();

    let wanted = "10.124.0.3".parse().unwrap();
    assert_eq!(child.acquire_single_ip(Some(wanted)).await.unwrap(), wanted);

    assert!(matches!(
        child.acquire_single_ip(Some(wanted)).await,
        Err(IpamError::AddressInUse(_))
    ));
    assert!(matches!(
        child.acquire_single_ip(Some("10.99.0.1".parse().unwrap())).await,
        Err(IpamError::AddressOutOfRange { .. })
    ));
    // The network address is not a usable host
    assert!(matches!(
        child.acquire_single_ip(Some("10.124.0.0".parse().unwrap())).await,
        Err(IpamError::AddressOutOfRange { .. })
    ));
}

#[tokio::test]
async fn child_exhaustion_is_reported() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.125.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.125.0.0/16".parse().unwrap())
        .await
        .unwrap();
    let child = ipam.acquire_child_cidr(30).await.unwrap();

    // A /30 has two usable hosts
    child.acquire_single_ip(None).await.unwrap();
    child.acquire_single_ip(None).await.unwrap();
    assert!(matches!(
        child.acquire_single_ip(None).await,
        Err(IpamError::ChildExhausted(_))
    ));
}

#[tokio::test]
async fn releasing_a_child_frees_its_addresses() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.126.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.126.0.0/16".parse().unwrap())
        .await
        .unwrap();

    let child = ipam.acquire_child_cidr(29).await.unwrap();
    child.acquire_single_ip(None).await.unwrap();
    ipam.release_child_cidr(child.cidr()).await.unwrap();

    // Re-acquiring the same block starts from a clean address table
    let fresh = ipam.acquire_child_cidr(29).await.unwrap();
    assert_eq!(fresh.cidr(), child.cidr());
    assert_eq!(
        fresh.acquire_single_ip(None).await.unwrap().to_string(),
        "10.126.0.1"
    );
}

#[tokio::test]
async fn invalid_block_sizes_are_rejected() {
    skip_if_no_db!();
    let pool = common::get_pool().await.expect("connect to test database");
    common::reset_parent(&pool, "10.127.0.0/16").await;

    let ipam = IpamManager::new(pool.clone(), "10.127.0.0/16".parse().unwrap())
        .await
        .unwrap();

    // Coarser than the parent, or too fine to hold hosts
    assert!(matches!(
        ipam.acquire_child_cidr(8).await,
        Err(IpamError::InvalidBlockSize { .. })
    ));
    assert!(matches!(
        ipam.acquire_child_cidr(31).await,
        Err(IpamError::InvalidBlockSize { .. })
    ));

    assert!(matches!(
        ipam.get_child_cidr("10.127.0.0/26".parse().unwrap()).await,
        Err(IpamError::UnknownChild(_))
    ));
}
