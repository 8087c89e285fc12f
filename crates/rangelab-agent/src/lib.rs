// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rangelab Agent - Laboratory Orchestration
//!
//! The agent provisions isolated network "labs" on a container
//! orchestrator and drives their lifecycle on behalf of a controller.
//! Each lab owns a child CIDR carved from the configured parent range, a
//! namespace, a default-deny network policy, an in-namespace CoreDNS
//! server at the child's first address, and any number of challenge
//! instances with fixed addresses and DNS records.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Controller                               │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │ QUIC (rangelab-protocol)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    rangelab-agent (this crate)                  │
//! │  ┌──────────┐  ┌───────────┐  ┌──────────────┐  ┌────────────┐  │
//! │  │   RPC    │─▶│ Use case  │─▶│ Lab/DNS/     │─▶│ Kubernetes │  │
//! │  │ dispatch │  │ (fan-out) │  │ Challenge    │  │  adapter   │  │
//! │  └──────────┘  └─────┬─────┘  │ services     │  └────────────┘  │
//! │                      │        └──────┬───────┘                  │
//! │                ┌─────▼─────┐  ┌──────▼───────┐                  │
//! │                │  Worker   │  │ IPAM+Catalog │                  │
//! │                │   pool    │  │  (Postgres)  │                  │
//! │                └───────────┘  └──────────────┘                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Agent configuration from environment variables
//! - [`catalog`]: Durable record of existing labs
//! - [`error`]: Error kinds and the batch multi-error
//! - [`ipam`]: Hierarchical IP address management
//! - [`kubernetes`]: Typed facade over the container platform
//! - [`migrations`]: Schema migrations applied before serving
//! - [`model`]: Domain types shared across services
//! - [`server`]: RPC dispatch and the monitoring stream
//! - [`service`]: Lab, DNS, challenge and status services
//! - [`usecase`]: Batch fan-out over the worker pool
//! - [`worker`]: Bounded-concurrency executor with keyed deduplication

pub mod catalog;
pub mod config;
pub mod error;
pub mod ipam;
pub mod kubernetes;
pub mod migrations;
pub mod model;
pub mod server;
pub mod service;
pub mod usecase;
pub mod worker;

pub use config::Config;
pub use error::Error;
