// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rangelab Protocol - QUIC + Protobuf communication layer
//!
//! The wire protocol between a rangelab controller and its agents.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    rangelab-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: Request/Response + monitoring prompt stream     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Auth: HS256 bearer token in every request envelope         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), optional mutual TLS               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each RPC opens one bidirectional QUIC stream carrying an [`agent_proto::RpcRequest`]
//! envelope and an [`agent_proto::RpcResponse`]. The monitoring method keeps its stream
//! open: the client sends empty prompts and the server answers each one with
//! a status snapshot.
//!
//! # Usage
//!
//! ```ignore
//! use rangelab_protocol::{AgentClient, agent_proto};
//!
//! let client = AgentClient::localhost(sign_key, auth_key)?;
//! client.connect().await?;
//!
//! let response = client
//!     .call(agent_proto::rpc_request::Request::CreateLabs(
//!         agent_proto::CreateLabsRequest {
//!             group_id: String::new(),
//!             cidr_mask: 26,
//!             count: 1,
//!         },
//!     ))
//!     .await?;
//! ```

pub mod client;
pub mod frame;
pub mod server;
pub mod token;

// Generated protobuf types for the agent protocol
pub mod agent_proto {
    include!(concat!(env!("OUT_DIR"), "/rangelab.agent.rs"));
}

pub use client::{AgentClient, AgentClientConfig, ClientError};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use server::{AgentServer, AgentServerConfig, ConnectionHandler, ServerError, StreamHandler};
pub use token::{Claims, TokenError};
