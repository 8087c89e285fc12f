// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io::Result;

fn main() -> Result<()> {
    unsafe {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }

    // Compile the agent protocol (controller <-> agent RPC surface)
    prost_build::compile_protos(&["proto/agent.proto"], &["proto/"])?;

    Ok(())
}
