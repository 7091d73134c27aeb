// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;

/// Observability callbacks that run synchronously around every accepted
/// TCP connection, before and after the SSH handshake respectively.
///
/// Hooks are invoked inline within the acceptor's control flow, so you
/// MUST NOT block for extended periods of time. If you need to do work
/// that could block for a while, spin up a worker task and enqueue events
/// so the hooks can be processed asynchronously.
///
/// Either hook may return an error, which causes the connection to be
/// logged and skipped rather than proceeding to (or past) the handshake.
///
/// All hooks do nothing by default.
#[async_trait::async_trait]
pub trait Hooks {
    /// Runs synchronously on every accepted TCP connection, before the SSH
    /// handshake is attempted. Returning an error rejects the connection.
    async fn before(&self, _peer: SocketAddr) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs synchronously immediately after a successful SSH handshake.
    /// Returning an error drops the connection that was just established.
    async fn after(&self, _peer: SocketAddr) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The default hook set: does nothing, rejects nothing.
pub struct NoopHooks;

#[async_trait::async_trait]
impl Hooks for NoopHooks {}
