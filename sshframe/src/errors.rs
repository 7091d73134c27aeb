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

//! A small taxonomy of typed errors for the boundaries where callers need
//! to branch on *what kind* of failure occurred rather than just log an
//! opaque `anyhow::Error`. Everything else in this crate propagates with
//! `anyhow::Result` and `.context(...)`, same as the rest of the stack.

use thiserror::Error;

/// Channel-level faults (spec §7 "Channel faults"): the offending channel
/// is closed, the connection carries on.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    #[error("failed to allocate a pty: {0}")]
    PtyAllocation(#[source] anyhow::Error),

    #[error("no session registered for peer {0}")]
    NoSession(std::net::SocketAddr),

    #[error("failed to open upstream channel: {0}")]
    UpstreamOpen(#[source] anyhow::Error),
}

/// Per-request faults (spec §7): malformed payloads or a panicking
/// behavior reply `false` when a reply was wanted, and are otherwise
/// silent. The connection is unaffected.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request payload: {0}")]
    MalformedPayload(#[source] anyhow::Error),

    #[error("payload was not the expected ChannelPayload variant")]
    UnexpectedPayloadKind,
}

/// Configuration faults (spec §7): fatal at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read host key file {path}: {source}")]
    HostKeyUnreadable { path: String, #[source] source: std::io::Error },

    #[error("could not parse host key file {path}: {source}")]
    HostKeyUnparseable { path: String, #[source] source: anyhow::Error },

    #[error("could not read config file {path}: {source}")]
    ConfigUnreadable { path: String, #[source] source: std::io::Error },

    #[error("could not parse config file {path}: {source}")]
    ConfigUnparseable { path: String, #[source] source: toml::de::Error },
}
