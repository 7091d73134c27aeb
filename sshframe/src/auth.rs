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

//! Authentication predicates (spec §6). `sshframe` ships no authentication
//! backend of its own — callers supply one of a password or public-key
//! predicate per protocol instance, each wrapped so it receives the owning
//! `Protocol` as an implicit first argument and can populate session
//! state (spec §3 "Session... created by authentication callback on new
//! SSH connection").

use std::{net::SocketAddr, sync::Arc};

use russh_keys::key::PublicKey;

use crate::protocol::Protocol;

/// Identifies the connecting peer for an auth predicate: its remote
/// address and the username it asked to authenticate as.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub addr: SocketAddr,
    pub user: String,
}

/// What a successful auth predicate hands back: at minimum, confirmation
/// the login is allowed; `session_pass` lets a password predicate stash
/// the password into the `Session` it's about to create (spec §3's
/// `Session.pass`, an optional field populated only when password auth
/// was used).
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    pub session_pass: Option<String>,
}

pub type KeyAuthResult = anyhow::Result<Permissions>;
pub type PassAuthResult = anyhow::Result<Permissions>;

/// `keyAuth(connMeta, publicKey) -> permissions | error` (spec §6).
pub trait KeyAuth: Send + Sync {
    fn check(&self, protocol: &Arc<Protocol>, meta: &ConnMeta, public_key: &PublicKey) -> KeyAuthResult;
}

/// `passAuth(connMeta, password) -> permissions | error` (spec §6).
pub trait PassAuth: Send + Sync {
    fn check(&self, protocol: &Arc<Protocol>, meta: &ConnMeta, password: &str) -> PassAuthResult;
}

impl<F> KeyAuth for F
where
    F: Fn(&Arc<Protocol>, &ConnMeta, &PublicKey) -> KeyAuthResult + Send + Sync,
{
    fn check(&self, protocol: &Arc<Protocol>, meta: &ConnMeta, public_key: &PublicKey) -> KeyAuthResult {
        self(protocol, meta, public_key)
    }
}

impl<F> PassAuth for F
where
    F: Fn(&Arc<Protocol>, &ConnMeta, &str) -> PassAuthResult + Send + Sync,
{
    fn check(&self, protocol: &Arc<Protocol>, meta: &ConnMeta, password: &str) -> PassAuthResult {
        self(protocol, meta, password)
    }
}

/// Either auth mode a protocol can be configured with; `russh`'s handshake
/// accepts whichever methods the supplied `server::Config` advertises, and
/// the `Handler` only consults the predicate matching the method the
/// client actually attempted.
pub enum Auth {
    PublicKey(Arc<dyn KeyAuth>),
    Password(Arc<dyn PassAuth>),
    /// Accept either, trying public key first. Useful for a server that
    /// wants to support key-based login but fall back to a password for
    /// clients that don't offer one.
    Either { key: Arc<dyn KeyAuth>, pass: Arc<dyn PassAuth> },
}
