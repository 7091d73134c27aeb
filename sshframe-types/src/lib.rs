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

use std::{collections::HashMap, fmt};

use serde_derive::{Deserialize, Serialize};

pub mod wire;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of a protocol endpoint: which service it belongs to, where it
/// listens, and a fresh identifier minted for this particular descriptor
/// instance.
///
/// Mirrors the Go `ProtocolDescriptor`: a pure value type, no behavior
/// beyond `host()`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Descriptor {
    pub service: String,
    pub address: String,
    pub port: u16,
    pub zone: String,
    pub scheme: String,
    pub proto: String,
    pub uuid: uuid::Uuid,
    /// Open bag of metadata a behavior or hook can stash values in.
    #[serde(default)]
    pub misc: HashMap<String, serde_json::Value>,
}

impl Descriptor {
    pub fn new(
        proto: impl Into<String>,
        service: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        zone: impl Into<String>,
        scheme: impl Into<String>,
    ) -> Self {
        Descriptor {
            service: service.into(),
            address: address.into(),
            port,
            zone: zone.into(),
            scheme: scheme.into(),
            proto: proto.into(),
            uuid: uuid::Uuid::new_v4(),
            misc: HashMap::new(),
        }
    }

    /// The combination of address and port in `addr:port` form, suitable
    /// for passing to a TCP listener.
    pub fn host(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A point-in-time snapshot of a live proxy/local session, suitable for
/// serialization to an observability or management surface.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionSummary {
    pub uuid: uuid::Uuid,
    pub addr: String,
    pub user: String,
    pub started_at_unix_ms: i64,
    pub ended_at_unix_ms: Option<i64>,
    pub mode: SessionMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Local,
    Proxy,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Local => write!(f, "local"),
            SessionMode::Proxy => write!(f, "proxy"),
        }
    }
}
