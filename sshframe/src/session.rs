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

//! Per-client state, addressed by remote network address (spec §3
//! "Session"). `SessionManager` is the "per-protocol mapping from remote
//! address to a `Session`" of spec §2, backed by `dashmap::DashMap` rather
//! than a plain `Mutex<HashMap<..>>` like `daemon/server.rs`'s `shells`
//! table: the session table sits on the hot path of every proxy-mode
//! channel open, where that shell table only takes a lock once per attach,
//! so sharding pays for itself here in a way it wouldn't for the route
//! tree's far less contended child map.

use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use russh::client::Handle as UpstreamHandle;
use tokio::sync::broadcast;
use tracing::debug;

/// A tee point: every byte that flows through the proxy broker for a
/// session is published here, and a higher-layer recorder/inspector can
/// `subscribe()` to observe it. Lagging subscribers just miss old frames
/// rather than apply backpressure to the proxy copy loop, since nothing in
/// spec.md promises taps can't drop under load.
#[derive(Clone)]
pub struct ByteTap {
    tx: broadcast::Sender<Bytes>,
}

impl ByteTap {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        ByteTap { tx }
    }

    pub fn write(&self, chunk: &[u8]) {
        // No subscribers is the common case (nothing attached an
        // inspector); that's not an error, just a `send` nobody receives.
        let _ = self.tx.send(Bytes::copy_from_slice(chunk));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }
}

impl Default for ByteTap {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the session's upstream SSH connection, present only in proxy
/// mode. The session owns this handle; the proxy broker only ever reaches
/// it through the session, so a session's `Drop` is what ultimately closes
/// the upstream link, not the broker directly (spec §9's "cyclic
/// references" redesign note: the broker holds no strong reference back).
pub struct Upstream {
    pub handle: UpstreamHandle<super::channel::proxy::UpstreamHandler>,
    /// Opaque reference to whatever backing compute the upstream host runs
    /// on (a container id, a VM name, ...). Nothing in this crate
    /// interprets it; it exists so a subscriber/hook can correlate a
    /// session with its backing resource.
    pub container_ref: Option<String>,
}

pub struct Session {
    pub uuid: uuid::Uuid,
    pub addr: SocketAddr,
    pub user: String,
    pub pass: Option<String>,
    pub start: SystemTime,
    pub end: std::sync::Mutex<Option<SystemTime>>,
    pub incoming: ByteTap,
    pub outgoing: ByteTap,
    pub upstream: Option<tokio::sync::Mutex<Option<Upstream>>>,
}

impl Session {
    pub fn new_local(addr: SocketAddr, user: String, pass: Option<String>) -> Arc<Self> {
        Arc::new(Session {
            uuid: uuid::Uuid::new_v4(),
            addr,
            user,
            pass,
            start: SystemTime::now(),
            end: std::sync::Mutex::new(None),
            incoming: ByteTap::new(),
            outgoing: ByteTap::new(),
            upstream: None,
        })
    }

    pub fn new_proxy(addr: SocketAddr, user: String, pass: Option<String>) -> Arc<Self> {
        Arc::new(Session {
            uuid: uuid::Uuid::new_v4(),
            addr,
            user,
            pass,
            start: SystemTime::now(),
            end: std::sync::Mutex::new(None),
            incoming: ByteTap::new(),
            outgoing: ByteTap::new(),
            upstream: Some(tokio::sync::Mutex::new(None)),
        })
    }

    pub fn mark_ended(&self) {
        *self.end.lock().expect("session end-time lock poisoned") = Some(SystemTime::now());
    }

    pub fn to_summary(&self, mode: sshframe_types::SessionMode) -> sshframe_types::SessionSummary {
        let to_unix_ms =
            |t: SystemTime| t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
        sshframe_types::SessionSummary {
            uuid: self.uuid,
            addr: self.addr.to_string(),
            user: self.user.clone(),
            started_at_unix_ms: to_unix_ms(self.start),
            ended_at_unix_ms: self.end.lock().expect("session end-time lock poisoned").map(to_unix_ms),
            mode,
        }
    }
}

/// Per-protocol mapping from remote address to session (spec §3/§4
/// "Session Manager"). Get/set/remove are all lock-free w.r.t. each other
/// thanks to `DashMap`'s sharding; removal is idempotent, matching the
/// "session manager call is idempotent on double-remove" requirement of
/// spec §4.6 step 5.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<SocketAddr, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager { sessions: DashMap::new() }
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.addr, session);
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.get(addr).map(|entry| Arc::clone(entry.value()))
    }

    /// Idempotent: removing an address with no session registered is a
    /// silent no-op, never an error.
    pub fn remove(&self, addr: &SocketAddr) {
        if self.sessions.remove(addr).is_some() {
            debug!(%addr, "removed session");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[tokio::test]
    #[timeout(5000)]
    async fn insert_get_remove_round_trip() {
        let mgr = SessionManager::new();
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let session = Session::new_local(addr, "alice".to_string(), None);

        mgr.insert(Arc::clone(&session));
        assert!(mgr.get(&addr).is_some());

        mgr.remove(&addr);
        assert!(mgr.get(&addr).is_none());

        // Double-remove is a no-op, not an error/panic.
        mgr.remove(&addr);
    }

    #[test]
    fn byte_tap_tees_to_subscriber() {
        let tap = ByteTap::new();
        let mut rx = tap.subscribe();
        tap.write(b"hello");
        let got = rx.try_recv().expect("subscriber should observe the tee'd chunk");
        assert_eq!(&got[..], b"hello");
    }
}
