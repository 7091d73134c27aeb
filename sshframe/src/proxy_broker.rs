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

//! The proxy channel broker (spec §4.6): subscribes to `NetworkOpen` and,
//! for every accepted proxy-mode channel, opens the matching upstream
//! channel, forwards out-of-band requests bidirectionally, and copies
//! bytes in both directions through the session's byte taps until either
//! side closes. Generalizes `shell::SessionInner::spawn_shell_to_client`'s
//! byte-pump (a reader thread tee-ing into multiple sinks while watching a
//! control channel) and `daemon::exit_notify::ExitNotifier`'s once-guarded
//! completion signal.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

use crate::{
    channel::ChannelNetwork,
    consts::{REQ_ENV, REQ_EXEC, REQ_EXIT_STATUS, REQ_PTY, REQ_SHELL, REQ_WINDOW_CHANGE},
    pipe::Topic,
    session::SessionManager,
};

/// Replaces an upstream channel with an instrumented reader before copying
/// begins (spec §4.6 step 4's "optional `ChannelMaker` hook"). Given the
/// session and the raw bytes read from upstream, returns the bytes that
/// should actually be forwarded downstream — the identity hook if the
/// protocol installs none.
pub trait ChannelMaker: Send + Sync {
    fn intercept(&self, session: &crate::session::Session, chunk: &[u8]) -> Vec<u8>;
}

pub struct IdentityChannelMaker;
impl ChannelMaker for IdentityChannelMaker {
    fn intercept(&self, _session: &crate::session::Session, chunk: &[u8]) -> Vec<u8> {
        chunk.to_vec()
    }
}

pub struct ProxyBroker {
    sessions: Arc<SessionManager>,
    network_close: Arc<Topic<crate::channel::ChannelClosed>>,
    channel_maker: Arc<dyn ChannelMaker>,
}

impl ProxyBroker {
    pub fn new(
        sessions: Arc<SessionManager>,
        network_close: Arc<Topic<crate::channel::ChannelClosed>>,
        channel_maker: Option<Arc<dyn ChannelMaker>>,
    ) -> Arc<Self> {
        Arc::new(ProxyBroker {
            sessions,
            network_close,
            channel_maker: channel_maker.unwrap_or_else(|| Arc::new(IdentityChannelMaker)),
        })
    }

    pub fn install(self: &Arc<Self>, network_open: &Topic<ChannelNetwork>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut rx = network_open.subscribe();
        tokio::spawn(async move {
            while let Some(network) = rx.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.bridge(network).await });
            }
        })
    }

    #[instrument(skip_all, fields(conn_id = network.conn.conn_id))]
    async fn bridge(self: Arc<Self>, network: ChannelNetwork) {
        // Step 1: session lookup.
        let Some(session) = self.sessions.get(&network.conn.addr) else {
            warn!(addr = %network.conn.addr, "no session registered, dropping proxy channel");
            let _ = network.handle.close(network.channel_id).await;
            return;
        };

        // Step 2: obtain the upstream handle and open a matching channel.
        let Some(upstream_slot) = &session.upstream else {
            error!("session has no upstream slot in proxy mode, dropping channel");
            let _ = network.handle.close(network.channel_id).await;
            return;
        };
        let upstream_channel = {
            let guard = upstream_slot.lock().await;
            let Some(upstream) = guard.as_ref() else {
                error!("proxy session has no connected upstream yet, dropping channel");
                let _ = network.handle.close(network.channel_id).await;
                return;
            };
            match upstream
                .handle
                .channel_open_session()
                .await
            {
                Ok(channel) => channel,
                Err(err) => {
                    error!(error = ?err, "failed to open upstream channel");
                    let _ = network.handle.close(network.channel_id).await;
                    return;
                }
            }
        };
        let upstream_channel_id = upstream_channel.id();

        let copy_closer = Arc::new(Notify::new());

        self.spawn_bridge(&network, &session, upstream_channel, Arc::clone(&copy_closer));
        self.spawn_teardown(network, session, upstream_channel_id, copy_closer).await;
    }

    /// Steps 3 and 4 combined into one task. `russh::client::Channel` owns
    /// its single receive stream and isn't `Clone`, so the request
    /// forwarder and the byte-copy loop the source models as independent
    /// tasks are multiplexed here over the one upstream `Channel` handle in
    /// a single `select!` loop instead — two tokio tasks both holding
    /// `&mut` on the same non-shareable handle isn't expressible, and a
    /// shared `Mutex` around it would let one direction's indefinite
    /// `wait()` starve the other.
    ///
    /// For each inbound out-of-band request from the downstream side, the
    /// matching typed method is invoked on the upstream channel (spec
    /// §4.6 step 3's `SendRequest(type, wantReply, payload)`) and its
    /// result, not a blind `true`, drives the reply. `exit-status` on
    /// either side, or either copy direction hitting EOF/error, fires the
    /// once-guarded `copy_closer` and ends the bridge.
    fn spawn_bridge(
        &self,
        network: &ChannelNetwork,
        session: &Arc<crate::session::Session>,
        mut upstream_channel: russh::client::Channel<super::channel::proxy::UpstreamHandler>,
        copy_closer: Arc<Notify>,
    ) {
        let channel_maker = Arc::clone(&self.channel_maker);
        let data = Arc::clone(&network.data);
        let requests = Arc::clone(&network.requests);
        let handle = network.handle.clone();
        let channel_id = network.channel_id;
        let protocol_closer = Arc::clone(&network.protocol_closer);
        let session = Arc::clone(session);

        tokio::spawn(async move {
            loop {
                let downstream_chunk = async {
                    let mut rx = data.lock().await;
                    rx.recv().await
                };
                let downstream_request = async {
                    let mut rx = requests.lock().await;
                    rx.recv().await
                };
                tokio::select! {
                    biased;
                    _ = protocol_closer.notified() => break,
                    _ = copy_closer.notified() => break,
                    request = downstream_request => {
                        let Some(mut request) = request else { continue };
                        let is_exit = request.request_type == REQ_EXIT_STATUS;
                        let ok = forward_to_upstream(&mut upstream_channel, &request.request_type, &request.payload).await;
                        if request.want_reply {
                            request.reply(ok);
                        }
                        if is_exit {
                            break;
                        }
                    }
                    chunk = downstream_chunk => {
                        let Some(chunk) = chunk else { break };
                        let chunk = channel_maker.intercept(&session, &chunk);
                        session.incoming.write(&chunk);
                        if upstream_channel.data(&chunk[..]).await.is_err() {
                            break;
                        }
                    }
                    msg = upstream_channel.wait() => {
                        let Some(msg) = msg else { break };
                        match msg {
                            russh::ChannelMsg::Data { data: bytes } => {
                                session.outgoing.write(&bytes);
                                if handle.data(channel_id, bytes.to_vec().into()).await.is_err() {
                                    break;
                                }
                            }
                            russh::ChannelMsg::ExtendedData { data: bytes, ext } => {
                                session.outgoing.write(&bytes);
                                if handle.extended_data(channel_id, ext, bytes.to_vec().into()).await.is_err() {
                                    break;
                                }
                            }
                            russh::ChannelMsg::ExitStatus { exit_status } => {
                                let _ = handle.exit_status_request(channel_id, exit_status).await;
                            }
                            russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
                            _ => {}
                        }
                    }
                }
            }
            copy_closer.notify_one();
        });
    }

    /// Step 5: waits for the copy-state notifier, then closes both sides,
    /// removes the session (idempotent), and emits `NetworkClose`.
    #[instrument(skip_all, fields(channel_id = ?network.channel_id))]
    async fn spawn_teardown(
        &self,
        network: ChannelNetwork,
        session: Arc<crate::session::Session>,
        upstream_channel_id: russh::ChannelId,
        copy_closer: Arc<Notify>,
    ) {
        copy_closer.notified().await;

        let _ = network.handle.close(network.channel_id).await;
        session.mark_ended();
        self.sessions.remove(&network.conn.addr);
        self.network_close.publish(crate::channel::ChannelClosed {
            conn: network.conn.clone(),
            channel_id: network.channel_id,
        });
        info!(upstream_channel_id = ?upstream_channel_id, "proxy channel torn down");
    }
}

/// Translates one downstream out-of-band request into the matching call on
/// the upstream `russh::client::Channel` (spec §4.6 step 3). `russh`
/// exposes typed methods rather than a generic `SendRequest`, so known
/// request types are decoded with `sshframe_types::wire` and re-issued
/// with `want_reply` always forced to `true` so the real upstream outcome
/// can be mirrored back; unrecognized types are refused rather than
/// silently dropped.
async fn forward_to_upstream(
    channel: &mut russh::client::Channel<super::channel::proxy::UpstreamHandler>,
    request_type: &str,
    payload: &[u8],
) -> bool {
    use sshframe_types::wire::{parse_exec, parse_pty_req, parse_window_change};

    match request_type {
        REQ_PTY => match parse_pty_req(payload) {
            Ok(req) => channel
                .request_pty(true, &req.term, req.width_chars, req.height_chars, req.width_px, req.height_px, &[])
                .await
                .is_ok(),
            Err(err) => {
                warn!(error = ?err, "malformed pty-req payload, refusing");
                false
            }
        },
        REQ_SHELL => channel.request_shell(true).await.is_ok(),
        REQ_EXEC => match parse_exec(payload) {
            Ok(req) => channel.exec(true, req.command).await.is_ok(),
            Err(err) => {
                warn!(error = ?err, "malformed exec payload, refusing");
                false
            }
        },
        REQ_WINDOW_CHANGE => match parse_window_change(payload) {
            Ok(req) => {
                // window-change has no reply on the wire; treat a clean
                // send as success for the downstream mirror.
                channel
                    .window_change(req.width_chars, req.height_chars, req.width_px, req.height_px)
                    .await
                    .is_ok()
            }
            Err(err) => {
                warn!(error = ?err, "malformed window-change payload, refusing");
                false
            }
        },
        REQ_ENV => {
            // `russh::client::Channel` has no per-variable env-forwarding
            // call; acknowledge without propagating upstream.
            true
        }
        other => {
            warn!(request_type = other, "unrecognized channel request, refusing");
            false
        }
    }
}
