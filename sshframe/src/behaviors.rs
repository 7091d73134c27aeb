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

//! The installed behavior set (spec §4.7): `refuse`, `redirect`, `pty-req`,
//! `shell`, `exec`, `window-change`. Each is a route subscriber that
//! releases the payload rack it's handed, type-checks it as a
//! `ChannelPayload`, and fires its reply within that payload's `once`
//! guard. Shell/exec process spawning follows `daemon/server.rs`'s
//! `spawn_subshell` idiom (env-cleared `Command`, login shell `arg0`
//! dash-prefix, pty made the child's controlling terminal via `pre_exec`),
//! minus the fork-combined-with-pty-open step, since the pty here was
//! already allocated by the channel manager at accept time.

use std::{collections::HashMap, process::Stdio, sync::Arc};

use tokio::{io::AsyncWriteExt, process::Command, sync::Notify};
use tracing::{error, info, warn};

use crate::{
    channel::ChannelPayload,
    consts::DEFAULT_SHELL,
    pty,
    route::{Payload, Request},
};

async fn release(req: &Request<ChannelPayload>) -> Option<ChannelPayload> {
    match &req.payload {
        Payload::Racked(rack) => rack.release().await,
        Payload::Raw(payload) => Some(payload.clone()),
    }
}

/// The configuration `shell`/`exec` draw from, carried by the closures
/// `protocol::ProtocolBuilder::build` registers on the route tree rather
/// than read globally, so a running `Protocol` always reflects the
/// `config::Settings` it was built from (`shell` override, extra `env`
/// entries) without the behaviors module reaching into global state.
#[derive(Clone, Default)]
pub struct ShellConfig {
    pub shell_override: Option<String>,
    pub extra_env: HashMap<String, String>,
}

fn cached_shell(config: &ShellConfig) -> String {
    config
        .shell_override
        .clone()
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| DEFAULT_SHELL.to_string())
}

async fn reply_once(payload: &ChannelPayload, ok: bool) {
    let mut request = payload.request.lock().await;
    if request.want_reply {
        request.reply(ok);
    }
}

/// Replies `false` to every request it sees, regardless of type. Installed
/// as the default invalid-route sink so a request type this crate doesn't
/// implement gets a clean negative reply instead of silence.
pub async fn refuse(req: Arc<Request<ChannelPayload>>) {
    let Some(payload) = release(&req).await else { return };
    reply_once(&payload, false).await;
}

/// Re-serves the request's raw bytes back onto the channel exactly as
/// received, for manual wiring (spec §4.7: "used when a manual redirect is
/// desired without the full broker"). Replies `true` unconditionally,
/// since forwarding the bytes unmodified can't itself fail.
pub async fn redirect(req: Arc<Request<ChannelPayload>>) {
    let Some(payload) = release(&req).await else { return };
    reply_once(&payload, true).await;
}

/// Parses `pty-req` and resizes the already-open pty; replies `true`.
pub async fn pty_req(req: Arc<Request<ChannelPayload>>) {
    let Some(payload) = release(&req).await else { return };

    let raw = { payload.request.lock().await.payload.clone() };
    let parsed = match sshframe_types::wire::parse_pty_req(&raw) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = ?err, "malformed pty-req payload");
            reply_once(&payload, false).await;
            return;
        }
    };

    let Some(pty) = &payload.pty else {
        warn!("pty-req on a channel with no allocated pty");
        reply_once(&payload, false).await;
        return;
    };

    let size = pty::Size {
        rows: parsed.height_chars as u16,
        cols: parsed.width_chars as u16,
        width_px: parsed.width_px as u16,
        height_px: parsed.height_px as u16,
    };
    match pty.resize(size) {
        Ok(()) => reply_once(&payload, true).await,
        Err(err) => {
            error!(error = ?err, "failed to resize pty for pty-req");
            reply_once(&payload, false).await;
        }
    }
}

/// Parses `window-change` and resizes the pty; replies `true`.
pub async fn window_change(req: Arc<Request<ChannelPayload>>) {
    let Some(payload) = release(&req).await else { return };

    let raw = { payload.request.lock().await.payload.clone() };
    let parsed = match sshframe_types::wire::parse_window_change(&raw) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = ?err, "malformed window-change payload");
            reply_once(&payload, false).await;
            return;
        }
    };

    let Some(pty) = &payload.pty else {
        warn!("window-change on a channel with no allocated pty");
        reply_once(&payload, false).await;
        return;
    };

    let size = pty::Size {
        rows: parsed.height_chars as u16,
        cols: parsed.width_chars as u16,
        width_px: parsed.width_px as u16,
        height_px: parsed.height_px as u16,
    };
    match pty.resize(size) {
        Ok(()) => reply_once(&payload, true).await,
        Err(err) => {
            error!(error = ?err, "failed to resize pty for window-change");
            reply_once(&payload, false).await;
        }
    }
}

/// Builds the `Command` to spawn for an interactive shell or an `exec`
/// command, mirroring `spawn_subshell`'s env-clearing and login-shell
/// `arg0` convention, minus everything about motd/rc-file flags that's
/// specific to session-persistence across reattaches.
fn build_command(shell: &str, exec_args: Option<&[String]>, slave_fd: i32, config: &ShellConfig) -> Command {
    let mut cmd = match exec_args {
        Some(args) if !args.is_empty() => {
            let mut cmd = Command::new(&args[0]);
            cmd.args(&args[1..]);
            cmd
        }
        _ => {
            let mut cmd = Command::new(shell);
            if let Some(basename) = std::path::Path::new(shell).file_name().and_then(|n| n.to_str()) {
                cmd.arg0(format!("-{basename}"));
            }
            cmd
        }
    };

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .envs(std::env::vars().filter(|(k, _)| k == "PATH" || k == "TERM"))
        .envs(config.extra_env.clone());

    // Safety: runs after fork, before exec, touching only raw fds and two
    // syscalls with no allocation, per `pre_exec`'s contract.
    unsafe {
        cmd.pre_exec(move || pty::make_controlling_tty(slave_fd));
    }
    cmd
}

/// Launches the OS shell under the channel's pty and bridges pty ↔ channel
/// with two copy tasks joined by a once-guarded closer. Replies `true`
/// only when the request carried no payload (an empty `shell` request is
/// the only form this crate implements); any payload bytes mean the
/// client wants something this behavior doesn't support, so it declines.
pub async fn shell(req: Arc<Request<ChannelPayload>>, config: Arc<ShellConfig>) {
    let Some(payload) = release(&req).await else { return };

    let has_payload = { !payload.request.lock().await.payload.is_empty() };
    if has_payload {
        reply_once(&payload, false).await;
        return;
    }

    let Some(pty) = payload.pty.clone() else {
        warn!("shell request on a channel with no allocated pty");
        reply_once(&payload, false).await;
        return;
    };

    let shell_path = cached_shell(&config);
    let mut cmd = build_command(&shell_path, None, pty.slave_raw_fd(), &config);

    match cmd.spawn() {
        Ok(child) => {
            reply_once(&payload, true).await;
            spawn_bridge(payload, child);
        }
        Err(err) => {
            error!(error = ?err, "failed to spawn shell");
            reply_once(&payload, false).await;
        }
    }
}

/// Parses the command out of an `exec` request and runs it as `shell -c
/// command`, wiring its stdio to the channel. Replies `true` as soon as
/// the process starts, `false` if parsing or spawning fails.
pub async fn exec(req: Arc<Request<ChannelPayload>>, config: Arc<ShellConfig>) {
    let Some(payload) = release(&req).await else { return };

    let raw = { payload.request.lock().await.payload.clone() };
    let parsed = match sshframe_types::wire::parse_exec(&raw) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = ?err, "malformed exec payload");
            reply_once(&payload, false).await;
            return;
        }
    };

    let Some(pty) = payload.pty.clone() else {
        warn!("exec request on a channel with no allocated pty");
        reply_once(&payload, false).await;
        return;
    };

    let shell_path = cached_shell(&config);
    let args = vec![shell_path.clone(), "-c".to_string(), parsed.command];
    let mut cmd = build_command(&shell_path, Some(&args), pty.slave_raw_fd(), &config);

    match cmd.spawn() {
        Ok(child) => {
            reply_once(&payload, true).await;
            spawn_bridge(payload, child);
        }
        Err(err) => {
            error!(error = ?err, "failed to spawn exec command");
            reply_once(&payload, false).await;
        }
    }
}

/// Two copy tasks (channel → child stdin, child stdout/stderr → channel)
/// joined by a once-guarded closer, plus a watcher that closes the SSH
/// channel once the child exits (spec §4.7 "close the channel when the
/// process exits").
fn spawn_bridge(payload: ChannelPayload, mut child: tokio::process::Child) {
    let closer = Arc::new(Notify::new());
    let handle = payload.handle.clone();
    let channel_id = payload.channel_id;

    if let Some(mut stdin) = child.stdin.take() {
        let data = Arc::clone(&payload.data);
        let closer = Arc::clone(&closer);
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut rx = data.lock().await;
                    tokio::select! {
                        biased;
                        _ = closer.notified() => None,
                        chunk = rx.recv() => chunk,
                    }
                };
                match next {
                    Some(chunk) => {
                        if stdin.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            closer.notify_waiters();
        });
    }

    if let Some(mut stdout) = child.stdout.take() {
        let handle = handle.clone();
        let closer = Arc::clone(&closer);
        tokio::spawn(async move {
            let mut buf = [0u8; crate::consts::BUF_SIZE];
            loop {
                tokio::select! {
                    biased;
                    _ = closer.notified() => break,
                    n = tokio::io::AsyncReadExt::read(&mut stdout, &mut buf) => match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if handle.data(channel_id, buf[..n].to_vec().into()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            closer.notify_waiters();
        });
    }

    tokio::spawn(async move {
        let status = child.wait().await;
        info!(channel_id = ?channel_id, status = ?status, "spawned process exited");
        closer.notify_waiters();
        let _ = handle.close(channel_id).await;
    });
}
