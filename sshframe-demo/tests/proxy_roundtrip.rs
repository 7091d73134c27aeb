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

//! End-to-end proxy round trip (spec.md's S6 testable property): a real
//! `Protocol` in local mode stands in for the final destination host, a
//! second `Protocol` in proxy mode bridges to it, and a real `russh`
//! client logs into the proxy and runs `exec`. Asserts the bytes the
//! client receives match what the upstream host actually produced, and
//! that the proxy's session byte tap observed the same bytes flowing
//! through `proxy_broker::ProxyBroker`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ntest::timeout;
use russh::ChannelMsg;
use sshframe::{
    auth::{Auth, ConnMeta, PassAuth, PassAuthResult, Permissions},
    protocol::{Descriptor, Protocol, ProtocolBuilder, UpstreamTarget},
};
use tokio::net::{TcpListener, TcpStream};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures")).join(name)
}

/// Accepts any password, stashing it on the session so proxy mode can pass
/// it through to the upstream host, exactly like `sshframe-demo`'s own
/// `DemoPassAuth`.
struct AcceptAnyPassword;

impl PassAuth for AcceptAnyPassword {
    fn check(&self, _protocol: &Arc<Protocol>, _meta: &ConnMeta, password: &str) -> PassAuthResult {
        Ok(Permissions { session_pass: Some(password.to_string()) })
    }
}

/// Binds an ephemeral port, reads back what the OS assigned, and drops the
/// listener immediately so `Protocol::serve` can bind that same address a
/// moment later.
async fn free_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok(addr)
}

/// Client-side `russh` handler for the test's own connection into the
/// proxy; accepts whatever host key is presented and otherwise does
/// nothing, mirroring `channel::proxy::UpstreamHandler`'s shape.
struct TestClientHandler;

#[async_trait]
impl russh::client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh_keys::key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Retries `TcpStream::connect` a few times so the test doesn't race the
/// spawned `Protocol::serve` task's initial `TcpListener::bind`.
async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let mut last_err = None;
    for _ in 0..50 {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    Err(last_err.expect("at least one connection attempt").into())
}

#[tokio::test]
#[timeout(30000)]
async fn exec_round_trips_through_proxy() -> Result<()> {
    let upstream_addr = free_addr().await?;
    let proxy_addr = free_addr().await?;

    let upstream_descriptor =
        Descriptor::new("tcp", "sshframe-test-upstream", upstream_addr.ip().to_string(), upstream_addr.port(), "default", "ssh");
    let upstream_auth = Auth::Password(Arc::new(AcceptAnyPassword));
    let upstream = ProtocolBuilder::new(upstream_descriptor, upstream_addr, fixture("upstream_ed25519"))
        .with_auth(upstream_auth)
        .build()
        .await
        .context("building upstream protocol")?;

    let proxy_descriptor =
        Descriptor::new("tcp", "sshframe-test-proxy", proxy_addr.ip().to_string(), proxy_addr.port(), "default", "ssh");
    let proxy_auth = Auth::Password(Arc::new(AcceptAnyPassword));
    let proxy = ProtocolBuilder::new(proxy_descriptor, proxy_addr, fixture("proxy_ed25519"))
        .with_auth(proxy_auth)
        .with_mode(sshframe::config::Mode::Proxy)
        .with_upstream(UpstreamTarget { address: upstream_addr.ip().to_string(), port: upstream_addr.port() })
        .build()
        .await
        .context("building proxy protocol")?;

    let upstream_serve = tokio::spawn({
        let upstream = Arc::clone(&upstream);
        async move { upstream.serve().await }
    });
    let proxy_serve = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.serve().await }
    });

    let stream = connect_with_retry(proxy_addr).await.context("connecting to proxy")?;
    let client_local_addr = stream.local_addr()?;

    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect_stream(config, stream, TestClientHandler)
        .await
        .context("ssh handshake with proxy")?;

    let authenticated = handle
        .authenticate_password("alice", "swordfish")
        .await
        .context("password auth against proxy")?;
    assert!(authenticated, "proxy should accept any password");

    // The proxy registers the session under the TCP peer address it saw
    // at accept time, which is exactly this socket's own local address.
    let session = proxy.sessions.get(&client_local_addr).expect("proxy should have registered a session for this client");
    let mut outgoing_tap = session.outgoing.subscribe();

    let mut channel = handle.channel_open_session().await.context("opening session channel")?;
    channel.exec(true, "echo sshframe-proxy-roundtrip").await.context("exec over proxy")?;

    let mut stdout = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(ChannelMsg::ExitStatus { .. }) => {}
            Some(_) => {}
        }
    }

    let output = String::from_utf8_lossy(&stdout);
    assert!(output.contains("sshframe-proxy-roundtrip"), "unexpected upstream output: {output:?}");

    // Drain what the proxy's byte tap saw and confirm it's a prefix of
    // what the client actually received, confirming the broker really
    // copied the upstream's bytes rather than synthesizing the reply.
    let mut tapped = Vec::new();
    while let Ok(chunk) = outgoing_tap.try_recv() {
        tapped.extend_from_slice(&chunk);
    }
    assert!(!tapped.is_empty(), "proxy should have tapped the upstream's output");
    assert_eq!(tapped, stdout, "tap should observe exactly what the client received");

    drop(handle);
    upstream.shutdown();
    proxy.shutdown();
    upstream_serve.abort();
    proxy_serve.abort();

    Ok(())
}
