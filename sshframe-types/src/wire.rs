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

//! Encoding and decoding of SSH session-channel request payloads.
//!
//! These follow the standard SSH2 session request wire format (RFC 4254
//! §6.2, §6.5, §6.7): every variable-length field is a big-endian `u32`
//! length prefix followed by that many bytes, and every fixed-width field
//! is a big-endian `u32`. Behaviors decode these from the raw request
//! payload rather than relying on a transport library to have already
//! parsed them, so the wire format is owned here and tested directly.

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ByteOrder};

/// Decoded `pty-req` payload: `string TERM, uint32 width_chars,
/// uint32 height_chars, uint32 width_px, uint32 height_px, string modes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub width_chars: u32,
    pub height_chars: u32,
    pub width_px: u32,
    pub height_px: u32,
}

/// Decoded `window-change` payload: `uint32 width_chars, uint32
/// height_chars, uint32 width_px, uint32 height_px`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowChangeRequest {
    pub width_chars: u32,
    pub height_chars: u32,
    pub width_px: u32,
    pub height_px: u32,
}

/// Decoded `exec` payload: `string command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
}

fn take_u32(buf: &[u8], at: usize) -> anyhow::Result<u32> {
    if buf.len() < at + 4 {
        return Err(anyhow!("buffer too short to hold a uint32 at offset {}", at));
    }
    Ok(BigEndian::read_u32(&buf[at..at + 4]))
}

fn take_string(buf: &[u8], at: usize) -> anyhow::Result<(String, usize)> {
    let len = take_u32(buf, at)? as usize;
    let start = at + 4;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow!("string length overflow"))?;
    if buf.len() < end {
        return Err(anyhow!("buffer too short to hold a {}-byte string at offset {}", len, start));
    }
    let s = String::from_utf8(buf[start..end].to_vec()).context("string field is not utf8")?;
    Ok((s, end))
}

pub fn parse_pty_req(payload: &[u8]) -> anyhow::Result<PtyRequest> {
    let (term, after_term) = take_string(payload, 0).context("parsing pty-req TERM")?;
    let width_chars = take_u32(payload, after_term).context("parsing pty-req width_chars")?;
    let height_chars = take_u32(payload, after_term + 4).context("parsing pty-req height_chars")?;
    let width_px = take_u32(payload, after_term + 8).context("parsing pty-req width_px")?;
    let height_px = take_u32(payload, after_term + 12).context("parsing pty-req height_px")?;
    // a trailing `string modes` field follows but no behavior in this
    // system needs the terminal mode bitmap, so it is not decoded.
    Ok(PtyRequest { term, width_chars, height_chars, width_px, height_px })
}

pub fn encode_pty_req(req: &PtyRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + req.term.len() + 16 + 4);
    buf.extend_from_slice(&(req.term.len() as u32).to_be_bytes());
    buf.extend_from_slice(req.term.as_bytes());
    buf.extend_from_slice(&req.width_chars.to_be_bytes());
    buf.extend_from_slice(&req.height_chars.to_be_bytes());
    buf.extend_from_slice(&req.width_px.to_be_bytes());
    buf.extend_from_slice(&req.height_px.to_be_bytes());
    // empty `modes` string
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf
}

pub fn parse_window_change(payload: &[u8]) -> anyhow::Result<WindowChangeRequest> {
    let width_chars = take_u32(payload, 0).context("parsing window-change width_chars")?;
    let height_chars = take_u32(payload, 4).context("parsing window-change height_chars")?;
    let width_px = take_u32(payload, 8).context("parsing window-change width_px")?;
    let height_px = take_u32(payload, 12).context("parsing window-change height_px")?;
    Ok(WindowChangeRequest { width_chars, height_chars, width_px, height_px })
}

pub fn encode_window_change(req: &WindowChangeRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&req.width_chars.to_be_bytes());
    buf.extend_from_slice(&req.height_chars.to_be_bytes());
    buf.extend_from_slice(&req.width_px.to_be_bytes());
    buf.extend_from_slice(&req.height_px.to_be_bytes());
    buf
}

pub fn parse_exec(payload: &[u8]) -> anyhow::Result<ExecRequest> {
    let (command, _) = take_string(payload, 0).context("parsing exec command")?;
    Ok(ExecRequest { command })
}

pub fn encode_exec(req: &ExecRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + req.command.len());
    buf.extend_from_slice(&(req.command.len() as u32).to_be_bytes());
    buf.extend_from_slice(req.command.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_req_round_trip() {
        let req = PtyRequest {
            term: "xterm-256color".to_string(),
            width_chars: 80,
            height_chars: 24,
            width_px: 640,
            height_px: 480,
        };
        let encoded = encode_pty_req(&req);
        let decoded = parse_pty_req(&encoded).expect("decodes");
        assert_eq!(decoded, req);
    }

    #[test]
    fn window_change_round_trip() {
        let req = WindowChangeRequest { width_chars: 120, height_chars: 40, width_px: 0, height_px: 0 };
        let encoded = encode_window_change(&req);
        let decoded = parse_window_change(&encoded).expect("decodes");
        assert_eq!(decoded, req);
    }

    #[test]
    fn exec_round_trip() {
        let req = ExecRequest { command: "ls -la /tmp".to_string() };
        let encoded = encode_exec(&req);
        let decoded = parse_exec(&encoded).expect("decodes");
        assert_eq!(decoded, req);
    }

    #[test]
    fn pty_req_rejects_truncated_payload() {
        let mut encoded = encode_pty_req(&PtyRequest {
            term: "xterm".to_string(),
            width_chars: 80,
            height_chars: 24,
            width_px: 0,
            height_px: 0,
        });
        encoded.truncate(encoded.len() - 10);
        assert!(parse_pty_req(&encoded).is_err());
    }

    #[test]
    fn exec_rejects_non_utf8_command() {
        let mut payload = vec![0, 0, 0, 2];
        payload.extend_from_slice(&[0xff, 0xfe]);
        assert!(parse_exec(&payload).is_err());
    }
}
