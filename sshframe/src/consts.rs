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

use std::time;

/// How long the acceptor waits for a TCP peer to finish the SSH handshake
/// before giving up and moving on to the next connection.
pub const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// Buffer size used for the copy tasks that bridge a downstream channel to
/// its upstream peer in proxy mode.
pub const BUF_SIZE: usize = 1024 * 16;

/// Session channel request type names, as they appear on the wire and as
/// the final route segment under `service/session/<request-type>`.
pub const REQ_PTY: &str = "pty-req";
pub const REQ_SHELL: &str = "shell";
pub const REQ_EXEC: &str = "exec";
pub const REQ_WINDOW_CHANGE: &str = "window-change";
pub const REQ_EXIT_STATUS: &str = "exit-status";
pub const REQ_ENV: &str = "env";

pub const CHANNEL_TYPE_SESSION: &str = "session";

pub const DEFAULT_SHELL: &str = "/bin/sh";
