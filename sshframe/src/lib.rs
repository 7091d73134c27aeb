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

//! `sshframe` is a programmable SSH server / transparent SSH proxy
//! framework. See `protocol::Protocol` for the composition root that
//! binds a descriptor, route tree, session manager, acceptor, and the
//! internal pub/sub pipes together.

pub mod acceptor;
pub mod auth;
pub mod behaviors;
pub mod channel;
pub mod config;
pub mod consts;
pub mod errors;
pub mod hooks;
pub mod logging;
pub mod payload_rack;
pub mod pipe;
pub mod protocol;
pub mod proxy_broker;
pub mod pty;
pub mod route;
pub mod session;
pub mod test_hooks;

pub use errors::{ChannelError, ConfigError, RequestError};
pub use hooks::Hooks;
pub use protocol::Protocol;
pub use sshframe_types::Descriptor;
