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

//! OS pseudo-terminal allocation and resizing. A `Pty` is opened by the
//! local channel manager as soon as a `session` channel is accepted (spec
//! §4.4 step 4), well before any `pty-req`/`shell`/`exec` request arrives
//! to tell us what to do with it, so allocation is decoupled from spawning
//! a process, unlike `shpool_pty::fork::Fork`, which couples them.
//! `nix::pty::openpty` gives us that split master/slave pair directly.
//!
//! See `man ioctl_tty` for the two ioctls used for resizing, same as
//! `tty.rs`.

use std::{
    fs::File,
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use anyhow::Context;
use nix::pty::openpty;

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);
nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
    pub width_px: u16,
    pub height_px: u16,
}

/// A pair of file handles acquired from the OS (spec §3 "Pty"), owned
/// exclusively by the channel manager invocation that allocated it and
/// released (closed) when the channel closes, simply by dropping it.
pub struct Pty {
    pub master: File,
    pub slave: File,
    slave_fd: OwnedFd,
}

impl Pty {
    /// Opens a fresh pty pair. Mirrors `spawn_subshell`'s use of
    /// `shpool_pty::fork::Fork::from_ptmx`, minus the fork: spawning the
    /// shell/command is deferred to `behaviors::shell`/`behaviors::exec`,
    /// which run once the corresponding session request actually arrives.
    pub fn open() -> anyhow::Result<Self> {
        let result = openpty(None, None).context("opening pty pair")?;
        let slave_fd = result.slave;
        let slave_dup = slave_fd.try_clone().context("duplicating pty slave fd")?;
        Ok(Pty { master: File::from(result.master), slave: File::from(slave_dup), slave_fd })
    }

    pub fn slave_raw_fd(&self) -> RawFd {
        self.slave_fd.as_raw_fd()
    }

    pub fn resize(&self, size: Size) -> anyhow::Result<()> {
        let term_size = libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.width_px,
            ws_ypixel: size.height_px,
        };
        // Safety: term_size is stack allocated and lives for the whole call,
        // master is a valid, open pty master fd for the lifetime of `self`.
        unsafe {
            tiocswinsz(self.master.as_raw_fd(), &term_size).context("setting pty size")?;
        }
        Ok(())
    }

    pub fn size(&self) -> anyhow::Result<Size> {
        let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
        // Safety: term_size is stack allocated and lives for the whole call.
        unsafe {
            tiocgwinsz(self.master.as_raw_fd(), &mut term_size).context("reading pty size")?;
        }
        Ok(Size {
            rows: term_size.ws_row,
            cols: term_size.ws_col,
            width_px: term_size.ws_xpixel,
            height_px: term_size.ws_ypixel,
        })
    }
}

/// Makes the pty slave the calling process's controlling terminal. Called
/// from a `std::process::Command::pre_exec` closure, after `fork` but
/// before `exec`, the same point `daemon/server.rs::spawn_subshell` disables
/// echo via `tty::disable_echo` in its own forked child.
///
/// # Safety
/// Must only be called in the child half of a fork, before any other
/// allocating or threading operation, per `pre_exec`'s own safety contract.
pub unsafe fn make_controlling_tty(slave_fd: RawFd) -> std::io::Result<()> {
    nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    tiocsctty(slave_fd, 0).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(5000)]
    fn open_and_resize() -> anyhow::Result<()> {
        let pty = Pty::open()?;
        pty.resize(Size { rows: 40, cols: 120, width_px: 0, height_px: 0 })?;
        let size = pty.size()?;
        assert_eq!(size.rows, 40);
        assert_eq!(size.cols, 120);
        Ok(())
    }
}
