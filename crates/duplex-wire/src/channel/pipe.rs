//! Anonymous pipe channel between a parent process and a child it spawns.
//!
//! The parent creates two pipes and launches the child with the child's ends
//! appended to its arguments as `--read <fd> --write <fd>`. The child adopts
//! those descriptors with [`PipeHandles::parse`] and
//! [`PipeChannel::from_handles`]. Frames use the same 4-byte big-endian length
//! prefix as TCP.

use super::{Channel, ChannelCore, ChannelEvent, ChannelState, FrameSource, Role};
use crate::config::WireConfig;
use crate::error::WireError;
use crate::frame::{read_frame, write_frame};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// The pair of descriptors a child process talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHandles {
    /// Descriptor the owner reads frames from.
    pub read: RawFd,
    /// Descriptor the owner writes frames to.
    pub write: RawFd,
}

impl PipeHandles {
    /// Render as `--read <fd> --write <fd>`.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--read".to_string(),
            self.read.to_string(),
            "--write".to_string(),
            self.write.to_string(),
        ]
    }

    /// Find `--read <fd>` and `--write <fd>` (or `--read=<fd>`) among `args`.
    /// Unrelated arguments are ignored.
    pub fn parse<I, S>(args: I) -> Result<Self, WireError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut read = None;
        let mut write = None;
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag, Some(value.to_string())),
                None => (arg, None),
            };
            let slot = match flag {
                "--read" => &mut read,
                "--write" => &mut write,
                _ => continue,
            };
            let value = match inline {
                Some(value) => value,
                None => args
                    .next()
                    .map(|v| v.as_ref().to_string())
                    .ok_or_else(|| WireError::Unsupported(format!("{flag} needs a handle")))?,
            };
            let fd = value
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| WireError::Unsupported(format!("invalid handle for {flag}: {value}")))?;
            *slot = Some(fd);
        }

        match (read, write) {
            (Some(read), Some(write)) if read != write => Ok(Self { read, write }),
            (Some(_), Some(_)) => Err(WireError::Unsupported(
                "--read and --write must be different handles".to_string(),
            )),
            _ => Err(WireError::Unsupported(
                "both --read and --write handles are required".to_string(),
            )),
        }
    }
}

fn anonymous_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe(2) to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded; both descriptors are open and owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd(), true)?;
    set_cloexec(write.as_raw_fd(), true)?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch the descriptor flags of `fd`.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        let flags = if enabled {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

struct PipeFrames {
    reader: pipe::Receiver,
    max_frame_size: u32,
}

#[async_trait]
impl FrameSource for PipeFrames {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        read_frame(&mut self.reader, self.max_frame_size).await
    }
}

enum Side {
    /// Parent: spawns this command on open.
    Parent(Mutex<Option<Command>>),
    /// Child: adopts these inherited descriptors on open.
    Child(Mutex<Option<PipeHandles>>),
}

/// One end of a parent/child anonymous pipe pair.
///
/// The parent end takes the server role and the child end the client role.
/// Closing the parent end closes its pipes, then waits up to
/// `child_exit_timeout` for the child to exit before killing it.
pub struct PipeChannel {
    core: Arc<ChannelCore>,
    side: Side,
    writer: tokio::sync::Mutex<Option<pipe::Sender>>,
    child: tokio::sync::Mutex<Option<Child>>,
    max_frame_size: u32,
    child_exit_timeout: Duration,
}

impl PipeChannel {
    /// Parent end. `command` is spawned on open with `--read <fd> --write <fd>`
    /// appended to its arguments.
    pub fn spawn(command: Command, config: &WireConfig) -> Self {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        Self::with_side(
            Role::Server,
            format!("pipe parent -> {program}"),
            Side::Parent(Mutex::new(Some(command))),
            config,
        )
    }

    /// Child end, adopting descriptors passed by the parent.
    ///
    /// # Safety
    ///
    /// `handles` must name open pipe descriptors that were handed to this
    /// process for its exclusive use; the channel takes ownership of them
    /// and closes them when dropped.
    pub unsafe fn from_handles(handles: PipeHandles, config: &WireConfig) -> Self {
        Self::with_side(
            Role::Client,
            format!("pipe child r{} w{}", handles.read, handles.write),
            Side::Child(Mutex::new(Some(handles))),
            config,
        )
    }

    fn with_side(role: Role, description: String, side: Side, config: &WireConfig) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(
                role,
                description,
                config.inbound_queue_capacity,
                config.event_capacity,
            )),
            side,
            writer: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            max_frame_size: config.max_frame_size,
            child_exit_timeout: config.child_exit_timeout(),
        }
    }

    /// OS process id of the spawned child, parent end only.
    pub async fn child_id(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    fn launch(&self, slot: &Mutex<Option<Command>>) -> Result<(OwnedFd, OwnedFd, Child), WireError> {
        let mut command = slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| WireError::InvalidState {
                current: "spawned".to_string(),
                operation: "open",
            })?;

        let (parent_read, child_write) = anonymous_pipe()?;
        let (child_read, parent_write) = anonymous_pipe()?;
        let handles = PipeHandles {
            read: child_read.as_raw_fd(),
            write: child_write.as_raw_fd(),
        };
        command.args(handles.to_args()).kill_on_drop(true);
        // SAFETY: the hook runs in the forked child before exec and only
        // calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                set_cloexec(handles.read, false)?;
                set_cloexec(handles.write, false)
            });
        }

        let child = command.spawn()?;
        // The child holds its own copies now.
        drop(child_read);
        drop(child_write);
        debug!(pid = ?child.id(), read = handles.read, write = handles.write, "Spawned pipe child");
        Ok((parent_read, parent_write, child))
    }

    fn adopt(slot: &Mutex<Option<PipeHandles>>) -> Result<(OwnedFd, OwnedFd), WireError> {
        let handles = slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| WireError::InvalidState {
                current: "adopted".to_string(),
                operation: "open",
            })?;
        for fd in [handles.read, handles.write] {
            set_cloexec(fd, true)?;
        }
        // SAFETY: the caller of `from_handles` guaranteed exclusive ownership
        // of both open descriptors; fcntl above confirmed they are open.
        let owned = unsafe {
            (
                OwnedFd::from_raw_fd(handles.read),
                OwnedFd::from_raw_fd(handles.write),
            )
        };
        Ok(owned)
    }

    async fn reap_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.child_exit_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Pipe child exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed waiting for pipe child"),
            Err(_) => {
                warn!(
                    timeout_secs = self.child_exit_timeout.as_secs(),
                    "Pipe child did not exit, killing it"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill pipe child");
                }
            }
        }
    }
}

#[async_trait]
impl Channel for PipeChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn open(&self) -> Result<(), WireError> {
        if !self.core.begin_open()? {
            return Ok(());
        }

        let established = match &self.side {
            Side::Parent(slot) => self
                .launch(slot)
                .map(|(read, write, child)| (read, write, Some(child))),
            Side::Child(slot) => Self::adopt(slot).map(|(read, write)| (read, write, None)),
        };
        let opened = established.and_then(|(read, write, child)| {
            let reader = pipe::Receiver::from_file(File::from(read))?;
            let writer = pipe::Sender::from_file(File::from(write))?;
            Ok((reader, writer, child))
        });
        let (reader, writer, child) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                warn!(desc = %self.core.description(), error = %e, "Pipe open failed");
                self.core.fail_open();
                return Err(e);
            }
        };

        *self.writer.lock().await = Some(writer);
        *self.child.lock().await = child;
        self.core.spawn_receive_loop(PipeFrames {
            reader,
            max_frame_size: self.max_frame_size,
        });
        self.core.finish_open();
        info!(
            channel = self.core.id(),
            role = %self.core.role(),
            "Pipe channel open"
        );
        Ok(())
    }

    async fn close(&self) {
        let began = self.core.begin_close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reap_child().await;
        if began {
            self.core.finish_close();
        }
    }

    async fn try_send_bytes(&self, bytes: Bytes) -> bool {
        if self.core.state() != ChannelState::Open {
            return false;
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        match write_frame(writer, &bytes, self.max_frame_size).await {
            Ok(()) => {
                drop(guard);
                self.core.emit(ChannelEvent::SentBytes(bytes));
                true
            }
            Err(WireError::MessageTooLarge { size, max }) => {
                warn!(channel = self.core.id(), size, max, "Frame too large, not sent");
                false
            }
            Err(e) => {
                warn!(channel = self.core.id(), error = %e, "Pipe write failed, closing channel");
                guard.take();
                drop(guard);
                self.core.fault_close();
                false
            }
        }
    }

    /// True while open. Unlike UDP a pipe reports a dead peer: its
    /// reader sees end-of-file and closes the channel.
    fn is_connection_alive(&self) -> bool {
        self.core.state() == ChannelState::Open
    }

    fn signals_end_of_stream(&self) -> bool {
        true
    }
}
