//! Length-prefixed bincode framing over a pair of file descriptors.
//!
//! Each frame is a little-endian `u32` length followed by that many bytes of
//! bincode. The host talks to a worker through the child's stdin/stdout, so
//! the worker must keep its own logging on stderr.

use crate::error::{ControlError, ControlResult};
use facelink_common::consts::PIPE_MAX_FRAME;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Duplex message pipe.
#[derive(Debug)]
pub struct MessagePipe {
    reader: File,
    writer: File,
}

impl MessagePipe {
    /// Build a pipe from a readable and a writable descriptor.
    pub fn from_fds(read: OwnedFd, write: OwnedFd) -> Self {
        Self {
            reader: File::from(read),
            writer: File::from(write),
        }
    }

    /// Use both directions of a connected socket.
    pub fn from_stream(stream: UnixStream) -> ControlResult<Self> {
        let write = stream.try_clone()?;
        Ok(Self::from_fds(OwnedFd::from(stream), OwnedFd::from(write)))
    }

    /// Connected pair of pipes, for running a worker on a thread.
    pub fn pair() -> ControlResult<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a)?, Self::from_stream(b)?))
    }

    /// The worker end of a host connection: this process's stdin and stdout.
    ///
    /// Afterwards fd 1 is pointed at stderr so stray prints cannot corrupt
    /// the frame stream.
    pub fn from_stdio() -> ControlResult<Self> {
        let read = std::io::stdin().as_fd().try_clone_to_owned()?;
        let write = std::io::stdout().as_fd().try_clone_to_owned()?;
        if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self::from_fds(read, write))
    }

    /// Encode and send one message.
    pub fn send<T: Serialize>(&mut self, message: &T) -> ControlResult<()> {
        let body = bincode::serialize(message)?;
        if body.len() > PIPE_MAX_FRAME {
            return Err(ControlError::FrameTooLarge {
                len: body.len(),
                max: PIPE_MAX_FRAME,
            });
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        self.writer.write_all(&frame).map_err(map_disconnect)?;
        self.writer.flush().map_err(map_disconnect)?;
        Ok(())
    }

    /// Wait up to `timeout` for incoming data. Returns true when readable.
    ///
    /// A closed peer counts as readable; the following receive reports it.
    pub fn poll(&self, timeout: Duration) -> ControlResult<bool> {
        let mut pfd = libc::pollfd {
            fd: self.reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc >= 0 {
                return Ok(rc > 0 && pfd.revents != 0);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    /// Receive one message if one is pending, without blocking.
    pub fn try_recv<T: DeserializeOwned>(&mut self) -> ControlResult<Option<T>> {
        self.recv_timeout(Duration::ZERO)
    }

    /// Receive one message, waiting up to `timeout` for it to start arriving.
    pub fn recv_timeout<T: DeserializeOwned>(&mut self, timeout: Duration) -> ControlResult<Option<T>> {
        if !self.poll(timeout)? {
            return Ok(None);
        }
        self.recv().map(Some)
    }

    /// Receive one message, blocking until it is complete.
    pub fn recv<T: DeserializeOwned>(&mut self) -> ControlResult<T> {
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len).map_err(map_disconnect)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > PIPE_MAX_FRAME {
            return Err(ControlError::FrameTooLarge {
                len,
                max: PIPE_MAX_FRAME,
            });
        }
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).map_err(map_disconnect)?;
        Ok(bincode::deserialize(&body)?)
    }

    /// Receive every message that is already pending.
    ///
    /// A peer that closes its end after its last frame still has those
    /// frames delivered; the closure is reported through
    /// [`Drained::disconnected`] instead of an error.
    pub fn drain<T: DeserializeOwned>(&mut self) -> ControlResult<Drained<T>> {
        let mut drained = Drained {
            messages: Vec::new(),
            disconnected: false,
        };
        loop {
            match self.try_recv() {
                Ok(Some(message)) => drained.messages.push(message),
                Ok(None) => return Ok(drained),
                Err(ControlError::Disconnected) => {
                    drained.disconnected = true;
                    return Ok(drained);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Messages read by [`MessagePipe::drain`].
#[derive(Debug)]
pub struct Drained<T> {
    /// Complete messages, in arrival order
    pub messages: Vec<T>,
    /// The peer closed its end after these messages
    pub disconnected: bool,
}

fn map_disconnect(e: std::io::Error) -> ControlError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
            ControlError::Disconnected
        }
        _ => ControlError::Io { source: e },
    }
}
