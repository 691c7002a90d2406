//! The wakeup channel: a non-blocking pipe that breaks the readiness wait.
//!
//! The read end lives in the event loop and is registered for readability;
//! the write end is shared with every thread that may call `schedule` or
//! `terminate`. Writes are best-effort: if the pipe is full the loop is
//! already due to wake, and if it does not exist yet (scheduling before
//! `serve`) the task is picked up by the drain-first loop iteration anyway.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use tracing::error;

/// Read end of the wakeup channel, owned by the event loop.
#[derive(Debug)]
pub(crate) struct WakePipe {
    rx: OwnedFd,
}

/// Write end, shared with scheduling threads.
#[derive(Debug)]
pub(crate) struct WakeSender {
    tx: OwnedFd,
}

/// Creates the channel with both ends non-blocking.
pub(crate) fn wake_pipe() -> io::Result<(WakePipe, WakeSender)> {
    let (rx, tx) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    Ok((WakePipe { rx }, WakeSender { tx }))
}

impl WakePipe {
    pub fn fd(&self) -> impl AsFd + '_ {
        self.rx.as_fd()
    }

    /// Empties the pipe.
    ///
    /// Returns `Err` only for a real error; would-block is the normal way
    /// out of the drain loop and end-of-file cannot happen while a sender
    /// is alive.
    pub fn drain(&self) -> io::Result<()> {
        let mut sink = [0u8; 64];
        loop {
            match unistd::read(self.rx.as_raw_fd(), &mut sink) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(io::Error::from(errno)),
            }
        }
    }
}

impl WakeSender {
    /// Makes the read end readable. Best-effort.
    pub fn poke(&self) {
        match unistd::write(self.tx.as_fd(), &[1u8]) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(errno) => error!(error = %errno, "unable to post a wake event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poke_makes_readable_and_drain_empties() {
        let (pipe, sender) = wake_pipe().expect("pipe");

        // Nothing written yet: drain sees would-block immediately.
        pipe.drain().expect("drain empty");

        sender.poke();
        sender.poke();

        let mut probe = [0u8; 1];
        let n = unistd::read(pipe.rx.as_raw_fd(), &mut probe).expect("read");
        assert_eq!(n, 1);

        pipe.drain().expect("drain rest");
        assert_eq!(
            unistd::read(pipe.rx.as_raw_fd(), &mut probe),
            Err(Errno::EAGAIN),
            "pipe must be empty after drain"
        );
    }

    #[test]
    fn poke_survives_a_full_pipe() {
        let (_pipe, sender) = wake_pipe().expect("pipe");
        // A pipe holds 64KiB by default; poke must stay silent once full.
        for _ in 0..70_000 {
            sender.poke();
        }
    }
}
