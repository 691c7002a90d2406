//! The epoll-backed readiness set.

use super::{Event, Events, Interest, Token};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::io;
use std::os::fd::AsFd;

/// Level-triggered readiness set over Linux epoll.
///
/// Descriptors are registered with an [`Interest`] mask and a [`Token`]; the
/// token comes back verbatim in every [`Event`] the kernel reports for that
/// descriptor. Registrations are level-triggered (no `EPOLLET`), so a
/// condition keeps firing until it is consumed.
///
/// Hangup and error conditions are reported by the kernel whether or not they
/// were asked for; they surface through [`Interest::HUP`] and
/// [`Interest::ERROR`] in the event mask.
pub struct ReadinessSet {
    epoll: Epoll,
    scratch: Vec<EpollEvent>,
}

impl ReadinessSet {
    /// Creates a readiness set whose waits deliver at most `capacity` events.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        let scratch = (0..capacity.max(1)).map(|_| EpollEvent::empty()).collect();
        Ok(Self { epoll, scratch })
    }

    /// Registers `fd` with the given interest and token.
    pub fn register(&self, fd: impl AsFd, token: Token, interest: Interest) -> io::Result<()> {
        let event = EpollEvent::new(interest_to_flags(interest), token.0);
        self.epoll.add(fd, event).map_err(io::Error::from)
    }

    /// Changes the interest mask of an already registered descriptor.
    pub fn modify(&self, fd: impl AsFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = EpollEvent::new(interest_to_flags(interest), token.0);
        self.epoll.modify(fd, &mut event).map_err(io::Error::from)
    }

    /// Removes a descriptor from the set.
    ///
    /// Must be called before the descriptor is closed; the kernel would drop
    /// the registration on close anyway, but relying on that hides table
    /// bookkeeping errors.
    pub fn deregister(&self, fd: impl AsFd) -> io::Result<()> {
        self.epoll.delete(fd).map_err(io::Error::from)
    }

    /// Waits up to `timeout_ms` for readiness, filling `events`.
    ///
    /// Returns the number of events delivered; `Ok(0)` means the timeout
    /// elapsed. An interrupted wait surfaces as
    /// [`io::ErrorKind::Interrupted`] so the caller can retry.
    pub fn wait(&mut self, events: &mut Events, timeout_ms: u16) -> io::Result<usize> {
        events.clear();
        let count = self
            .epoll
            .wait(&mut self.scratch, timeout_ms)
            .map_err(io::Error::from)?;
        for raw in &self.scratch[..count] {
            events.push(Event::new(
                Token(raw.data()),
                flags_to_interest(raw.events()),
            ));
        }
        Ok(count)
    }
}

impl std::fmt::Debug for ReadinessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessSet")
            .field("batch_capacity", &self.scratch.len())
            .finish_non_exhaustive()
    }
}

fn interest_to_flags(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.is_readable() {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.is_writable() {
        flags |= EpollFlags::EPOLLOUT;
    }
    if interest.is_priority() {
        flags |= EpollFlags::EPOLLPRI;
    }
    flags
}

fn flags_to_interest(flags: EpollFlags) -> Interest {
    let mut interest = Interest::NONE;
    if flags.contains(EpollFlags::EPOLLIN) {
        interest = interest.add(Interest::READABLE);
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        interest = interest.add(Interest::WRITABLE);
    }
    if flags.contains(EpollFlags::EPOLLHUP) {
        interest = interest.add(Interest::HUP);
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        interest = interest.add(Interest::ERROR);
    }
    if flags.contains(EpollFlags::EPOLLPRI) {
        interest = interest.add(Interest::PRIORITY);
    }
    interest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn register_wait_deregister() {
        let mut set = ReadinessSet::new(8).expect("create readiness set");
        let (mut tx, rx) = UnixStream::pair().expect("socketpair");

        set.register(&rx, Token(7), Interest::READABLE)
            .expect("register");

        let mut events = Events::with_capacity(8);
        let n = set.wait(&mut events, 0).expect("wait");
        assert_eq!(n, 0, "nothing written yet");

        tx.write_all(b"x").expect("write");
        let n = set.wait(&mut events, 1000).expect("wait");
        assert_eq!(n, 1);
        let event = events.iter().next().expect("one event");
        assert_eq!(event.token, Token(7));
        assert!(event.ready.is_readable());

        set.deregister(&rx).expect("deregister");
        let n = set.wait(&mut events, 0).expect("wait");
        assert_eq!(n, 0);
    }

    #[test]
    fn modify_adds_writable() {
        let mut set = ReadinessSet::new(8).expect("create readiness set");
        let (tx, _rx) = UnixStream::pair().expect("socketpair");

        set.register(&tx, Token(2), Interest::READABLE)
            .expect("register");
        let mut events = Events::with_capacity(8);
        assert_eq!(set.wait(&mut events, 0).expect("wait"), 0);

        set.modify(&tx, Token(2), Interest::both()).expect("modify");
        let n = set.wait(&mut events, 1000).expect("wait");
        assert_eq!(n, 1);
        assert!(events.iter().next().expect("event").ready.is_writable());
    }

    #[test]
    fn hangup_reported_without_registration() {
        let mut set = ReadinessSet::new(8).expect("create readiness set");
        let (tx, rx) = UnixStream::pair().expect("socketpair");

        set.register(&rx, Token(3), Interest::READABLE)
            .expect("register");
        drop(tx);

        let mut events = Events::with_capacity(8);
        let n = set.wait(&mut events, 1000).expect("wait");
        assert_eq!(n, 1);
        assert!(events.iter().next().expect("event").ready.is_hup());
    }

    #[test]
    fn wait_times_out() {
        let mut set = ReadinessSet::new(4).expect("create readiness set");
        let mut events = Events::with_capacity(4);

        let start = Instant::now();
        let n = set.wait(&mut events, 50).expect("wait");
        assert_eq!(n, 0);
        assert!(start.elapsed().as_millis() >= 40);
    }
}
