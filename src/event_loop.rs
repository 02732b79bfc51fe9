//! Single-threaded I/O readiness multiplexer.
//!
//! A thin wrapper over `poll(2)`: file descriptors are registered with
//! read/write interest under a caller-chosen token, one-shot timers have
//! millisecond resolution, and `run_once` blocks until something is ready.
//! All dispatch happens on the calling thread; the server's main loop
//! consumes the returned tokens and acts on its own state.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

pub type Token = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const READ_WRITE: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// One ready file descriptor. Hangup/error conditions surface as `readable`
/// too so the owner performs the read that observes EOF.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// The outcome of one tick: ready fds, then timers that fired, in deadline
/// order (ties resolve by scheduling order).
#[derive(Default)]
pub struct Tick {
    pub io: Vec<Readiness>,
    pub timers: Vec<TimerId>,
}

struct Registration {
    fd: RawFd,
    token: Token,
    interest: Interest,
}

struct Timer {
    id: TimerId,
    deadline: Instant,
    seq: u64,
}

#[derive(Default)]
pub struct EventLoop {
    // Registration order is kept so poll results are dispatched stably.
    fds: Vec<Registration>,
    timers: Vec<Timer>,
    next_timer: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fd` under `token`. A token may only be registered once;
    /// re-registering replaces the previous interest.
    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) {
        if let Some(reg) = self.fds.iter_mut().find(|r| r.token == token) {
            reg.fd = fd;
            reg.interest = interest;
            return;
        }
        self.fds.push(Registration {
            fd,
            token,
            interest,
        });
    }

    pub fn set_interest(&mut self, token: Token, interest: Interest) {
        if let Some(reg) = self.fds.iter_mut().find(|r| r.token == token) {
            reg.interest = interest;
        }
    }

    pub fn deregister(&mut self, token: Token) {
        self.fds.retain(|r| r.token != token);
    }

    /// Arm a one-shot timer `delay` from now.
    pub fn schedule(&mut self, delay: Duration) -> TimerId {
        let id = TimerId(self.next_timer);
        let seq = self.next_timer;
        self.next_timer += 1;
        self.timers.push(Timer {
            id,
            deadline: Instant::now() + delay,
            seq,
        });
        id
    }

    /// Cancel a pending timer. Returns false if it already fired.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    fn poll_timeout(&self, max_wait: Option<Duration>, now: Instant) -> PollTimeout {
        let timer_wait = self
            .timers
            .iter()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min();
        let wait = match (timer_wait, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match wait {
            // Clamped to u16 millis; callers wanting longer sleeps just get
            // an extra empty tick.
            Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
            None => PollTimeout::NONE,
        }
    }

    /// Block until at least one fd is ready or a timer is due, then return
    /// everything that became ready. `max_wait` bounds the block; with no
    /// fds, no timers, and no bound the call returns an empty tick rather
    /// than sleeping forever.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<Tick> {
        let now = Instant::now();
        if self.fds.is_empty() && self.timers.is_empty() && max_wait.is_none() {
            return Ok(Tick::default());
        }

        let timeout = self.poll_timeout(max_wait, now);
        let mut pollfds: Vec<PollFd> = self
            .fds
            .iter()
            .map(|r| {
                let mut flags = PollFlags::empty();
                if r.interest.readable {
                    flags |= PollFlags::POLLIN;
                }
                if r.interest.writable {
                    flags |= PollFlags::POLLOUT;
                }
                // Safety: the owner keeps each registered fd open until it
                // calls deregister; the borrow lives only for this call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(r.fd) }, flags)
            })
            .collect();

        if !pollfds.is_empty() {
            match poll(&mut pollfds, timeout) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(io::Error::from(err)),
            }
        } else {
            // Timer-only tick: sleep until the nearest deadline.
            if let Some(nearest) = self.timers.iter().map(|t| t.deadline).min() {
                let wait = nearest.saturating_duration_since(Instant::now());
                let wait = match max_wait {
                    Some(cap) => wait.min(cap),
                    None => wait,
                };
                std::thread::sleep(wait);
            } else if let Some(cap) = max_wait {
                std::thread::sleep(cap);
            }
        }

        let mut tick = Tick::default();
        for (reg, pfd) in self.fds.iter().zip(pollfds.iter()) {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            if revents.is_empty() {
                continue;
            }
            let hangup =
                revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL);
            tick.io.push(Readiness {
                token: reg.token,
                readable: revents.contains(PollFlags::POLLIN) || hangup,
                writable: revents.contains(PollFlags::POLLOUT),
                hangup,
            });
        }

        let now = Instant::now();
        let mut due: Vec<&Timer> = self.timers.iter().filter(|t| t.deadline <= now).collect();
        due.sort_by_key(|t| (t.deadline, t.seq));
        tick.timers = due.iter().map(|t| t.id).collect();
        self.timers.retain(|t| t.deadline > now);

        Ok(tick)
    }
}
