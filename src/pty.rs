//! PTY ownership and the per-PTY worker thread.
//!
//! Each PTY record owns the child process, the master side of the pair, a
//! terminal emulator behind a mutex, and a one-byte notify pipe. Exactly one
//! worker thread performs blocking reads of the master fd and is the only
//! writer of emulator state; the main thread takes the same lock briefly to
//! snapshot the screen, inject input, or resize.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::term::{Emulator, ScreenSnapshot};

/// Read chunk for the worker loop.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),
    #[error("failed to spawn child: {0}")]
    Spawn(String),
    #[error("pty resize failed: {0}")]
    Resize(String),
    #[error("pty i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct SpawnParams {
    pub rows: u16,
    pub cols: u16,
    pub cwd: Option<String>,
    pub shell: String,
    pub term_env: String,
    pub scrollback: usize,
}

/// Pending user input plus the master-side writer. One lock covers both so
/// queued bytes never interleave with the worker's query responses.
struct WriterState {
    writer: Box<dyn Write + Send>,
    queue: Vec<u8>,
}

pub struct Pty {
    pub id: u64,
    pub rows: u16,
    pub cols: u16,
    pub cwd: String,
    pub title: String,
    /// Ids of clients currently attached; weak references resolved through
    /// the client registry.
    pub attached: HashSet<u64>,
    pub emulator: Arc<Mutex<Emulator>>,
    master: Box<dyn MasterPty + Send>,
    writer: Arc<Mutex<WriterState>>,
    killer: Box<dyn portable_pty::ChildKiller + Send + Sync>,
    notify_rx: OwnedFd,
    dead: Arc<AtomicBool>,
    exit_status: Arc<Mutex<Option<u32>>>,
    done_rx: mpsc::Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl Pty {
    /// Open a PTY pair, fork the shell under it, and start the reader
    /// worker.
    pub fn spawn(id: u64, params: &SpawnParams) -> Result<Pty, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: params.rows,
                cols: params.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let cwd = params
            .cwd
            .clone()
            .or_else(|| std::env::var("HOME").ok())
            .unwrap_or_else(|| "/".to_string());

        let mut cmd = CommandBuilder::new(&params.shell);
        cmd.env("TERM", &params.term_env);
        cmd.env("COLORTERM", "truecolor");
        cmd.cwd(&cwd);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let killer = child.clone_killer();
        // Close the slave side now so the master sees EOF when the child
        // exits.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let emulator = Arc::new(Mutex::new(Emulator::new(
            params.rows,
            params.cols,
            params.scrollback,
        )));
        let writer = Arc::new(Mutex::new(WriterState {
            writer,
            queue: Vec::new(),
        }));
        let (notify_rx, notify_tx) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|e| PtyError::Open(e.to_string()))?;
        let dead = Arc::new(AtomicBool::new(false));
        let exit_status = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = mpsc::channel();

        let worker = {
            let emulator = emulator.clone();
            let writer = writer.clone();
            let dead = dead.clone();
            let exit_status = exit_status.clone();
            let mut child = child;
            thread::Builder::new()
                .name(format!("pty-{id}"))
                .spawn(move || {
                    let mut buf = vec![0u8; READ_CHUNK];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let responses = match emulator.lock() {
                                    Ok(mut emu) => {
                                        emu.feed(&buf[..n]);
                                        emu.take_responses()
                                    }
                                    // Poisoned by a panic on the main thread;
                                    // nothing sane left to do with the bytes.
                                    Err(_) => break,
                                };
                                // Query responses go straight to the master so
                                // they are ordered between the bytes that asked
                                // and any queued user input.
                                if !responses.is_empty() {
                                    if let Ok(mut w) = writer.lock() {
                                        for resp in responses {
                                            let _ = w.writer.write_all(resp.as_bytes());
                                        }
                                        let _ = w.writer.flush();
                                    }
                                }
                                poke(&notify_tx);
                            }
                        }
                    }
                    // Reader EOF means the child is gone; collect its status.
                    let status = child.wait().map(|s| s.exit_code()).unwrap_or(1);
                    if let Ok(mut slot) = exit_status.lock() {
                        *slot = Some(status);
                    }
                    dead.store(true, Ordering::Release);
                    poke(&notify_tx);
                    let _ = done_tx.send(());
                })
                .map_err(PtyError::Io)?
        };

        Ok(Pty {
            id,
            rows: params.rows,
            cols: params.cols,
            cwd,
            title: String::new(),
            attached: HashSet::new(),
            emulator,
            master: pair.master,
            writer,
            killer,
            notify_rx,
            dead,
            exit_status,
            done_rx,
            worker: Some(worker),
        })
    }

    /// Fd the main loop registers for "output arrived" wakeups.
    pub fn notify_fd(&self) -> RawFd {
        self.notify_rx.as_raw_fd()
    }

    /// Drain every pending byte so edge-style wakeups collapse into one.
    pub fn drain_notify(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.notify_rx.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    /// Queue user input and flush it to the master.
    pub fn write_input(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut state = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("pty writer poisoned"))?;
        state.queue.extend_from_slice(bytes);
        let pending = std::mem::take(&mut state.queue);
        state.writer.write_all(&pending)?;
        state.writer.flush()
    }

    /// Resize emulator and kernel PTY. Main thread only; TIOCSWINSZ makes
    /// the kernel deliver SIGWINCH to the foreground process group.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if rows == self.rows && cols == self.cols {
            return Ok(());
        }
        self.rows = rows;
        self.cols = cols;
        if let Ok(mut emu) = self.emulator.lock() {
            emu.resize(rows, cols);
        }
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// Copy the screen out for diffing.
    pub fn snapshot(&self) -> Option<ScreenSnapshot> {
        self.emulator.lock().ok().map(|emu| emu.snapshot())
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status.lock().ok().and_then(|s| *s)
    }

    /// Ask the child to go away: SIGHUP to its process group, like a
    /// modem hangup.
    pub fn request_shutdown(&mut self) {
        match self.master.process_group_leader() {
            Some(pgrp) if pgrp > 0 => {
                if let Err(err) = killpg(Pid::from_raw(pgrp), Signal::SIGHUP) {
                    debug!(pty = self.id, %err, "killpg failed, using child killer");
                    let _ = self.killer.kill();
                }
            }
            _ => {
                let _ = self.killer.kill();
            }
        }
    }

    /// Wait for the worker to observe EOF and exit, bounded by `timeout`.
    /// A worker stuck past the timeout is abandoned; its fds die with this
    /// record.
    pub fn join_worker(&mut self, timeout: Duration) -> Option<u32> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(handle) = self.worker.take() {
                    let _ = handle.join();
                }
            }
            Err(_) => {
                warn!(pty = self.id, "worker did not exit in time, abandoning");
                self.worker.take();
            }
        }
        self.exit_status()
    }
}

fn poke(notify_tx: &OwnedFd) {
    // A full pipe already holds a pending wakeup; EAGAIN is success here.
    let _ = nix::unistd::write(notify_tx, &[1u8]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_params() -> SpawnParams {
        SpawnParams {
            rows: 24,
            cols: 80,
            cwd: None,
            shell: "/bin/sh".to_string(),
            term_env: "xterm-256color".to_string(),
            scrollback: 200,
        }
    }

    fn wait_for<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(25));
        }
        false
    }

    #[test]
    fn echo_reaches_the_emulator() {
        let pty = Pty::spawn(1, &sh_params()).unwrap();
        pty.write_input(b"echo MUXD_ECHO_OK\n").unwrap();

        let saw_it = wait_for(
            || {
                pty.snapshot().is_some_and(|snap| {
                    snap.cells.iter().any(|row| {
                        let line: String = row.iter().map(|c| c.text.as_str()).collect();
                        // Match the output line, not the echoed command.
                        line.contains("MUXD_ECHO_OK") && !line.contains("echo")
                    })
                })
            },
            Duration::from_secs(5),
        );
        assert!(saw_it, "expected echo output on screen");
    }

    #[test]
    fn output_pokes_the_notify_pipe() {
        let pty = Pty::spawn(2, &sh_params()).unwrap();
        pty.write_input(b"echo poke\n").unwrap();

        let poked = wait_for(
            || {
                let mut buf = [0u8; 8];
                matches!(nix::unistd::read(pty.notify_rx.as_raw_fd(), &mut buf), Ok(n) if n > 0)
            },
            Duration::from_secs(5),
        );
        assert!(poked, "expected a byte on the notify pipe");
        // Drain leaves the pipe empty.
        pty.drain_notify();
        let mut buf = [0u8; 8];
        assert!(nix::unistd::read(pty.notify_rx.as_raw_fd(), &mut buf).is_err());
    }

    #[test]
    fn child_exit_is_observed_with_status() {
        let mut pty = Pty::spawn(3, &sh_params()).unwrap();
        pty.write_input(b"exit 7\n").unwrap();

        assert!(wait_for(|| pty.is_dead(), Duration::from_secs(5)));
        let status = pty.join_worker(Duration::from_secs(2));
        assert_eq!(status, Some(7));
    }

    #[test]
    fn shutdown_terminates_a_live_child() {
        let mut pty = Pty::spawn(4, &sh_params()).unwrap();
        // Give the shell a moment to set up its process group.
        thread::sleep(Duration::from_millis(200));
        pty.request_shutdown();
        assert!(wait_for(|| pty.is_dead(), Duration::from_secs(5)));
        pty.join_worker(Duration::from_secs(2));
    }

    #[test]
    fn resize_updates_dimensions() {
        let mut pty = Pty::spawn(5, &sh_params()).unwrap();
        pty.resize(30, 100).unwrap();
        assert_eq!(pty.rows, 30);
        assert_eq!(pty.cols, 100);
        let snap = pty.snapshot().unwrap();
        assert_eq!(snap.rows, 30);
        assert_eq!(snap.cols, 100);
    }
}
