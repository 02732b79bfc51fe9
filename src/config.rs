//! Server configuration: paths, environment plumbing, and tunables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::DEFAULT_FRAME_BUDGET;

/// Cap on one client's outbound queue before it counts as unresponsive.
pub const DEFAULT_OUTBOUND_CAP: usize = 8 * 1024 * 1024;

/// How long to wait for a PTY worker to exit before abandoning it.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_SCROLLBACK: usize = 2000;

#[derive(Clone, Debug)]
pub struct Config {
    /// Server name; namespaces the socket and the state directory.
    pub name: String,
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub frame_budget: Duration,
    pub outbound_cap: usize,
    pub join_timeout: Duration,
    pub scrollback: usize,
    /// Program run in new panes.
    pub shell: String,
    /// TERM exported to children.
    pub term_env: String,
}

impl Config {
    pub fn load(name: Option<String>, socket_override: Option<PathBuf>) -> Config {
        let name = name.unwrap_or_else(|| "muxd".to_string());
        let socket_path = socket_override
            .or_else(|| env::var("MUXD_SOCKET").ok().map(PathBuf::from))
            .unwrap_or_else(|| default_socket_path(&name));
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let state_dir = PathBuf::from(home).join(".local/state").join(&name);
        let frame_budget = env::var("MUXD_FRAME_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FRAME_BUDGET);
        let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let term_env = env::var("MUXD_TERM").unwrap_or_else(|_| "xterm-256color".to_string());
        Config {
            name,
            socket_path,
            state_dir,
            frame_budget,
            outbound_cap: DEFAULT_OUTBOUND_CAP,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            scrollback: DEFAULT_SCROLLBACK,
            shell,
            term_env,
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.log", self.name))
    }
}

/// `/tmp/<name>-<uid>.sock`, one namespace per user.
pub fn default_socket_path(name: &str) -> PathBuf {
    let uid = nix::unistd::getuid().as_raw();
    PathBuf::from(format!("/tmp/{name}-{uid}.sock"))
}
