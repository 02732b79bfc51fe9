//! The server runtime.
//!
//! One main thread owns every registry (PTYs, clients, sessions), runs the
//! event loop, and is the sole mutator of client and layout state. PTY
//! worker threads only touch their own emulator behind its lock and signal
//! the main thread through per-PTY notify pipes.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tracing::{debug, info, warn};

use crate::client::{Client, GridView, Subscription};
use crate::config::Config;
use crate::event_loop::{EventLoop, Interest, TimerId, Token};
use crate::layout::{self, LayoutNode, Rect, SplitDirection};
use crate::pty::{Pty, SpawnParams};
use crate::redraw::{self, RedrawEvent};
use crate::rpc::{Message, Value};
use crate::scheduler::{FramePacer, RenderDecision};
use crate::sessions::{Session, SessionStore, Tab};
use crate::style::StyleTable;
use crate::term::ScreenSnapshot;

const TOKEN_LISTENER: Token = 0;
const TOKEN_SIGNALS: Token = 1;

fn client_token(id: u64) -> Token {
    (id << 2) | 2
}

fn pty_token(id: u64) -> Token {
    (id << 2) | 3
}

struct PtyEntry {
    pty: Pty,
    pacer: FramePacer,
    timer: Option<TimerId>,
}

pub struct Server {
    config: Config,
    listener: UnixListener,
    el: EventLoop,
    ptys: HashMap<u64, PtyEntry>,
    clients: HashMap<u64, Client>,
    sessions: HashMap<String, Session>,
    store: SessionStore,
    styles: StyleTable,
    next_pty_id: u64,
    next_client_id: u64,
    _signal_tx: OwnedFd,
    signal_rx: OwnedFd,
    shutdown_flag: Arc<AtomicBool>,
    shutting_down: bool,
}

impl Server {
    pub fn new(config: Config) -> Result<Server> {
        let listener = bind_socket(&config)?;
        listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;

        // Route signals through a pipe so they wake the poll loop like any
        // other fd.
        let (signal_rx, signal_tx) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("signal pipe")?;
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(sig, shutdown_flag.clone())
                .context("register shutdown signal")?;
            signal_hook::low_level::pipe::register_raw(sig, signal_tx.as_raw_fd())
                .context("register signal pipe")?;
        }
        // Children are reaped by their worker's wait(); SIGCHLD only wakes
        // the loop so death is observed promptly.
        let _ = signal_hook::low_level::pipe::register_raw(
            signal_hook::consts::SIGCHLD,
            signal_tx.as_raw_fd(),
        );
        // A dying client must not take the server with it.
        unsafe {
            let _ = nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            );
        }

        let mut el = EventLoop::new();
        el.register(listener.as_raw_fd(), TOKEN_LISTENER, Interest::READ);
        el.register(signal_rx.as_raw_fd(), TOKEN_SIGNALS, Interest::READ);

        let store = SessionStore::new(config.sessions_dir());
        info!(socket = %config.socket_path.display(), "server listening");

        Ok(Server {
            config,
            listener,
            el,
            ptys: HashMap::new(),
            clients: HashMap::new(),
            sessions: HashMap::new(),
            store,
            styles: StyleTable::new(),
            next_pty_id: 1,
            next_client_id: 1,
            _signal_tx: signal_tx,
            signal_rx,
            shutdown_flag,
            shutting_down: false,
        })
    }

    /// The bound socket path (useful for tests).
    pub fn socket_path(&self) -> &std::path::Path {
        &self.config.socket_path
    }

    pub fn run(&mut self) -> Result<()> {
        while !self.shutting_down {
            let tick = self
                .el
                .run_once(Some(Duration::from_millis(500)))
                .context("event loop tick")?;

            for ready in tick.io {
                match ready.token {
                    TOKEN_LISTENER => self.accept_clients(),
                    TOKEN_SIGNALS => self.drain_signals(),
                    token => match token & 3 {
                        2 => self.on_client_ready(token >> 2, ready.readable, ready.writable),
                        3 => self.on_pty_notify(token >> 2),
                        _ => {}
                    },
                }
            }
            for timer in tick.timers {
                self.on_timer(timer);
            }

            self.reap_dead_ptys();
            self.reap_dead_clients();

            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("shutdown signal received");
                self.shutting_down = true;
            }
        }
        self.shutdown();
        Ok(())
    }

    fn drain_signals(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.signal_rx.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let id = self.next_client_id;
                    self.next_client_id += 1;
                    match Client::new(id, stream) {
                        Ok(client) => {
                            self.el.register(
                                client.stream.as_raw_fd(),
                                client_token(id),
                                Interest::READ,
                            );
                            debug!(client = id, "client connected");
                            self.clients.insert(id, client);
                        }
                        Err(err) => warn!(%err, "failed to set up client"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_client_ready(&mut self, id: u64, readable: bool, writable: bool) {
        if writable {
            if let Some(client) = self.clients.get_mut(&id) {
                pump_client(&mut self.el, client);
            }
        }
        if !readable {
            return;
        }
        let eof = match self.clients.get_mut(&id) {
            Some(client) => match client.fill_decoder() {
                Ok(eof) => eof,
                Err(err) => {
                    debug!(client = id, %err, "client read error");
                    client.dead = true;
                    return;
                }
            },
            None => return,
        };

        loop {
            let msg = match self.clients.get_mut(&id) {
                Some(client) => match client.decode.next_message() {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(err) => {
                        // Transport error: fatal for this connection only.
                        warn!(client = id, %err, "protocol error, closing client");
                        client.dead = true;
                        return;
                    }
                },
                None => return,
            };
            self.dispatch(id, msg);
        }

        if eof {
            if let Some(client) = self.clients.get_mut(&id) {
                debug!(client = id, "client closed connection");
                client.dead = true;
            }
        }
    }

    // ── RPC dispatch ────────────────────────────────────────────────────

    fn dispatch(&mut self, client_id: u64, msg: Message) {
        match msg {
            Message::Request {
                msgid,
                method,
                params,
            } => {
                let result = self.handle_request(client_id, &method, &params);
                let response = match result {
                    Ok(value) => Message::Response {
                        msgid,
                        error: Value::Nil,
                        result: value,
                    },
                    Err(err) => Message::Response {
                        msgid,
                        error: Value::Str(err),
                        result: Value::Nil,
                    },
                };
                self.send_to_client(client_id, response);
            }
            Message::Notification { method, params } => {
                // Notifications have no reply; failures are logged and
                // dropped.
                if let Err(err) = self.handle_notification(&method, &params) {
                    debug!(client = client_id, method = %method, err = %err, "notification failed");
                }
            }
            Message::Response { msgid, .. } => {
                debug!(client = client_id, msgid, "ignoring unsolicited response");
            }
        }
    }

    fn handle_request(
        &mut self,
        client_id: u64,
        method: &str,
        params: &Value,
    ) -> std::result::Result<Value, String> {
        match method {
            "spawn_pty" => self.req_spawn_pty(client_id, params),
            "close_pty" => self.req_close_pty(params),
            "list_ptys" => Ok(self.req_list_ptys()),
            "attach" => self.req_attach(client_id, params),
            "detach" => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.subscription = Subscription::None;
                    client.reset_view();
                }
                self.refresh_attachments();
                Ok(Value::Nil)
            }
            "resize" => self.req_resize(client_id, params),
            "split_pane" => self.req_split_pane(client_id, params),
            "list_sessions" => Ok(self.req_list_sessions()),
            "session_save" => self.req_session_save(client_id, params),
            "session_load" => self.req_session_load(params),
            "session_rename" => self.req_session_rename(params),
            "session_delete" => self.req_session_delete(params),
            "kill_server" => {
                self.shutting_down = true;
                Ok(Value::Nil)
            }
            other => Err(format!("unknown method {other:?}")),
        }
    }

    fn handle_notification(
        &mut self,
        method: &str,
        params: &Value,
    ) -> std::result::Result<(), String> {
        match method {
            "write_pty" => {
                let pty_id = p_u64(params, "pty_id", 0).ok_or("write_pty needs pty_id")?;
                let bytes = params
                    .as_array()
                    .and_then(|items| items.get(1))
                    .or_else(|| params.map_get("bytes"))
                    .and_then(|v| v.as_bytes())
                    .ok_or("write_pty needs bytes")?;
                let entry = self.ptys.get(&pty_id).ok_or("no such pty")?;
                entry
                    .pty
                    .write_input(bytes)
                    .map_err(|e| format!("pty write: {e}"))
            }
            "mouse" => self.notif_mouse(params),
            other => Err(format!("unknown notification {other:?}")),
        }
    }

    fn req_spawn_pty(
        &mut self,
        client_id: u64,
        params: &Value,
    ) -> std::result::Result<Value, String> {
        let rows = p_u64(params, "rows", 0).unwrap_or(24) as u16;
        let cols = p_u64(params, "cols", 1).unwrap_or(80) as u16;
        let cwd = p_str(params, "cwd", 2);
        let attach = params
            .map_get("attach")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let pty_id = self
            .spawn_pty(rows.max(1), cols.max(1), cwd)
            .map_err(|e| e.to_string())?;

        if attach {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.subscription = Subscription::Pty { pty_id };
                client.reset_view();
            }
            self.refresh_attachments();
            self.render_pty(pty_id);
        }
        Ok(Value::Map(vec![(
            Value::Str("pty_id".into()),
            Value::UInt(pty_id),
        )]))
    }

    fn spawn_pty(
        &mut self,
        rows: u16,
        cols: u16,
        cwd: Option<String>,
    ) -> std::result::Result<u64, crate::pty::PtyError> {
        let id = self.next_pty_id;
        let params = SpawnParams {
            rows,
            cols,
            cwd,
            shell: self.config.shell.clone(),
            term_env: self.config.term_env.clone(),
            scrollback: self.config.scrollback,
        };
        let pty = Pty::spawn(id, &params)?;
        self.el
            .register(pty.notify_fd(), pty_token(id), Interest::READ);
        self.ptys.insert(
            id,
            PtyEntry {
                pty,
                pacer: FramePacer::new(self.config.frame_budget),
                timer: None,
            },
        );
        self.next_pty_id += 1;
        info!(pty = id, rows, cols, "spawned pty");
        Ok(id)
    }

    fn req_close_pty(&mut self, params: &Value) -> std::result::Result<Value, String> {
        let pty_id = p_u64(params, "pty_id", 0).ok_or("close_pty needs pty_id")?;
        let entry = self.ptys.get_mut(&pty_id).ok_or("no such pty")?;
        entry.pty.request_shutdown();
        // Death is observed through the notify pipe and handled by the
        // normal exit path.
        Ok(Value::Nil)
    }

    fn req_list_ptys(&self) -> Value {
        let mut items = Vec::new();
        for (id, entry) in &self.ptys {
            items.push(Value::Map(vec![
                (Value::Str("id".into()), Value::UInt(*id)),
                (
                    Value::Str("cwd".into()),
                    Value::Str(entry.pty.cwd.clone()),
                ),
                (
                    Value::Str("title".into()),
                    Value::Str(entry.pty.title.clone()),
                ),
                (
                    Value::Str("attached_client_count".into()),
                    Value::UInt(entry.pty.attached.len() as u64),
                ),
            ]));
        }
        Value::Map(vec![(Value::Str("ptys".into()), Value::Array(items))])
    }

    fn req_attach(
        &mut self,
        client_id: u64,
        params: &Value,
    ) -> std::result::Result<Value, String> {
        // Target is a pty id or a session name, as a map key or the first
        // positional element.
        let target_pty = p_u64(params, "pty_id", 0);
        let target_session = p_str(params, "session", 0);

        let new_sub = if let Some(pty_id) = target_pty {
            if !self.ptys.contains_key(&pty_id) {
                return Err(format!("no such pty {pty_id}"));
            }
            Subscription::Pty { pty_id }
        } else if let Some(name) = target_session {
            if !self.sessions.contains_key(&name) {
                // Attaching to an unknown session creates it with one pane.
                let viewport = self
                    .clients
                    .get(&client_id)
                    .map(|c| (c.viewport_rows, c.viewport_cols))
                    .unwrap_or((24, 80));
                let pty_id = self
                    .spawn_pty(viewport.0, viewport.1, None)
                    .map_err(|e| e.to_string())?;
                let cwd = self
                    .ptys
                    .get(&pty_id)
                    .map(|e| e.pty.cwd.clone())
                    .unwrap_or_default();
                self.sessions
                    .insert(name.clone(), Session::with_pane(name.clone(), pty_id, cwd));
            }
            Subscription::Session { name }
        } else {
            return Err("attach needs pty_id or session".into());
        };

        let changed = match self.clients.get_mut(&client_id) {
            Some(client) => {
                let changed = client.subscription != new_sub;
                if changed {
                    client.subscription = new_sub;
                    // Full paint exactly once per target change.
                    client.reset_view();
                }
                changed
            }
            None => return Err("unknown client".into()),
        };

        self.refresh_attachments();
        if changed {
            self.retile_for_client(client_id);
            for pty_id in self.visible_ptys(client_id) {
                self.render_pty(pty_id);
            }
        }
        Ok(Value::Nil)
    }

    fn req_resize(
        &mut self,
        client_id: u64,
        params: &Value,
    ) -> std::result::Result<Value, String> {
        let rows = p_u64(params, "rows", 0).ok_or("resize needs rows")? as u16;
        let cols = p_u64(params, "cols", 1).ok_or("resize needs cols")? as u16;
        let rows = rows.max(1);
        let cols = cols.max(1);

        let sub = match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.viewport_rows = rows;
                client.viewport_cols = cols;
                client.subscription.clone()
            }
            None => return Err("unknown client".into()),
        };

        match sub {
            Subscription::Pty { pty_id } => {
                if let Some(entry) = self.ptys.get_mut(&pty_id) {
                    entry
                        .pty
                        .resize(rows, cols)
                        .map_err(|e| e.to_string())?;
                    self.render_pty(pty_id);
                }
            }
            Subscription::Session { .. } => {
                self.retile_for_client(client_id);
                for pty_id in self.visible_ptys(client_id) {
                    self.render_pty(pty_id);
                }
            }
            Subscription::None => {}
        }
        Ok(Value::Nil)
    }

    fn req_split_pane(
        &mut self,
        client_id: u64,
        params: &Value,
    ) -> std::result::Result<Value, String> {
        let direction = match p_str(params, "direction", 0).as_deref() {
            Some("row") => SplitDirection::Row,
            Some("col") => SplitDirection::Col,
            other => return Err(format!("bad split direction {other:?}")),
        };
        let session_name = match self.clients.get(&client_id).map(|c| &c.subscription) {
            Some(Subscription::Session { name }) => name.clone(),
            _ => return Err("split_pane needs a session subscription".into()),
        };

        let (target, cwd) = {
            let session = self
                .sessions
                .get(&session_name)
                .ok_or("session disappeared")?;
            let tab = session.active_tab();
            let cwd = tab.root.pane_cwd(tab.active_pane).map(str::to_string);
            (tab.active_pane, cwd)
        };

        // Sized properly by the retile below.
        let new_pty = self.spawn_pty(24, 80, cwd.clone()).map_err(|e| e.to_string())?;
        let new_cwd = self
            .ptys
            .get(&new_pty)
            .map(|e| e.pty.cwd.clone())
            .unwrap_or_default();

        let session = self
            .sessions
            .get_mut(&session_name)
            .ok_or("session disappeared")?;
        let tab = session.active_tab_mut();
        if !layout::split_pane(
            &mut tab.root,
            target,
            direction,
            LayoutNode::pane(new_pty, new_cwd),
        ) {
            return Err("active pane not found in layout".into());
        }
        tab.active_pane = new_pty;

        self.refresh_attachments();
        self.retile_for_client(client_id);
        for pty_id in self.visible_ptys(client_id) {
            self.render_pty(pty_id);
        }
        Ok(Value::Map(vec![(
            Value::Str("pty_id".into()),
            Value::UInt(new_pty),
        )]))
    }

    fn req_list_sessions(&self) -> Value {
        let mut items: Vec<Value> = Vec::new();
        let mut names: Vec<&String> = self.sessions.keys().collect();
        names.sort();
        for name in names {
            let session = &self.sessions[name];
            items.push(Value::Map(vec![
                (Value::Str("name".into()), Value::Str(name.clone())),
                (
                    Value::Str("tabs".into()),
                    Value::UInt(session.tabs.len() as u64),
                ),
                (
                    Value::Str("active_tab".into()),
                    Value::UInt(session.active_tab as u64 + 1),
                ),
            ]));
        }
        Value::Map(vec![(Value::Str("sessions".into()), Value::Array(items))])
    }

    fn req_session_save(
        &mut self,
        client_id: u64,
        params: &Value,
    ) -> std::result::Result<Value, String> {
        let name = p_str(params, "name", 0)
            .or_else(|| match self.clients.get(&client_id).map(|c| &c.subscription) {
                Some(Subscription::Session { name }) => Some(name.clone()),
                _ => None,
            })
            .ok_or("session_save needs a name")?;
        let session = self.sessions.get(&name).ok_or("no such session")?;
        self.store.save(session).map_err(|e| e.to_string())?;
        Ok(Value::Nil)
    }

    fn req_session_load(&mut self, params: &Value) -> std::result::Result<Value, String> {
        let name = p_str(params, "name", 0).ok_or("session_load needs a name")?;
        let stored = self.store.load(&name).map_err(|e| e.to_string())?;

        // Pane pty ids in the file belong to a previous run; respawn each
        // pane's shell in its recorded cwd and rebuild the tree with live
        // ids.
        let mut tabs = Vec::with_capacity(stored.tabs.len());
        for tab in stored.tabs {
            let root = self
                .respawn_layout(&tab.root)
                .map_err(|e| e.to_string())?;
            tabs.push(Tab::new(root));
        }
        let session = Session {
            name: name.clone(),
            active_tab: stored.active_tab.min(tabs.len().saturating_sub(1)),
            tabs,
        };
        self.sessions.insert(name.clone(), session);
        info!(session = %name, "session loaded");
        Ok(Value::Nil)
    }

    fn respawn_layout(
        &mut self,
        node: &LayoutNode,
    ) -> std::result::Result<LayoutNode, crate::pty::PtyError> {
        match node {
            LayoutNode::Pane { cwd, .. } => {
                let cwd_opt = if cwd.is_empty() {
                    None
                } else {
                    Some(cwd.clone())
                };
                let id = self.spawn_pty(24, 80, cwd_opt)?;
                let real_cwd = self
                    .ptys
                    .get(&id)
                    .map(|e| e.pty.cwd.clone())
                    .unwrap_or_default();
                Ok(LayoutNode::pane(id, real_cwd))
            }
            LayoutNode::Split {
                direction,
                children,
                ratio,
            } => {
                let mut new_children = Vec::with_capacity(children.len());
                for child in children {
                    new_children.push(self.respawn_layout(child)?);
                }
                Ok(LayoutNode::Split {
                    direction: *direction,
                    children: new_children,
                    ratio: ratio.clone(),
                })
            }
        }
    }

    fn req_session_rename(&mut self, params: &Value) -> std::result::Result<Value, String> {
        let from = p_str(params, "from", 0).ok_or("session_rename needs from")?;
        let to = p_str(params, "to", 1).ok_or("session_rename needs to")?;
        if self.sessions.contains_key(&to) {
            return Err(format!("session {to:?} already exists"));
        }
        self.store.rename(&from, &to).map_err(|e| e.to_string())?;
        if let Some(mut session) = self.sessions.remove(&from) {
            session.name = to.clone();
            self.sessions.insert(to.clone(), session);
            for client in self.clients.values_mut() {
                if client.subscription == (Subscription::Session { name: from.clone() }) {
                    client.subscription = Subscription::Session { name: to.clone() };
                }
            }
        }
        Ok(Value::Nil)
    }

    fn req_session_delete(&mut self, params: &Value) -> std::result::Result<Value, String> {
        let name = p_str(params, "name", 0).ok_or("session_delete needs a name")?;
        let _ = self.store.delete(&name);
        if self.sessions.remove(&name).is_some() {
            for client in self.clients.values_mut() {
                if client.subscription == (Subscription::Session { name: name.clone() }) {
                    client.subscription = Subscription::None;
                    client.reset_view();
                }
            }
            self.refresh_attachments();
        }
        Ok(Value::Nil)
    }

    fn notif_mouse(&mut self, params: &Value) -> std::result::Result<(), String> {
        let pty_id = p_u64(params, "pty_id", 0).ok_or("mouse needs pty_id")?;
        let event = params
            .map_get("event")
            .or_else(|| params.as_array().and_then(|a| a.get(1)))
            .ok_or("mouse needs event")?;
        let entry = self.ptys.get(&pty_id).ok_or("no such pty")?;

        let (wants, sgr) = match entry.pty.emulator.lock() {
            Ok(emu) => (emu.wants_mouse(), emu.sgr_mouse()),
            Err(_) => return Err("emulator poisoned".into()),
        };
        if !wants {
            // Application did not enable mouse reporting; swallow silently.
            return Ok(());
        }
        let bytes = encode_mouse(event, sgr).ok_or("bad mouse event")?;
        entry
            .pty
            .write_input(&bytes)
            .map_err(|e| format!("pty write: {e}"))
    }

    // ── Attachment and tiling ───────────────────────────────────────────

    /// Rebuild every PTY's attached-client set from the registries. Clients
    /// hold ids, PTYs hold ids; nothing points at anything directly.
    fn refresh_attachments(&mut self) {
        for entry in self.ptys.values_mut() {
            entry.pty.attached.clear();
        }
        for (client_id, client) in &self.clients {
            if client.dead {
                continue;
            }
            match &client.subscription {
                Subscription::Pty { pty_id } => {
                    if let Some(entry) = self.ptys.get_mut(pty_id) {
                        entry.pty.attached.insert(*client_id);
                    }
                }
                Subscription::Session { name } => {
                    if let Some(session) = self.sessions.get(name) {
                        for pty_id in session.active_tab().root.pty_ids() {
                            if let Some(entry) = self.ptys.get_mut(&pty_id) {
                                entry.pty.attached.insert(*client_id);
                            }
                        }
                    }
                }
                Subscription::None => {}
            }
        }
    }

    /// PTYs this client currently sees.
    fn visible_ptys(&self, client_id: u64) -> Vec<u64> {
        match self.clients.get(&client_id).map(|c| &c.subscription) {
            Some(Subscription::Pty { pty_id }) => {
                if self.ptys.contains_key(pty_id) {
                    vec![*pty_id]
                } else {
                    Vec::new()
                }
            }
            Some(Subscription::Session { name }) => self
                .sessions
                .get(name)
                .map(|s| {
                    s.active_tab()
                        .root
                        .pty_ids()
                        .into_iter()
                        .filter(|id| self.ptys.contains_key(id))
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Re-tile the session a client watches into its viewport, resizing
    /// each pane's PTY to its slot.
    fn retile_for_client(&mut self, client_id: u64) {
        let (name, rows, cols) = match self.clients.get(&client_id) {
            Some(client) => match &client.subscription {
                Subscription::Session { name } => {
                    (name.clone(), client.viewport_rows, client.viewport_cols)
                }
                _ => return,
            },
            None => return,
        };
        let rects = match self.sessions.get(&name) {
            Some(session) => {
                let mut out = Vec::new();
                layout::tile(
                    &session.active_tab().root,
                    Rect::new(0, 0, cols, rows),
                    &mut out,
                );
                out
            }
            None => return,
        };
        for (pty_id, rect) in rects {
            if let Some(entry) = self.ptys.get_mut(&pty_id) {
                if rect.height > 0 && rect.width > 0 {
                    if let Err(err) = entry.pty.resize(rect.height, rect.width) {
                        warn!(pty = pty_id, %err, "retile resize failed");
                    }
                }
            }
        }
    }

    // ── Rendering ───────────────────────────────────────────────────────

    fn on_pty_notify(&mut self, pty_id: u64) {
        let decision = match self.ptys.get_mut(&pty_id) {
            Some(entry) => {
                entry.pty.drain_notify();
                if entry.pty.is_dead() {
                    // Handled by reap_dead_ptys after this tick's dispatch.
                    return;
                }
                entry.pacer.on_activity(Instant::now())
            }
            None => return,
        };
        match decision {
            RenderDecision::Now => self.render_pty(pty_id),
            RenderDecision::Schedule(delay) => {
                let timer = self.el.schedule(delay);
                if let Some(entry) = self.ptys.get_mut(&pty_id) {
                    entry.timer = Some(timer);
                }
            }
            RenderDecision::Covered => {}
        }
    }

    fn on_timer(&mut self, timer: TimerId) {
        let pty_id = self
            .ptys
            .iter()
            .find(|(_, e)| e.timer == Some(timer))
            .map(|(id, _)| *id);
        if let Some(pty_id) = pty_id {
            if let Some(entry) = self.ptys.get_mut(&pty_id) {
                entry.timer = None;
                entry.pacer.on_timer_fired(Instant::now());
            }
            self.render_pty(pty_id);
        }
    }

    /// Diff one PTY against every attached client's last view and push the
    /// resulting frames.
    fn render_pty(&mut self, pty_id: u64) {
        let (snapshot, title_change, bell, defaults, viewers) =
            match self.ptys.get_mut(&pty_id) {
                Some(entry) => {
                    let state = match entry.pty.emulator.lock() {
                        Ok(mut emu) => (
                            emu.snapshot(),
                            emu.take_title_change(),
                            emu.take_bell(),
                            emu.default_colors(),
                        ),
                        Err(_) => return,
                    };
                    let viewers: Vec<u64> = entry.pty.attached.iter().copied().collect();
                    if let Some(ref title) = state.1 {
                        entry.pty.title = title.clone().unwrap_or_default();
                    }
                    (state.0, state.1, state.2, state.3, viewers)
                }
                None => return,
            };

        if let Some(title) = title_change {
            let note = Message::Notification {
                method: "title_changed".into(),
                params: Value::Array(vec![
                    Value::UInt(pty_id),
                    Value::Str(title.unwrap_or_default()),
                ]),
            };
            for client_id in &viewers {
                self.send_to_client(*client_id, note.clone());
            }
        }
        if bell {
            let note = Message::Notification {
                method: "bell".into(),
                params: Value::Array(vec![Value::UInt(pty_id)]),
            };
            for client_id in &viewers {
                self.send_to_client(*client_id, note.clone());
            }
        }

        for client_id in viewers {
            self.send_frame(client_id, pty_id, &snapshot, defaults);
        }
    }

    /// Build and queue one client's frame for one grid, committing the
    /// snapshot only if the frame was accepted. A rejected frame leaves the
    /// last-known view untouched so nothing desyncs.
    fn send_frame(
        &mut self,
        client_id: u64,
        grid: u64,
        snapshot: &ScreenSnapshot,
        defaults: ((u8, u8, u8), (u8, u8, u8)),
    ) {
        let cap = self.config.outbound_cap;
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        if client.dead {
            return;
        }

        let mut events: Vec<RedrawEvent> = Vec::new();
        if client.sent_default_colors != Some(defaults) {
            events.push(RedrawEvent::DefaultColorsSet {
                rgb_fg: defaults.0,
                rgb_bg: defaults.1,
            });
        }

        let view = client.grids.get(&grid);
        let frame = redraw::build_grid_frame(
            grid,
            view.map(|v| &v.snapshot),
            snapshot,
            view.and_then(|v| v.cursor),
            &mut self.styles,
            &client.seen_styles,
        );
        events.extend(frame.events);

        if redraw::is_empty_frame(&events) {
            return;
        }
        events.push(RedrawEvent::Flush);

        let note = Message::Notification {
            method: "redraw".into(),
            params: redraw::encode_frame(&events),
        };
        if client.enqueue(note, cap) {
            // Commit the view the frame described.
            client.grids.insert(
                grid,
                GridView {
                    snapshot: snapshot.clone(),
                    cursor: Some(snapshot.cursor),
                },
            );
            client.seen_styles.extend(frame.defined);
            client.sent_default_colors = Some(defaults);
            pump_client(&mut self.el, client);
        } else {
            warn!(client = client_id, "slow client, disconnecting");
        }
    }

    fn send_to_client(&mut self, client_id: u64, msg: Message) {
        let cap = self.config.outbound_cap;
        if let Some(client) = self.clients.get_mut(&client_id) {
            if !client.enqueue(msg, cap) {
                warn!(client = client_id, "slow client, disconnecting");
                return;
            }
            pump_client(&mut self.el, client);
        }
    }

    // ── Death and shutdown ──────────────────────────────────────────────

    fn reap_dead_ptys(&mut self) {
        let dead: Vec<u64> = self
            .ptys
            .iter()
            .filter(|(_, e)| e.pty.is_dead())
            .map(|(id, _)| *id)
            .collect();
        for pty_id in dead {
            self.remove_pty(pty_id);
        }
    }

    fn remove_pty(&mut self, pty_id: u64) {
        let Some(mut entry) = self.ptys.remove(&pty_id) else {
            return;
        };
        if let Some(timer) = entry.timer.take() {
            self.el.cancel(timer);
        }
        entry.pacer.reset_timer();
        self.el.deregister(pty_token(pty_id));

        let status = entry.pty.join_worker(self.config.join_timeout).unwrap_or(0);
        info!(pty = pty_id, status, "pty exited");

        let note = Message::Notification {
            method: "pty_exit".into(),
            params: Value::Array(vec![Value::UInt(pty_id), Value::UInt(status as u64)]),
        };
        for client_id in entry.pty.attached.iter().copied().collect::<Vec<_>>() {
            self.send_to_client(client_id, note.clone());
        }

        // Drop the pane from layouts while siblings remain; the sole pane
        // of a tab stays behind as a dead placeholder.
        let mut retile_sessions = Vec::new();
        for (name, session) in self.sessions.iter_mut() {
            for tab in session.tabs.iter_mut() {
                if !tab.root.contains(pty_id) {
                    continue;
                }
                if tab.root.pty_ids().len() > 1 {
                    if let Some(rest) = layout::remove_pane(tab.root.clone(), pty_id) {
                        tab.root = rest;
                        if tab.active_pane == pty_id {
                            tab.active_pane = tab.root.pty_ids().first().copied().unwrap_or(0);
                        }
                        retile_sessions.push(name.clone());
                    }
                }
            }
        }

        self.refresh_attachments();
        let retile_clients: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, c)| match &c.subscription {
                Subscription::Session { name } => retile_sessions.contains(name),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for client_id in retile_clients {
            self.retile_for_client(client_id);
            for visible in self.visible_ptys(client_id) {
                self.render_pty(visible);
            }
        }
    }

    fn reap_dead_clients(&mut self) {
        let dead: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, c)| c.dead)
            .map(|(id, _)| *id)
            .collect();
        let had_dead = !dead.is_empty();
        for client_id in dead {
            if let Some(client) = self.clients.remove(&client_id) {
                self.el.deregister(client_token(client_id));
                debug!(
                    client = client_id,
                    queued = client.queued_bytes(),
                    "client removed"
                );
            }
        }
        if had_dead {
            // PTYs keep running with no clients attached; sessions survive
            // detach.
            self.refresh_attachments();
        }
    }

    fn shutdown(&mut self) {
        info!("server shutting down");
        let pty_ids: Vec<u64> = self.ptys.keys().copied().collect();
        for pty_id in &pty_ids {
            if let Some(entry) = self.ptys.get_mut(pty_id) {
                entry.pty.request_shutdown();
            }
        }
        for pty_id in pty_ids {
            if let Some(mut entry) = self.ptys.remove(&pty_id) {
                if let Some(timer) = entry.timer.take() {
                    self.el.cancel(timer);
                }
                let status = entry.pty.join_worker(self.config.join_timeout).unwrap_or(0);
                let note = Message::Notification {
                    method: "pty_exit".into(),
                    params: Value::Array(vec![Value::UInt(pty_id), Value::UInt(status as u64)]),
                };
                for client_id in entry.pty.attached.iter().copied().collect::<Vec<_>>() {
                    self.send_to_client(client_id, note.clone());
                }
            }
        }
        for client in self.clients.values_mut() {
            let _ = client.flush();
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.config.socket_path);
    }
}

/// Flush a client's queue and keep its write interest in sync.
fn pump_client(el: &mut EventLoop, client: &mut Client) {
    match client.flush() {
        Ok(true) => el.set_interest(client_token(client.id), Interest::READ),
        Ok(false) => el.set_interest(client_token(client.id), Interest::READ_WRITE),
        Err(err) => {
            debug!(client = client.id, %err, "client write error");
            client.dead = true;
        }
    }
}

/// Bind the listening socket. A stale socket file is unlinked only when no
/// listener answers it.
fn bind_socket(config: &Config) -> Result<UnixListener> {
    let path = &config.socket_path;
    if path.exists() {
        match UnixStream::connect(path) {
            Ok(_) => {
                anyhow::bail!(
                    "another server is already listening on {}",
                    path.display()
                );
            }
            Err(_) => {
                std::fs::remove_file(path)
                    .with_context(|| format!("remove stale socket {}", path.display()))?;
            }
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket dir {}", parent.display()))?;
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("restrict socket permissions")?;
    Ok(listener)
}

// Request params arrive as a map or as positional arrays; accept both.
fn p_u64(params: &Value, key: &str, pos: usize) -> Option<u64> {
    params
        .map_get(key)
        .and_then(|v| v.as_u64())
        .or_else(|| params.as_array().and_then(|a| a.get(pos)).and_then(|v| v.as_u64()))
}

fn p_str(params: &Value, key: &str, pos: usize) -> Option<String> {
    params
        .map_get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| {
            params
                .as_array()
                .and_then(|a| a.get(pos))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
}

/// Translate a client mouse event into the byte sequence the application
/// asked for. Event shape: `{button, action, row, col, modifiers?}`.
fn encode_mouse(event: &Value, sgr: bool) -> Option<Vec<u8>> {
    let button = event.map_get("button")?.as_str()?;
    let action = event.map_get("action")?.as_str()?;
    let row = event.map_get("row")?.as_u64()?;
    let col = event.map_get("col")?.as_u64()?;

    let mut code: u64 = match button {
        "left" => 0,
        "middle" => 1,
        "right" => 2,
        "none" => 3,
        "wheel_up" => 64,
        "wheel_down" => 65,
        _ => return None,
    };
    let release = action == "release";
    match action {
        "press" | "release" => {}
        "drag" | "move" => code += 32,
        _ => return None,
    }
    if let Some(mods) = event.map_get("modifiers").and_then(|v| v.as_u64()) {
        // Client packs shift=4, alt=8, ctrl=16, matching the wire encoding.
        code |= mods & 0b11100;
    }

    let x = col + 1;
    let y = row + 1;
    if sgr {
        let tail = if release { 'm' } else { 'M' };
        Some(format!("\x1b[<{code};{x};{y}{tail}").into_bytes())
    } else {
        // Legacy X10 encoding, clamped to its 223-cell range.
        let code = if release { 3 } else { code };
        let cx = x.min(223) as u8 + 32;
        let cy = y.min(223) as u8 + 32;
        Some(vec![0x1b, b'[', b'M', 32 + code as u8, cx, cy])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        for id in [1u64, 7, 500] {
            let ct = client_token(id);
            assert_eq!(ct & 3, 2);
            assert_eq!(ct >> 2, id);
            let pt = pty_token(id);
            assert_eq!(pt & 3, 3);
            assert_eq!(pt >> 2, id);
        }
    }

    #[test]
    fn params_accept_map_and_positional() {
        let map = Value::Map(vec![
            (Value::Str("rows".into()), Value::UInt(30)),
            (Value::Str("name".into()), Value::Str("dev".into())),
        ]);
        assert_eq!(p_u64(&map, "rows", 0), Some(30));
        assert_eq!(p_str(&map, "name", 0), Some("dev".into()));

        let arr = Value::Array(vec![Value::UInt(30), Value::Str("dev".into())]);
        assert_eq!(p_u64(&arr, "rows", 0), Some(30));
        assert_eq!(p_str(&arr, "name", 1), Some("dev".into()));
        assert_eq!(p_u64(&arr, "cols", 5), None);
    }

    #[test]
    fn sgr_mouse_encoding() {
        let event = Value::Map(vec![
            (Value::Str("button".into()), Value::Str("left".into())),
            (Value::Str("action".into()), Value::Str("press".into())),
            (Value::Str("row".into()), Value::UInt(4)),
            (Value::Str("col".into()), Value::UInt(9)),
        ]);
        assert_eq!(
            encode_mouse(&event, true),
            Some(b"\x1b[<0;10;5M".to_vec())
        );
        let release = Value::Map(vec![
            (Value::Str("button".into()), Value::Str("left".into())),
            (Value::Str("action".into()), Value::Str("release".into())),
            (Value::Str("row".into()), Value::UInt(4)),
            (Value::Str("col".into()), Value::UInt(9)),
        ]);
        assert_eq!(
            encode_mouse(&release, true),
            Some(b"\x1b[<0;10;5m".to_vec())
        );
    }

    #[test]
    fn legacy_mouse_encoding() {
        let event = Value::Map(vec![
            (Value::Str("button".into()), Value::Str("left".into())),
            (Value::Str("action".into()), Value::Str("press".into())),
            (Value::Str("row".into()), Value::UInt(0)),
            (Value::Str("col".into()), Value::UInt(0)),
        ]);
        assert_eq!(
            encode_mouse(&event, false),
            Some(vec![0x1b, b'[', b'M', 32, 33, 33])
        );
    }

    #[test]
    fn wheel_and_drag_codes() {
        let wheel = Value::Map(vec![
            (Value::Str("button".into()), Value::Str("wheel_up".into())),
            (Value::Str("action".into()), Value::Str("press".into())),
            (Value::Str("row".into()), Value::UInt(0)),
            (Value::Str("col".into()), Value::UInt(0)),
        ]);
        assert_eq!(encode_mouse(&wheel, true), Some(b"\x1b[<64;1;1M".to_vec()));

        let drag = Value::Map(vec![
            (Value::Str("button".into()), Value::Str("left".into())),
            (Value::Str("action".into()), Value::Str("drag".into())),
            (Value::Str("row".into()), Value::UInt(2)),
            (Value::Str("col".into()), Value::UInt(2)),
        ]);
        assert_eq!(encode_mouse(&drag, true), Some(b"\x1b[<32;3;3M".to_vec()));
    }
}
