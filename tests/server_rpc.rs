//! End-to-end exercises of the RPC surface over a real socket, with real
//! shells under the PTYs.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use muxd::config::Config;
use muxd::rpc::{FrameBuffer, Message, Value};
use muxd::server::Server;

fn test_config(dir: &std::path::Path, name: &str) -> Config {
    Config {
        name: name.to_string(),
        socket_path: dir.join(format!("{name}.sock")),
        state_dir: dir.join("state"),
        frame_budget: Duration::from_millis(16),
        outbound_cap: 8 * 1024 * 1024,
        join_timeout: Duration::from_secs(2),
        scrollback: 200,
        shell: "/bin/sh".to_string(),
        term_env: "xterm-256color".to_string(),
    }
}

fn start_server(name: &str) -> (tempfile::TempDir, PathBuf, thread::JoinHandle<()>) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), name);
    let socket = config.socket_path.clone();
    let mut server = Server::new(config).unwrap();
    let handle = thread::spawn(move || {
        let _ = server.run();
    });
    (dir, socket, handle)
}

struct TestClient {
    stream: UnixStream,
    frames: FrameBuffer,
    notifications: Vec<Message>,
    next_msgid: u64,
}

impl TestClient {
    fn connect(socket: &PathBuf) -> TestClient {
        let deadline = Instant::now() + Duration::from_secs(5);
        let stream = loop {
            match UnixStream::connect(socket) {
                Ok(s) => break s,
                Err(_) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(25))
                }
                Err(err) => panic!("connect {}: {err}", socket.display()),
            }
        };
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        TestClient {
            stream,
            frames: FrameBuffer::new(),
            notifications: Vec::new(),
            next_msgid: 1,
        }
    }

    fn pump(&mut self) {
        let mut buf = [0u8; 64 * 1024];
        match self.stream.read(&mut buf) {
            Ok(n) if n > 0 => self.frames.extend(&buf[..n]),
            _ => {}
        }
    }

    fn send(&mut self, msg: Message) {
        let mut wire = Vec::new();
        msg.encode_into(&mut wire);
        self.stream.write_all(&wire).unwrap();
    }

    fn notify(&mut self, method: &str, params: Value) {
        self.send(Message::Notification {
            method: method.to_string(),
            params,
        });
    }

    /// Send a request and wait for its response, stashing notifications that
    /// arrive in between.
    fn request(&mut self, method: &str, params: Value) -> (Value, Value) {
        let msgid = self.next_msgid;
        self.next_msgid += 1;
        self.send(Message::Request {
            msgid,
            method: method.to_string(),
            params,
        });
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            self.pump();
            while let Some(msg) = self.frames.next_message().unwrap() {
                match msg {
                    Message::Response {
                        msgid: got,
                        error,
                        result,
                    } if got == msgid => return (error, result),
                    Message::Response { .. } => {}
                    other => self.notifications.push(other),
                }
            }
        }
        panic!("no response to {method} within deadline");
    }

    fn expect_ok(&mut self, method: &str, params: Value) -> Value {
        let (error, result) = self.request(method, params);
        assert!(error.is_nil(), "{method} failed: {error:?}");
        result
    }

    /// Wait until a buffered or incoming notification satisfies `pred`.
    fn wait_notification<F>(&mut self, what: &str, mut pred: F) -> Message
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(pos) = self.notifications.iter().position(&mut pred) {
                return self.notifications.remove(pos);
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            self.pump();
            while let Some(msg) = self.frames.next_message().unwrap() {
                self.notifications.push(msg);
            }
        }
    }
}

fn map(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(
        pairs
            .into_iter()
            .map(|(k, v)| (Value::Str(k.to_string()), v))
            .collect(),
    )
}

fn is_redraw_with(msg: &Message, event_name: &str) -> bool {
    let Message::Notification { method, params } = msg else {
        return false;
    };
    if method != "redraw" {
        return false;
    }
    params
        .as_array()
        .map(|events| {
            events.iter().any(|e| {
                e.as_array()
                    .and_then(|parts| parts.first())
                    .and_then(|name| name.as_str())
                    == Some(event_name)
            })
        })
        .unwrap_or(false)
}

/// Text content of every grid_line event in a redraw notification.
fn redraw_text(msg: &Message) -> String {
    let Message::Notification { params, .. } = msg else {
        return String::new();
    };
    let mut out = String::new();
    if let Some(events) = params.as_array() {
        for event in events {
            let Some(parts) = event.as_array() else {
                continue;
            };
            if parts.first().and_then(|n| n.as_str()) != Some("grid_line") {
                continue;
            }
            let Some(args) = parts.get(1).and_then(|a| a.as_array()) else {
                continue;
            };
            if let Some(cells) = args.get(3).and_then(|c| c.as_array()) {
                for cell in cells {
                    if let Some(text) = cell.as_array().and_then(|c| c.first()).and_then(|t| t.as_str())
                    {
                        out.push_str(text);
                    }
                }
            }
            out.push('\n');
        }
    }
    out
}

#[test]
fn spawn_attach_echo() {
    let (_dir, socket, handle) = start_server("muxd-echo");
    let mut client = TestClient::connect(&socket);

    let result = client.expect_ok(
        "spawn_pty",
        map(vec![("rows", Value::UInt(24)), ("cols", Value::UInt(80))]),
    );
    let pty_id = result.map_get("pty_id").and_then(|v| v.as_u64()).unwrap();
    assert_eq!(pty_id, 1);

    client.expect_ok("attach", map(vec![("pty_id", Value::UInt(pty_id))]));
    // Initial full paint opens with grid_resize.
    let first = client.wait_notification("initial paint", |m| is_redraw_with(m, "grid_resize"));
    assert!(is_redraw_with(&first, "flush"));

    client.notify(
        "write_pty",
        Value::Array(vec![
            Value::UInt(pty_id),
            Value::Bin(b"echo MUXD_RPC_OK\r".to_vec()),
        ]),
    );
    client.wait_notification("echo output", |m| {
        is_redraw_with(m, "grid_line") && redraw_text(m).contains("MUXD_RPC_OK")
    });

    client.expect_ok("kill_server", Value::Array(Vec::new()));
    handle.join().unwrap();
}

#[test]
fn child_exit_notifies_and_unlists() {
    let (_dir, socket, handle) = start_server("muxd-exit");
    let mut client = TestClient::connect(&socket);

    let result = client.expect_ok(
        "spawn_pty",
        map(vec![
            ("rows", Value::UInt(24)),
            ("cols", Value::UInt(80)),
            ("attach", Value::Bool(true)),
        ]),
    );
    let pty_id = result.map_get("pty_id").and_then(|v| v.as_u64()).unwrap();

    client.notify(
        "write_pty",
        Value::Array(vec![Value::UInt(pty_id), Value::Bin(b"exit 7\r".to_vec())]),
    );
    let exit = client.wait_notification("pty_exit", |m| {
        matches!(m, Message::Notification { method, .. } if method == "pty_exit")
    });
    match exit {
        Message::Notification { params, .. } => {
            let args = params.as_array().unwrap();
            assert_eq!(args[0].as_u64(), Some(pty_id));
            assert_eq!(args[1].as_u64(), Some(7));
        }
        _ => unreachable!(),
    }

    let listed = client.expect_ok("list_ptys", Value::Array(Vec::new()));
    let ptys = listed.map_get("ptys").and_then(|v| v.as_array()).unwrap();
    assert!(ptys.is_empty(), "dead pty still listed: {ptys:?}");

    client.expect_ok("kill_server", Value::Array(Vec::new()));
    handle.join().unwrap();
}

#[test]
fn session_attach_split_and_resize() {
    let (_dir, socket, handle) = start_server("muxd-split");
    let mut client = TestClient::connect(&socket);

    client.expect_ok(
        "resize",
        map(vec![("rows", Value::UInt(24)), ("cols", Value::UInt(80))]),
    );
    client.expect_ok("attach", map(vec![("session", Value::Str("work".into()))]));
    client.wait_notification("initial paint", |m| is_redraw_with(m, "grid_resize"));

    let result = client.expect_ok("split_pane", map(vec![("direction", Value::Str("row".into()))]));
    let new_pty = result.map_get("pty_id").and_then(|v| v.as_u64()).unwrap();

    // Both panes are live and tiled to half the viewport: the new grid
    // announces 12 rows.
    client.wait_notification("new pane paint", |m| {
        let Message::Notification { method, params } = m else {
            return false;
        };
        method == "redraw"
            && params
                .as_array()
                .map(|events| {
                    events.iter().any(|e| {
                        let parts = match e.as_array() {
                            Some(p) => p,
                            None => return false,
                        };
                        if parts.first().and_then(|n| n.as_str()) != Some("grid_resize") {
                            return false;
                        }
                        let args = match parts.get(1).and_then(|a| a.as_array()) {
                            Some(a) => a,
                            None => return false,
                        };
                        args.first().and_then(|g| g.as_u64()) == Some(new_pty)
                            && args.get(2).and_then(|h| h.as_u64()) == Some(12)
                    })
                })
                .unwrap_or(false)
    });

    let listed = client.expect_ok("list_ptys", Value::Array(Vec::new()));
    let ptys = listed.map_get("ptys").and_then(|v| v.as_array()).unwrap();
    assert_eq!(ptys.len(), 2);

    client.expect_ok("kill_server", Value::Array(Vec::new()));
    handle.join().unwrap();
}

#[test]
fn sessions_persist_across_save_and_load() {
    let (_dir, socket, handle) = start_server("muxd-persist");
    let mut client = TestClient::connect(&socket);

    client.expect_ok("attach", map(vec![("session", Value::Str("proj".into()))]));
    client.expect_ok("split_pane", map(vec![("direction", Value::Str("col".into()))]));
    client.expect_ok("session_save", map(vec![("name", Value::Str("proj".into()))]));

    let sessions = client.expect_ok("list_sessions", Value::Array(Vec::new()));
    let items = sessions
        .map_get("sessions")
        .and_then(|v| v.as_array())
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].map_get("name").and_then(|v| v.as_str()), Some("proj"));

    // Reload under a different name path: delete live, load from disk.
    client.expect_ok("detach", Value::Array(Vec::new()));
    client.expect_ok(
        "session_rename",
        map(vec![
            ("from", Value::Str("proj".into())),
            ("to", Value::Str("proj2".into())),
        ]),
    );
    client.expect_ok("session_load", map(vec![("name", Value::Str("proj2".into()))]));

    let listed = client.expect_ok("list_ptys", Value::Array(Vec::new()));
    let ptys = listed.map_get("ptys").and_then(|v| v.as_array()).unwrap();
    // Two panes from the original session plus two respawned by the load.
    assert_eq!(ptys.len(), 4);

    client.expect_ok("kill_server", Value::Array(Vec::new()));
    handle.join().unwrap();
}
