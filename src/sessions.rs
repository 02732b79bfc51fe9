//! Named sessions and their on-disk store.
//!
//! A session is an ordered list of tabs, each a layout tree of panes, plus
//! the index of the active tab. Sessions persist as one JSON file each under
//! the state directory; the store converts between the file shape (1-based
//! `active_tab`) and the in-memory records so the rest of the server never
//! touches JSON.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::LayoutNode;

#[derive(Clone, Debug)]
pub struct Tab {
    pub root: LayoutNode,
    /// The pane that receives splits and session-directed input.
    pub active_pane: u64,
}

impl Tab {
    pub fn new(root: LayoutNode) -> Self {
        let active_pane = root.pty_ids().first().copied().unwrap_or(0);
        Tab { root, active_pane }
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    pub name: String,
    pub tabs: Vec<Tab>,
    pub active_tab: usize,
}

impl Session {
    /// A fresh session holding a single pane.
    pub fn with_pane(name: impl Into<String>, pty_id: u64, cwd: impl Into<String>) -> Self {
        Session {
            name: name.into(),
            tabs: vec![Tab::new(LayoutNode::pane(pty_id, cwd))],
            active_tab: 0,
        }
    }

    pub fn active_tab(&self) -> &Tab {
        &self.tabs[self.active_tab.min(self.tabs.len() - 1)]
    }

    pub fn active_tab_mut(&mut self) -> &mut Tab {
        let idx = self.active_tab.min(self.tabs.len() - 1);
        &mut self.tabs[idx]
    }

    /// Every pty referenced anywhere in the session.
    pub fn pty_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        for tab in &self.tabs {
            ids.extend(tab.root.pty_ids());
        }
        ids
    }
}

// On-disk shape: `{active_tab: <1-based>, tabs: [{root: <node>}]}`.
#[derive(Serialize, Deserialize)]
struct SessionFile {
    active_tab: usize,
    tabs: Vec<TabFile>,
}

#[derive(Serialize, Deserialize)]
struct TabFile {
    root: LayoutNode,
}

/// Loads and saves session files under one directory.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        SessionStore { dir }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || name.starts_with('.')
        {
            bail!("invalid session name {name:?}");
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.name)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create sessions dir {}", self.dir.display()))?;
        let file = SessionFile {
            active_tab: session.active_tab + 1,
            tabs: session
                .tabs
                .iter()
                .map(|t| TabFile {
                    root: t.root.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(&path, json).with_context(|| format!("write session {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Session> {
        let path = self.path_for(name)?;
        let json =
            fs::read_to_string(&path).with_context(|| format!("read session {}", path.display()))?;
        let file: SessionFile =
            serde_json::from_str(&json).with_context(|| format!("parse session {name:?}"))?;
        if file.tabs.is_empty() {
            bail!("session {name:?} has no tabs");
        }
        let tabs: Vec<Tab> = file.tabs.into_iter().map(|t| Tab::new(t.root)).collect();
        let active_tab = file.active_tab.saturating_sub(1).min(tabs.len() - 1);
        Ok(Session {
            name: name.to_string(),
            tabs,
            active_tab,
        })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        fs::remove_file(&path).with_context(|| format!("delete session {}", path.display()))
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let from = self.path_for(old)?;
        let to = self.path_for(new)?;
        if to.exists() {
            bail!("session {new:?} already exists");
        }
        if from.exists() {
            fs::rename(&from, &to)
                .with_context(|| format!("rename session {old:?} to {new:?}"))?;
        }
        Ok(())
    }

    /// Names of every saved session.
    pub fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        names
    }
}
