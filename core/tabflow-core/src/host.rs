//! Seams to the host environment.
//!
//! The engine reads the live tab inventory through [`TabInventory`] and never
//! performs side effects itself. Everything it wants done to the outside world
//! (timers, closing and reopening tabs) is returned as an [`Effect`], applied by
//! the caller after the snapshot has been committed.

use std::collections::HashSet;

use serde::Serialize;

use crate::types::{Millis, TabId, TabInfo, WindowId};

/// Read-only view of the host's open tabs.
pub trait TabInventory {
    fn all_tabs(&self) -> Vec<TabInfo>;

    fn get_tab(&self, tab_id: TabId) -> Option<TabInfo>;

    /// Tabs that are active in their window (one per window).
    fn active_tab_ids(&self) -> HashSet<TabId> {
        self.all_tabs()
            .into_iter()
            .filter(|tab| tab.active)
            .map(|tab| tab.id)
            .collect()
    }

    fn active_tab_in_window(&self, window_id: WindowId) -> Option<TabId> {
        self.all_tabs()
            .into_iter()
            .find(|tab| tab.window_id == window_id && tab.active)
            .map(|tab| tab.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    /// One-shot timer at an absolute time. Replaces any timer with the same name.
    ScheduleTimer { name: String, at: Millis },
    CancelTimer { name: String },
    CloseTab { tab_id: TabId },
    OpenTab { url: String },
}

/// Ordered effect list produced by one transition.
#[derive(Debug, Default)]
pub struct Effects {
    items: Vec<Effect>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, name: &str, at: Millis) {
        self.items.push(Effect::ScheduleTimer {
            name: name.to_string(),
            at,
        });
    }

    pub fn cancel(&mut self, name: &str) {
        if name.is_empty() {
            return;
        }
        self.items.push(Effect::CancelTimer {
            name: name.to_string(),
        });
    }

    pub fn close_tab(&mut self, tab_id: TabId) {
        self.items.push(Effect::CloseTab { tab_id });
    }

    pub fn open_tab(&mut self, url: &str) {
        self.items.push(Effect::OpenTab {
            url: url.to_string(),
        });
    }

    pub fn as_slice(&self) -> &[Effect] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<Effect> {
        self.items
    }
}
