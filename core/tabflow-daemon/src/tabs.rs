//! Mirror of the browser's open tabs, fed by host events.

use std::collections::BTreeMap;

use tabflow_core::{TabId, TabInfo, TabInventory, WindowId};
use tabflow_protocol::TabSnapshot;

#[derive(Debug, Default)]
pub struct TabMirror {
    tabs: BTreeMap<TabId, TabInfo>,
    focused_window: Option<WindowId>,
}

impl TabMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, tabs: Vec<TabSnapshot>, focused_window: Option<WindowId>) {
        self.tabs = tabs
            .into_iter()
            .map(|tab| (tab.id, tab_info(tab)))
            .collect();
        self.focused_window = focused_window;
    }

    pub fn upsert(&mut self, tab: TabSnapshot) {
        let info = tab_info(tab);
        if info.active {
            self.deactivate_window(info.window_id);
        }
        self.tabs.insert(info.id, info);
    }

    /// Applies changed fields. Returns false for a tab the mirror has never seen.
    pub fn update(
        &mut self,
        tab_id: TabId,
        url: Option<String>,
        title: Option<String>,
        fav_icon_url: Option<String>,
    ) -> bool {
        let Some(tab) = self.tabs.get_mut(&tab_id) else {
            return false;
        };
        if url.is_some() {
            tab.url = url;
        }
        if title.is_some() {
            tab.title = title;
        }
        if fav_icon_url.is_some() {
            tab.fav_icon_url = fav_icon_url;
        }
        true
    }

    pub fn activate(&mut self, tab_id: TabId, window_id: WindowId) {
        self.deactivate_window(window_id);
        if let Some(tab) = self.tabs.get_mut(&tab_id) {
            tab.window_id = window_id;
            tab.active = true;
        }
    }

    pub fn remove(&mut self, tab_id: TabId) -> Option<TabInfo> {
        self.tabs.remove(&tab_id)
    }

    pub fn focus(&mut self, window_id: Option<WindowId>) {
        self.focused_window = window_id;
    }

    pub fn focused_window(&self) -> Option<WindowId> {
        self.focused_window
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    fn deactivate_window(&mut self, window_id: WindowId) {
        for tab in self.tabs.values_mut() {
            if tab.window_id == window_id {
                tab.active = false;
            }
        }
    }
}

impl TabInventory for TabMirror {
    fn all_tabs(&self) -> Vec<TabInfo> {
        self.tabs.values().cloned().collect()
    }

    fn get_tab(&self, tab_id: TabId) -> Option<TabInfo> {
        self.tabs.get(&tab_id).cloned()
    }
}

fn tab_info(tab: TabSnapshot) -> TabInfo {
    TabInfo {
        id: tab.id,
        window_id: tab.window_id,
        url: tab.url,
        title: tab.title,
        fav_icon_url: tab.fav_icon_url,
        active: tab.active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: TabId, window_id: WindowId, active: bool) -> TabSnapshot {
        TabSnapshot {
            id,
            window_id,
            url: Some(format!("https://site{}.test", id)),
            title: None,
            fav_icon_url: None,
            active,
        }
    }

    #[test]
    fn activation_is_exclusive_per_window() {
        let mut mirror = TabMirror::new();
        mirror.replace_all(
            vec![snapshot(1, 1, true), snapshot(2, 1, false), snapshot(3, 2, true)],
            Some(1),
        );

        mirror.activate(2, 1);

        assert_eq!(mirror.active_tab_in_window(1), Some(2));
        assert_eq!(mirror.active_tab_in_window(2), Some(3));
        assert!(!mirror.get_tab(1).expect("tab 1").active);
    }

    #[test]
    fn update_keeps_unchanged_fields() {
        let mut mirror = TabMirror::new();
        mirror.upsert(snapshot(1, 1, false));

        assert!(mirror.update(1, None, Some("Feed".to_string()), None));
        let tab = mirror.get_tab(1).expect("tab");
        assert_eq!(tab.url.as_deref(), Some("https://site1.test"));
        assert_eq!(tab.title.as_deref(), Some("Feed"));

        assert!(!mirror.update(9, Some("https://x.test".to_string()), None, None));
    }

    #[test]
    fn remove_drops_tab() {
        let mut mirror = TabMirror::new();
        mirror.upsert(snapshot(1, 1, true));
        assert_eq!(mirror.remove(1).map(|tab| tab.id), Some(1));
        assert!(mirror.is_empty());
        assert!(mirror.remove(1).is_none());
    }
}
