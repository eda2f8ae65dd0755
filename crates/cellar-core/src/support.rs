//! Whitelist/blacklist policy resolution.
//!
//! Patterns use `*` as the only wildcard and must match the whole resource id.
//! An empty whitelist allows everything; a non-empty one denies whatever it
//! does not match. A blacklist match always denies, whatever the whitelist said.

use dashmap::DashMap;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config_store::ConfigStore;
use crate::configuration::{Category, Direction, GroupConfig, ListType, GROUPS_PID};

/// Translates a wildcard pattern into an anchored regular expression.
pub fn wildcard_regex(pattern: &str) -> String {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("^{}$", body)
}

/// Resolves effective policy for (group, category, direction) tuples.
pub struct CellarSupport {
    store: Arc<ConfigStore>,
    compiled: DashMap<String, Regex>,
}

impl CellarSupport {
    /// Creates a policy engine reading group configuration from `store`.
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            compiled: DashMap::new(),
        }
    }

    /// Full-string wildcard match.
    pub fn wildcard_match(&self, pattern: &str, value: &str) -> bool {
        if let Some(re) = self.compiled.get(pattern) {
            return re.is_match(value);
        }
        match Regex::new(&wildcard_regex(pattern)) {
            Ok(re) => {
                let matched = re.is_match(value);
                self.compiled.insert(pattern.to_string(), re);
                matched
            }
            Err(e) => {
                warn!(pattern, error = %e, "ignoring invalid pattern");
                false
            }
        }
    }

    /// Evaluates a resource id against explicit lists.
    pub fn is_allowed<'a, W, B>(&self, resource: &str, whitelist: W, blacklist: B) -> bool
    where
        W: IntoIterator<Item = &'a String>,
        B: IntoIterator<Item = &'a String>,
    {
        let mut whitelist = whitelist.into_iter().peekable();
        let mut allowed = true;
        if whitelist.peek().is_some() {
            allowed = whitelist.any(|p| self.wildcard_match(p, resource));
        }
        if blacklist.into_iter().any(|p| self.wildcard_match(p, resource)) {
            allowed = false;
        }
        allowed
    }

    /// Typed policy of a group as currently configured.
    pub fn group_config(&self, group: &str) -> GroupConfig {
        let props = self.store.get(GROUPS_PID).unwrap_or_default();
        GroupConfig::from_properties(group, &props)
    }

    /// Entries of one list for a group, merged with every ancestor's entries.
    pub fn get_list_entries(
        &self,
        list: ListType,
        group: &str,
        category: Category,
        direction: Direction,
    ) -> BTreeSet<String> {
        let mut entries = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut current = Some(group.to_string());
        while let Some(name) = current.take() {
            if !visited.insert(name.clone()) {
                warn!(group, parent = %name, "parent cycle in group configuration");
                break;
            }
            let config = self.group_config(&name);
            entries.extend(config.policy(category).list(list, direction).iter().cloned());
            current = config.parent;
        }
        entries
    }

    /// Evaluates a resource against a group's effective lists.
    pub fn is_allowed_for(
        &self,
        group: &str,
        category: Category,
        resource: &str,
        direction: Direction,
    ) -> bool {
        let whitelist = self.get_list_entries(ListType::Whitelist, group, category, direction);
        let blacklist = self.get_list_entries(ListType::Blacklist, group, category, direction);
        let allowed = self.is_allowed(resource, &whitelist, &blacklist);
        if !allowed {
            debug!(
                group,
                category = %category,
                resource,
                direction = direction.as_str(),
                "resource blocked by policy"
            );
        }
        allowed
    }

    /// Whether synchronization of a category is enabled for a group.
    pub fn is_sync_enabled(&self, group: &str, category: Category) -> bool {
        self.group_config(group).is_sync_enabled(category)
    }
}
