//! Well-known names and typed configuration views.
//!
//! Node-local configuration is stored as flat string properties per PID in the
//! [`ConfigStore`](crate::config_store::ConfigStore). The structs here are the
//! typed views built from those properties at load time; the raw key-value form
//! only appears when reading or writing a PID.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Name of the group every node belongs to and that cannot be removed.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Separator between a domain constant and a group name in collection names.
pub const SEPARATOR: &str = "/";

/// PID holding the local node configuration.
pub const NODE_PID: &str = "org.apache.karaf.cellar.node";
/// PID holding the synchronization policy of every group.
pub const GROUPS_PID: &str = "org.apache.karaf.cellar.groups";

/// Distributed map of group name to [`Group`](crate::group::Group).
pub const GROUPS_MAP: &str = "org.apache.karaf.cellar.groups";
/// Distributed map mirroring the properties of [`GROUPS_PID`].
pub const GROUPS_CONFIG_MAP: &str = "org.apache.karaf.cellar.groups.config";
/// Topic used by broadcast producers and consumers.
pub const EVENT_TOPIC: &str = "org.apache.karaf.cellar.event.topic";
/// Queue used by point-to-point producers and consumers.
pub const EVENT_QUEUE: &str = "org.apache.karaf.cellar.event.queue";

/// Node property listing joined groups.
pub const GROUPS_KEY: &str = "groups";
/// Node property holding the producer switch.
pub const PRODUCER_KEY: &str = "producer";
/// Node property holding the consumer switch.
pub const CONSUMER_KEY: &str = "consumer";
/// Prefix of node properties holding event handler switches.
pub const HANDLER_PREFIX: &str = "handler.";

/// Group property suffix naming the parent group.
pub const PARENT_KEY: &str = "parent";
/// Group property suffix holding a category sync flag.
pub const SYNC_KEY: &str = "sync";

/// Builds the name of a per-group distributed collection.
///
/// Every node in the same group computes the same name.
pub fn collection_name(domain: &str, group: &str) -> String {
    format!("{}{}{}", domain, SEPARATOR, group)
}

/// Name of the node property holding the switch of an event handler.
pub fn handler_key(handler: &str) -> String {
    format!("{}{}", HANDLER_PREFIX, handler)
}

/// Parses a comma separated property into a set, dropping blanks.
pub fn parse_set(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Joins a set into a comma separated property.
pub fn format_set(values: &BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Parses a boolean property. Anything but `true`/`false` is unreadable.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Resource category a policy applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// Configuration PIDs.
    Config,
    /// Features.
    Features,
    /// Feature repositories.
    FeatureRepositories,
    /// Bundles.
    Bundle,
    /// OBR repository urls.
    ObrUrls,
    /// OBR bundles.
    ObrBundles,
}

impl Category {
    /// Every category, in property order.
    pub const ALL: [Category; 6] = [
        Category::Config,
        Category::Features,
        Category::FeatureRepositories,
        Category::Bundle,
        Category::ObrUrls,
        Category::ObrBundles,
    ];

    /// Property segment for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Config => "config",
            Category::Features => "features",
            Category::FeatureRepositories => "features.repositories",
            Category::Bundle => "bundle",
            Category::ObrUrls => "obr.urls",
            Category::ObrBundles => "obr.bundles",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction a resource travels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Cluster state applied locally.
    Inbound,
    /// Local state written to the cluster.
    Outbound,
}

impl Direction {
    /// Property segment for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Kind of pattern list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListType {
    /// Resources allowed through.
    Whitelist,
    /// Resources always denied.
    Blacklist,
}

impl ListType {
    /// Property segment for this list type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ListType::Whitelist => "whitelist",
            ListType::Blacklist => "blacklist",
        }
    }
}

/// Property key of a group list: `<group>.<category>.<list>.<direction>`.
pub fn list_key(group: &str, category: Category, list: ListType, direction: Direction) -> String {
    format!(
        "{}.{}.{}.{}",
        group,
        category.as_str(),
        list.as_str(),
        direction.as_str()
    )
}

/// Property key of a group sync flag: `<group>.<category>.sync`.
pub fn sync_key(group: &str, category: Category) -> String {
    format!("{}.{}.{}", group, category.as_str(), SYNC_KEY)
}

/// Property key of a group parent: `<group>.parent`.
pub fn parent_key(group: &str) -> String {
    format!("{}.{}", group, PARENT_KEY)
}

/// Synchronization policy of one category within a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// Whether pull/push run for this category.
    pub sync_enabled: bool,
    /// Patterns allowed in.
    pub inbound_whitelist: BTreeSet<String>,
    /// Patterns denied in.
    pub inbound_blacklist: BTreeSet<String>,
    /// Patterns allowed out.
    pub outbound_whitelist: BTreeSet<String>,
    /// Patterns denied out.
    pub outbound_blacklist: BTreeSet<String>,
}

impl CategoryPolicy {
    /// Returns the requested list.
    pub fn list(&self, list: ListType, direction: Direction) -> &BTreeSet<String> {
        match (list, direction) {
            (ListType::Whitelist, Direction::Inbound) => &self.inbound_whitelist,
            (ListType::Blacklist, Direction::Inbound) => &self.inbound_blacklist,
            (ListType::Whitelist, Direction::Outbound) => &self.outbound_whitelist,
            (ListType::Blacklist, Direction::Outbound) => &self.outbound_blacklist,
        }
    }

    fn list_mut(&mut self, list: ListType, direction: Direction) -> &mut BTreeSet<String> {
        match (list, direction) {
            (ListType::Whitelist, Direction::Inbound) => &mut self.inbound_whitelist,
            (ListType::Blacklist, Direction::Inbound) => &mut self.inbound_blacklist,
            (ListType::Whitelist, Direction::Outbound) => &mut self.outbound_whitelist,
            (ListType::Blacklist, Direction::Outbound) => &mut self.outbound_blacklist,
        }
    }

    /// Built-in policy used when no configuration exists for a category.
    pub fn default_for(category: Category) -> Self {
        let blacklist: BTreeSet<String> = match category {
            Category::Config => parse_set(
                "org.apache.karaf.cellar*,org.apache.felix.fileinstall*,org.ops4j.pax.logging",
            ),
            Category::Features => parse_set("cellar*"),
            Category::Bundle => parse_set("*.xml"),
            _ => BTreeSet::new(),
        };
        Self {
            sync_enabled: true,
            inbound_whitelist: parse_set("*"),
            inbound_blacklist: blacklist.clone(),
            outbound_whitelist: parse_set("*"),
            outbound_blacklist: blacklist,
        }
    }
}

/// Typed view of the policy of one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group name.
    pub group: String,
    /// Group whose lists are merged into this group's lists.
    pub parent: Option<String>,
    /// Policy per category.
    pub categories: BTreeMap<Category, CategoryPolicy>,
}

impl GroupConfig {
    /// Built-in defaults for a group.
    pub fn defaults(group: &str) -> Self {
        Self {
            group: group.to_string(),
            parent: None,
            categories: Category::ALL
                .iter()
                .map(|c| (*c, CategoryPolicy::default_for(*c)))
                .collect(),
        }
    }

    /// Returns true if `key` is one of this group's policy properties.
    ///
    /// Compares against the full key set rather than the `<group>.` prefix,
    /// which group `a` shares with group `a.b`.
    pub fn owns_key(group: &str, key: &str) -> bool {
        if key == parent_key(group) {
            return true;
        }
        Category::ALL.iter().any(|category| {
            key == sync_key(group, *category)
                || [ListType::Whitelist, ListType::Blacklist].iter().any(|list| {
                    [Direction::Inbound, Direction::Outbound]
                        .iter()
                        .any(|direction| key == list_key(group, *category, *list, *direction))
                })
        })
    }

    /// Returns true if the groups PID has any property for this group.
    pub fn exists_in(group: &str, props: &BTreeMap<String, String>) -> bool {
        props.keys().any(|k| Self::owns_key(group, k))
    }

    /// Builds the typed view from the groups PID.
    ///
    /// Missing keys fall back to the built-in defaults; an unreadable sync flag
    /// keeps the default.
    pub fn from_properties(group: &str, props: &BTreeMap<String, String>) -> Self {
        let mut config = Self::defaults(group);
        config.parent = props
            .get(&parent_key(group))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        for category in Category::ALL {
            let policy = config
                .categories
                .entry(category)
                .or_insert_with(|| CategoryPolicy::default_for(category));
            if let Some(flag) = props.get(&sync_key(group, category)).and_then(|v| parse_bool(v)) {
                policy.sync_enabled = flag;
            }
            for list in [ListType::Whitelist, ListType::Blacklist] {
                for direction in [Direction::Inbound, Direction::Outbound] {
                    if let Some(value) = props.get(&list_key(group, category, list, direction)) {
                        *policy.list_mut(list, direction) = parse_set(value);
                    }
                }
            }
        }
        config
    }

    /// Writes the typed view back into the groups PID.
    pub fn write_into(&self, props: &mut BTreeMap<String, String>) {
        match &self.parent {
            Some(parent) => {
                props.insert(parent_key(&self.group), parent.clone());
            }
            None => {
                props.remove(&parent_key(&self.group));
            }
        }
        for (category, policy) in &self.categories {
            props.insert(
                sync_key(&self.group, *category),
                policy.sync_enabled.to_string(),
            );
            for list in [ListType::Whitelist, ListType::Blacklist] {
                for direction in [Direction::Inbound, Direction::Outbound] {
                    props.insert(
                        list_key(&self.group, *category, list, direction),
                        format_set(policy.list(list, direction)),
                    );
                }
            }
        }
    }

    /// Copies every property of `from` into `to`, renaming the group prefix.
    ///
    /// Used to seed a new group from the default group's policy.
    pub fn copy_properties(
        from: &str,
        to: &str,
        props: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let prefix = format!("{}.", from);
        props
            .iter()
            .filter(|(k, _)| Self::owns_key(from, k))
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .filter(|rest| *rest != PARENT_KEY)
                    .map(|rest| (format!("{}.{}", to, rest), v.clone()))
            })
            .collect()
    }

    /// Policy of a category.
    pub fn policy(&self, category: Category) -> CategoryPolicy {
        self.categories
            .get(&category)
            .cloned()
            .unwrap_or_else(|| CategoryPolicy::default_for(category))
    }

    /// Whether pull/push run for a category.
    pub fn is_sync_enabled(&self, category: Category) -> bool {
        self.policy(category).sync_enabled
    }
}

/// Typed view of the local node configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Groups this node belongs to.
    pub groups: BTreeSet<String>,
    /// Producer switch.
    pub producer: bool,
    /// Consumer switch.
    pub consumer: bool,
    /// Event handler switches by handler name.
    pub handlers: BTreeMap<String, bool>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let mut groups = BTreeSet::new();
        groups.insert(DEFAULT_GROUP_NAME.to_string());
        Self {
            groups,
            producer: true,
            consumer: true,
            handlers: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    /// Builds the typed view from the node PID.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Self {
        let mut config = Self::default();
        if let Some(groups) = props.get(GROUPS_KEY) {
            config.groups = parse_set(groups);
        }
        if let Some(flag) = props.get(PRODUCER_KEY).and_then(|v| parse_bool(v)) {
            config.producer = flag;
        }
        if let Some(flag) = props.get(CONSUMER_KEY).and_then(|v| parse_bool(v)) {
            config.consumer = flag;
        }
        for (key, value) in props {
            if let Some(name) = key.strip_prefix(HANDLER_PREFIX) {
                if let Some(flag) = parse_bool(value) {
                    config.handlers.insert(name.to_string(), flag);
                }
            }
        }
        config
    }

    /// Flat properties for the node PID.
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert(GROUPS_KEY.to_string(), format_set(&self.groups));
        props.insert(PRODUCER_KEY.to_string(), self.producer.to_string());
        props.insert(CONSUMER_KEY.to_string(), self.consumer.to_string());
        for (name, flag) in &self.handlers {
            props.insert(handler_key(name), flag.to_string());
        }
        props
    }
}
