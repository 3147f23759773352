//! SVN property sets
//!
//! Versioned node properties and unversioned revision properties share the
//! same representation: an ordered name -> value map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property value
pub type PropertyValue = String;

/// A set of properties for one node or one revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Property changes: `Some(value)` sets, `None` deletes
pub type PropertyDiff = BTreeMap<String, Option<PropertyValue>>;

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Set or delete depending on `value`
    pub fn apply(&mut self, name: &str, value: Option<&str>) {
        match value {
            Some(v) => self.set(name, v),
            None => {
                self.remove(name);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Changes that turn `self` (the base) into `working`.
    pub fn diff(&self, working: &PropertySet) -> PropertyDiff {
        let mut diff = PropertyDiff::new();
        for (name, value) in &working.properties {
            if self.properties.get(name) != Some(value) {
                diff.insert(name.clone(), Some(value.clone()));
            }
        }
        for name in self.properties.keys() {
            if !working.properties.contains_key(name) {
                diff.insert(name.clone(), None);
            }
        }
        diff
    }

    /// Every property as a "set" change; used when the base is discarded
    /// (replacements, plain adds).
    pub fn as_diff(&self) -> PropertyDiff {
        self.properties
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect()
    }
}

impl FromIterator<(String, String)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            properties: iter.into_iter().collect(),
        }
    }
}

/// SVN standard node properties
pub mod svn_props {
    pub const EXECUTABLE: &str = "svn:executable";
    pub const MIME_TYPE: &str = "svn:mime-type";
    pub const EOL_STYLE: &str = "svn:eol-style";
    pub const SPECIAL: &str = "svn:special";
    pub const NEEDS_LOCK: &str = "svn:needs-lock";
}

/// Unversioned revision properties
pub mod revprops {
    pub const LOG: &str = "svn:log";
    pub const AUTHOR: &str = "svn:author";
    pub const DATE: &str = "svn:date";
}

/// Revision-0 properties holding the sync cursor and lock of a mirror.
pub mod sync_props {
    /// The URL of the source repository.
    pub const FROM_URL: &str = "svn:sync-from-url";
    /// The UUID of the source repository.
    pub const FROM_UUID: &str = "svn:sync-from-uuid";
    /// The last merged revision.
    pub const LAST_MERGED_REV: &str = "svn:sync-last-merged-rev";
    /// Lock token (prevents concurrent syncs).
    pub const LOCK: &str = "svn:sync-lock";
    /// Revision currently being copied (crash recovery).
    pub const CURRENTLY_COPYING: &str = "svn:sync-currently-copying";

    /// Whether `name` is sync bookkeeping that must never be copied between
    /// repositories.
    pub fn is_reserved(name: &str) -> bool {
        name.starts_with("sync-") || name.starts_with("svn:sync-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff() {
        let mut base = PropertySet::new();
        base.set("a", "1");
        base.set("b", "2");
        let mut working = base.clone();
        working.set("a", "changed");
        working.remove("b");
        working.set("c", "3");

        let diff = base.diff(&working);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff["a"], Some("changed".to_string()));
        assert_eq!(diff["b"], None);
        assert_eq!(diff["c"], Some("3".to_string()));
        assert!(base.diff(&base).is_empty());
    }

    #[test]
    fn test_reserved_sync_names() {
        assert!(sync_props::is_reserved(sync_props::LOCK));
        assert!(sync_props::is_reserved("sync-foo"));
        assert!(!sync_props::is_reserved(revprops::LOG));
    }
}
