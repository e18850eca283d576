//! Node and revision properties
//!
//! Node properties are part of a node-revision and change only through a
//! transaction. Revision properties live beside the revision and may be
//! changed after the fact; every such change is journaled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property value
pub type PropertyValue = String;

/// Ordered property list for one node or revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    /// Sorted so node-revision hashes are deterministic
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl PropertySet {
    /// Create a new empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a property value
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Set a property value
    pub fn set(&mut self, name: String, value: PropertyValue) {
        self.properties.insert(name, value);
    }

    /// Remove a property
    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Set (`Some`) or remove (`None`); returns the previous value
    pub fn apply(&mut self, name: &str, value: Option<PropertyValue>) -> Option<PropertyValue> {
        match value {
            Some(v) => self.properties.insert(name.to_string(), v),
            None => self.properties.remove(name),
        }
    }

    /// List all property names
    pub fn list(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    /// Check if property exists
    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.properties.iter()
    }
}

impl From<BTreeMap<String, PropertyValue>> for PropertySet {
    fn from(properties: BTreeMap<String, PropertyValue>) -> Self {
        Self { properties }
    }
}

impl FromIterator<(String, PropertyValue)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (String, PropertyValue)>>(iter: I) -> Self {
        Self {
            properties: iter.into_iter().collect(),
        }
    }
}

/// One entry of the revision-property journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevpropChange {
    /// Journal sequence number, increasing across the whole store
    pub seq: u64,
    pub rev: u64,
    pub name: String,
    pub old_value: Option<PropertyValue>,
    pub new_value: Option<PropertyValue>,
    /// RFC 3339 timestamp of the change
    pub changed_at: String,
}

impl RevpropChange {
    /// Hook action letter: A(dd), M(odify) or D(elete)
    pub fn action(&self) -> &'static str {
        match (&self.old_value, &self.new_value) {
            (None, _) => "A",
            (Some(_), Some(_)) => "M",
            (Some(_), None) => "D",
        }
    }
}

/// SVN standard properties
pub mod svn_props {
    /// Revision author
    pub const AUTHOR: &str = "svn:author";

    /// Commit timestamp
    pub const DATE: &str = "svn:date";

    /// Log message
    pub const LOG: &str = "svn:log";

    /// Executable flag
    pub const EXECUTABLE: &str = "svn:executable";

    /// MIME type
    pub const MIME_TYPE: &str = "svn:mime-type";

    /// Ignore patterns
    pub const IGNORE: &str = "svn:ignore";

    /// End-of-line style
    pub const EOL_STYLE: &str = "svn:eol-style";

    /// Keywords
    pub const KEYWORDS: &str = "svn:keywords";

    /// Merge info
    pub const MERGE_INFO: &str = "svn:mergeinfo";

    /// Check if a property name is an SVN standard property
    pub fn is_svn_property(name: &str) -> bool {
        name.starts_with("svn:")
    }
}

/// Current time in the `svn:date` format
pub fn svn_date_now() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_set_basic_operations() {
        let mut prop_set = PropertySet::new();

        assert!(prop_set.get("test").is_none());
        assert!(!prop_set.contains("test"));

        prop_set.set("test".to_string(), "value".to_string());
        assert_eq!(prop_set.get("test"), Some(&"value".to_string()));
        assert!(prop_set.contains("test"));

        let removed = prop_set.remove("test");
        assert_eq!(removed, Some("value".to_string()));
        assert!(!prop_set.contains("test"));
    }

    #[test]
    fn test_apply_sets_and_removes() {
        let mut props = PropertySet::new();
        assert_eq!(props.apply("a", Some("1".into())), None);
        assert_eq!(props.apply("a", Some("2".into())), Some("1".into()));
        assert_eq!(props.apply("a", None), Some("2".into()));
        assert!(props.is_empty());
        assert_eq!(props.apply("missing", None), None);
    }

    #[test]
    fn test_list_is_sorted() {
        let props: PropertySet = vec![
            ("zeta".to_string(), "1".to_string()),
            ("alpha".to_string(), "2".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(props.list(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_empty_property_value() {
        let mut prop_set = PropertySet::new();
        prop_set.set("empty".to_string(), "".to_string());
        assert_eq!(prop_set.get("empty"), Some(&"".to_string()));
    }

    #[test]
    fn test_revprop_change_action() {
        let mut change = RevpropChange {
            seq: 1,
            rev: 1,
            name: svn_props::LOG.into(),
            old_value: None,
            new_value: Some("msg".into()),
            changed_at: svn_date_now(),
        };
        assert_eq!(change.action(), "A");
        change.old_value = Some("old".into());
        assert_eq!(change.action(), "M");
        change.new_value = None;
        assert_eq!(change.action(), "D");
    }

    #[test]
    fn test_svn_standard_properties() {
        use svn_props::*;
        assert!(is_svn_property(LOG));
        assert!(is_svn_property("svn:executable"));
        assert!(!is_svn_property("custom:myprop"));
        assert!(svn_date_now().ends_with('Z'));
    }
}
