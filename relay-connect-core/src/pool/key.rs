use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A connection property value, possibly nested
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Text(String),
    Map(BTreeMap<String, PropertyValue>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<BTreeMap<String, PropertyValue>> for PropertyValue {
    fn from(value: BTreeMap<String, PropertyValue>) -> Self {
        Self::Map(value)
    }
}

impl PropertyValue {
    /// Snapshot a JSON value. Scalars become their textual form.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
            serde_json::Value::Array(items) => Self::Map(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), Self::from_json(v)))
                    .collect(),
            ),
            other => Self::Text(other.to_string()),
        }
    }
}

/// Identity of a reusable connection.
///
/// Two keys are equal when the identifier and every property are equal.
/// Properties are copied into an ordered map at construction so later edits
/// to the source configuration cannot change a key already in a cache. An
/// empty property set and an absent one compare equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    id: Arc<str>,
    properties: Option<Arc<BTreeMap<String, PropertyValue>>>,
}

impl ResourceKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Arc::from(id.into()),
            properties: None,
        }
    }

    pub fn with_properties<K, V, I>(id: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let map: BTreeMap<String, PropertyValue> = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            id: Arc::from(id.into()),
            properties: (!map.is_empty()).then(|| Arc::new(map)),
        }
    }

    /// Snapshot a flat string map
    pub fn from_map(id: impl Into<String>, properties: &HashMap<String, String>) -> Self {
        Self::with_properties(
            id,
            properties.iter().map(|(k, v)| (k.clone(), v.clone())),
        )
    }

    /// Derive a key with a suffix on the identifier and the same properties
    pub fn scoped(&self, scope: &str) -> Self {
        Self {
            id: Arc::from(format!("{}#{}", self.id, scope)),
            properties: self.properties.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.as_ref().and_then(|p| p.get(name))
    }

    pub fn properties(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.properties.iter().flat_map(|p| p.iter())
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceKey")
            .field("id", &self.id)
            .field("properties", &self.properties.as_deref())
            .finish()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &ResourceKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn nested(user: &str) -> ResourceKey {
        let mut auth = BTreeMap::new();
        auth.insert("user".to_string(), PropertyValue::from(user));
        ResourceKey::with_properties(
            "jms://broker",
            vec![
                ("host".to_string(), PropertyValue::from("broker-1")),
                ("auth".to_string(), PropertyValue::Map(auth)),
            ],
        )
    }

    #[test]
    fn test_equality_and_hash() {
        let a = nested("alice");
        let b = nested("alice");
        let c = nested("bob");

        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn test_absent_properties_equal() {
        let a = ResourceKey::new("conn");
        let b = ResourceKey::new("conn");
        let empty = ResourceKey::with_properties("conn", Vec::<(String, String)>::new());

        assert_eq!(a, b);
        assert_eq!(a, empty);
        assert_eq!(hash_of(&a), hash_of(&empty));
        assert_ne!(a, ResourceKey::new("other"));
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let a = ResourceKey::with_properties("conn", vec![("a", "1"), ("b", "2")]);
        let b = ResourceKey::with_properties("conn", vec![("b", "2"), ("a", "1")]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_snapshot_isolated_from_source() {
        let mut source = HashMap::new();
        source.insert("host".to_string(), "broker-1".to_string());
        let key = ResourceKey::from_map("conn", &source);

        source.insert("host".to_string(), "broker-2".to_string());
        assert_eq!(key.property("host"), Some(&PropertyValue::from("broker-1")));
        assert_ne!(key, ResourceKey::from_map("conn", &source));
    }

    #[test]
    fn test_from_json_snapshot() {
        let json = serde_json::json!({"port": 61616, "tls": {"enabled": true}});
        let value = PropertyValue::from_json(&json);
        let key = ResourceKey::with_properties("conn", vec![("cfg", value)]);

        match key.property("cfg") {
            Some(PropertyValue::Map(map)) => {
                assert_eq!(map.get("port"), Some(&PropertyValue::from("61616")));
            }
            other => panic!("unexpected property: {:?}", other),
        }
    }

    #[test]
    fn test_scoped_key() {
        let base = ResourceKey::with_properties("conn", vec![("host", "h")]);
        let scoped = base.scoped("tx:exec-1");
        assert_eq!(scoped.id(), "conn#tx:exec-1");
        assert_eq!(scoped.property("host"), base.property("host"));
        assert_ne!(scoped, base);
    }
}
