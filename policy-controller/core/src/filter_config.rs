use crate::proxy::TypedConfig;
use std::collections::BTreeMap;

/// Per-filter configuration accumulated by the passes that run against one
/// output object (a route, a backend, a virtual host or a route table).
///
/// Keys are filter names, which are unique per plugin. Setting a key that is
/// already present replaces the previous value, so the last pass to write a
/// filter's configuration wins. The map is flushed into the output object once
/// every pass has run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypedFilterConfigMap(BTreeMap<String, TypedConfig>);

// === impl TypedFilterConfigMap ===

impl TypedFilterConfigMap {
    pub fn add_typed_config(&mut self, filter_name: impl ToString, config: TypedConfig) {
        self.0.insert(filter_name.to_string(), config);
    }

    pub fn get_typed_config(&self, filter_name: &str) -> Option<&TypedConfig> {
        self.0.get(filter_name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn flush_into(self, out: &mut BTreeMap<String, TypedConfig>) {
        out.extend(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_write_wins() {
        let mut map = TypedFilterConfigMap::default();
        map.add_typed_config("envoy.filters.http.test", TypedConfig::new("t", json!({"v": 1})));
        map.add_typed_config("envoy.filters.http.test", TypedConfig::new("t", json!({"v": 2})));
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get_typed_config("envoy.filters.http.test"),
            Some(&TypedConfig::new("t", json!({"v": 2})))
        );
    }

    #[test]
    fn flush_replaces_existing_entries() {
        let mut out = BTreeMap::new();
        out.insert("a".to_string(), TypedConfig::new("t", json!({"v": 0})));
        out.insert("b".to_string(), TypedConfig::new("t", json!({"v": 0})));

        let mut map = TypedFilterConfigMap::default();
        map.add_typed_config("a", TypedConfig::new("t", json!({"v": 1})));
        map.flush_into(&mut out);

        assert_eq!(out["a"], TypedConfig::new("t", json!({"v": 1})));
        assert_eq!(out["b"], TypedConfig::new("t", json!({"v": 0})));
    }
}
