//! Per-module filtered system properties.
//!
//! Each caller module observes its own `Properties` view, materialized
//! lazily from a snapshot of the real properties filtered through a fixed
//! allow-list of non-sensitive keys. Writes touch only the view; the real
//! properties and other modules never observe them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Keys every module may read. Everything else is absent from the view.
pub static ALLOWED_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "java.version",
        "java.vendor",
        "java.specification.version",
        "os.name",
        "os.arch",
        "os.version",
        "file.separator",
        "path.separator",
        "line.separator",
        "native.encoding",
        "stdout.encoding",
        "stderr.encoding",
        "user.language",
    ]
    .into_iter()
    .collect()
});

type View = Arc<Mutex<HashMap<String, String>>>;

/// The property views, one per caller module, behind a single monitor for
/// the lookup.
pub struct FilteredProperties {
    base: HashMap<String, String>,
    views: Mutex<HashMap<Arc<str>, View>>,
}

impl FilteredProperties {
    /// `base` is the snapshot of the real system properties taken at agent
    /// start.
    pub fn new(base: HashMap<String, String>) -> Self {
        FilteredProperties {
            base,
            views: Mutex::new(HashMap::new()),
        }
    }

    fn view(&self, module: &str) -> View {
        let mut views = self.views.lock();
        match views.get(module) {
            Some(view) => Arc::clone(view),
            None => {
                let filtered: HashMap<String, String> = self
                    .base
                    .iter()
                    .filter(|(key, _)| ALLOWED_KEYS.contains(key.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let view: View = Arc::new(Mutex::new(filtered));
                views.insert(Arc::from(module), Arc::clone(&view));
                view
            }
        }
    }

    pub fn get_property(&self, module: &str, key: &str) -> Option<String> {
        self.view(module).lock().get(key).cloned()
    }

    /// Returns the previous value in this module's view, like
    /// `Properties.setProperty`.
    pub fn set_property(&self, module: &str, key: &str, value: &str) -> Option<String> {
        self.view(module)
            .lock()
            .insert(key.to_owned(), value.to_owned())
    }

    pub fn clear_property(&self, module: &str, key: &str) -> Option<String> {
        self.view(module).lock().remove(key)
    }

    /// A copy of the module's whole view, for `getProperties`.
    pub fn properties(&self, module: &str) -> HashMap<String, String> {
        self.view(module).lock().clone()
    }

    /// Replaces the module's view wholesale, for `setProperties`.
    pub fn set_properties(&self, module: &str, replacement: HashMap<String, String>) {
        *self.view(module).lock() = replacement;
    }

    /// Module lifecycle callback; the view is rebuilt on next access.
    pub fn evict_module(&self, module: &str) {
        self.views.lock().remove(module);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn props() -> FilteredProperties {
        let mut base = HashMap::new();
        base.insert("java.version".to_owned(), "21".to_owned());
        base.insert("os.name".to_owned(), "Linux".to_owned());
        base.insert("user.home".to_owned(), "/root".to_owned());
        base.insert("java.class.path".to_owned(), "/secret.jar".to_owned());
        FilteredProperties::new(base)
    }

    #[test]
    fn sensitive_keys_are_invisible(){
        let props = props();
        assert_eq!(props.get_property("app", "java.version").as_deref(), Some("21"));
        assert_eq!(props.get_property("app", "os.name").as_deref(), Some("Linux"));
        assert_eq!(props.get_property("app", "user.home"), None);
        assert_eq!(props.get_property("app", "java.class.path"), None);
    }

    #[test]
    fn writes_stay_in_the_callers_view() {
        let props = props();
        assert_eq!(props.set_property("a", "k", "one"), None);
        props.set_property("b", "k", "two");
        assert_eq!(props.get_property("a", "k").as_deref(), Some("one"));
        assert_eq!(props.get_property("b", "k").as_deref(), Some("two"));
        // the base snapshot is untouched
        assert_eq!(props.base.get("k"), None);
    }

    #[test]
    fn clear_only_affects_one_view() {
        let props = props();
        props.set_property("a", "os.name", "Plan9");
        assert_eq!(props.clear_property("a", "os.name").as_deref(), Some("Plan9"));
        assert_eq!(props.get_property("b", "os.name").as_deref(), Some("Linux"));
    }

    #[test]
    fn eviction_rebuilds_a_fresh_view() {
        let props = props();
        props.set_property("a", "os.name", "Plan9");
        props.evict_module("a");
        assert_eq!(props.get_property("a", "os.name").as_deref(), Some("Linux"));
    }
}
