//! Name → handler registries
//!
//! Two registries share this shape: lowering handlers keyed by canonical
//! operator name, and canonicalization rewrites keyed by framework operator
//! kind. Registration is first-writer-wins.

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Registry mapping operator names to shared handlers
pub struct HandlerRegistry<H: ?Sized> {
    /// Label used in log messages ("lowering", "rewrite")
    kind: &'static str,
    handlers: FxHashMap<String, Arc<H>>,
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: FxHashMap::default(),
        }
    }

    /// Register `handler` under `name`
    ///
    /// Returns `false` and keeps the existing handler when `name` is taken.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<H>) -> bool {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            warn!(
                registry = self.kind,
                name = %name,
                "handler already registered, keeping the first one"
            );
            return false;
        }
        self.handlers.insert(name, handler);
        true
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<H: ?Sized> fmt::Debug for HandlerRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Tag: Send + Sync {
        fn tag(&self) -> u32;
    }

    struct Fixed(u32);

    impl Tag for Fixed {
        fn tag(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry: HandlerRegistry<dyn Tag> = HandlerRegistry::new("test");
        assert!(registry.register("Relu", Arc::new(Fixed(1))));
        assert!(!registry.register("Relu", Arc::new(Fixed(2))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("Relu").unwrap().tag(), 1);
    }

    #[test]
    fn test_lookup_and_names() {
        let mut registry: HandlerRegistry<dyn Tag> = HandlerRegistry::new("test");
        registry.register("Tanh", Arc::new(Fixed(1)));
        registry.register("Add", Arc::new(Fixed(2)));
        assert!(registry.lookup("Conv").is_none());
        assert!(registry.contains("Add"));
        assert_eq!(registry.names(), vec!["Add", "Tanh"]);
    }

    mod property_based_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_registry_holds_one_handler_per_name(
                names in proptest::collection::vec("[a-c]{1,2}", 1..40)
            ) {
                let mut registry: HandlerRegistry<dyn Tag> = HandlerRegistry::new("prop");
                let mut first: FxHashMap<String, u32> = FxHashMap::default();
                for (i, name) in names.iter().enumerate() {
                    let inserted = registry.register(name.clone(), Arc::new(Fixed(i as u32)));
                    prop_assert_eq!(inserted, !first.contains_key(name));
                    first.entry(name.clone()).or_insert(i as u32);
                }
                prop_assert_eq!(registry.len(), first.len());
                for (name, tag) in &first {
                    prop_assert_eq!(registry.lookup(name).unwrap().tag(), *tag);
                }
            }
        }
    }
}
