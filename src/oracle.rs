//! The live decision oracle behind the emitted shim calls.
//!
//! The Java-side support class resolves the real caller through the platform
//! stack walker and then asks this oracle. Decisions are pure functions of
//! the built rules, memoized per `(caller module, target class, member)`.
//! Weak keying is replaced by explicit lifecycle eviction here: the
//! instrumentation glue calls [`Oracle::evict_module`] when a module's loader
//! goes away.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::rules::{split_internal_name, DenyAction, Rule, Rules, CONSTRUCTOR_NAME};

/// A reflective member as the shim reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub descriptor: String,
}

impl Member {
    pub fn new(name: &str, descriptor: &str) -> Self {
        Member {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }
    }
}

/// Denial of a single-result reflective lookup; surfaces on the Java side as
/// `NoSuchMethodException`.
#[derive(Debug, Error)]
#[error("member {class}.{name}{descriptor} is denied to module {module}")]
pub struct MemberDenied {
    pub module: String,
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Default)]
struct MemberCache {
    members: RwLock<HashMap<(Arc<str>, Arc<str>), bool>>,
}

#[derive(Default)]
struct ModuleCache {
    classes: Mutex<HashMap<Arc<str>, Arc<MemberCache>>>,
}

/// Memoized rule resolution for the runtime helpers.
pub struct Oracle {
    rules: Arc<dyn Rules>,
    modules: Mutex<HashMap<Arc<str>, Arc<ModuleCache>>>,
}

impl Oracle {
    pub fn new(rules: Arc<dyn Rules>) -> Self {
        Oracle {
            rules,
            modules: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, caller_module: &str, target_class: &str, name: &str, desc: &str) -> bool {
        let (package, class) = split_internal_name(target_class);
        let view = self.rules.for_class(caller_module, package, class);
        let rule = if name == CONSTRUCTOR_NAME {
            view.rule_for_constructor(desc)
        } else {
            view.rule_for_method(name, desc)
        };
        !rule.is_deny()
    }

    /// Whether `caller_module` may reach `target_class.name:desc`. Cached;
    /// recomputation is idempotent, so racing writers agree and the first
    /// write wins.
    pub fn is_allowed(
        &self,
        caller_module: &str,
        target_class: &str,
        name: &str,
        desc: &str,
    ) -> bool {
        let module_cache = {
            let mut modules = self.modules.lock();
            match modules.get(caller_module) {
                Some(cache) => Arc::clone(cache),
                None => {
                    let cache = Arc::new(ModuleCache::default());
                    modules.insert(Arc::from(caller_module), Arc::clone(&cache));
                    cache
                }
            }
        };
        let member_cache = {
            let mut classes = module_cache.classes.lock();
            match classes.get(target_class) {
                Some(cache) => Arc::clone(cache),
                None => {
                    let cache = Arc::new(MemberCache::default());
                    classes.insert(Arc::from(target_class), Arc::clone(&cache));
                    cache
                }
            }
        };
        {
            let members = member_cache.members.read();
            if let Some(&decision) = members.get(&(Arc::from(name), Arc::from(desc))) {
                return decision;
            }
        }
        let decision = self.resolve(caller_module, target_class, name, desc);
        let mut members = member_cache.members.write();
        *members
            .entry((Arc::from(name), Arc::from(desc)))
            .or_insert(decision)
    }

    /// Drops every decision cached for a caller module. Called when the
    /// module's loader is discarded.
    pub fn evict_module(&self, caller_module: &str) {
        self.modules.lock().remove(caller_module);
    }

    /// Drops every decision cached against a target class, across modules.
    pub fn evict_class(&self, target_class: &str) {
        let modules: Vec<Arc<ModuleCache>> =
            self.modules.lock().values().map(Arc::clone).collect();
        for module in modules {
            module.classes.lock().remove(target_class);
        }
    }

    /// Single-result accessor contract (`getMethod`, `getConstructor`):
    /// denied lookups fail loudly.
    pub fn check_member(
        &self,
        caller_module: &str,
        target_class: &str,
        member: &Member,
    ) -> Result<(), MemberDenied> {
        if self.is_allowed(caller_module, target_class, &member.name, &member.descriptor) {
            Ok(())
        } else {
            Err(MemberDenied {
                module: caller_module.to_owned(),
                class: target_class.to_owned(),
                name: member.name.clone(),
                descriptor: member.descriptor.clone(),
            })
        }
    }

    /// Array-returning accessor contract (`getMethods`, ...): denied entries
    /// drop out silently, relative order preserved.
    pub fn filter_members(
        &self,
        caller_module: &str,
        target_class: &str,
        members: Vec<Member>,
    ) -> Vec<Member> {
        members
            .into_iter()
            .filter(|m| self.is_allowed(caller_module, target_class, &m.name, &m.descriptor))
            .collect()
    }

    /// `defineClass` passes only when no `ProtectionDomain` was supplied.
    pub fn define_class_allowed(&self, has_protection_domain: bool) -> bool {
        !has_protection_domain
    }

    /// `forName(name, initialize, loader)` passes without initialization or
    /// within the caller's own loader.
    pub fn for_name_allowed(
        &self,
        initialize: bool,
        caller_loader: Option<&str>,
        target_loader: Option<&str>,
    ) -> bool {
        !initialize || caller_loader == target_loader
    }

    /// The multi-action dispatch: consult the denial map against the
    /// receiver's runtime class.
    pub fn receiver_allowed(
        &self,
        caller_module: &str,
        target_class: &str,
        name: &str,
        desc: &str,
        receiver_class: &str,
    ) -> bool {
        let (package, class) = split_internal_name(target_class);
        let view = self.rules.for_class(caller_module, package, class);
        match view.rule_for_method(name, desc) {
            Rule::Deny {
                action: DenyAction::Multi(map),
                ..
            } => !map
                .get(receiver_class)
                .map(Rule::is_deny)
                .unwrap_or(false),
            Rule::Deny { .. } => false,
            Rule::Allow => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rules::builder::RulesBuilder;

    fn oracle() -> Oracle {
        let mut builder = RulesBuilder::new();
        builder
            .for_module("app")
            .for_package("com/db")
            .for_class("Store")
            .deny_method("open");
        Oracle::new(Arc::new(builder.build().unwrap()))
    }

    #[test]
    fn decisions_are_cached_and_pure() {
        let oracle = oracle();
        for _ in 0..3 {
            assert!(!oracle.is_allowed("app", "com/db/Store", "open", "()V"));
            assert!(oracle.is_allowed("app", "com/db/Store", "read", "()I"));
            assert!(oracle.is_allowed("other", "com/db/Store", "open", "()V"));
        }
    }

    #[test]
    fn eviction_degrades_to_recomputation() {
        let oracle = oracle();
        assert!(!oracle.is_allowed("app", "com/db/Store", "open", "()V"));
        oracle.evict_module("app");
        assert!(!oracle.is_allowed("app", "com/db/Store", "open", "()V"));
        oracle.evict_class("com/db/Store");
        assert!(!oracle.is_allowed("app", "com/db/Store", "open", "()V"));
    }

    #[test]
    fn member_filtering_preserves_order() {
        let oracle = oracle();
        let members = vec![
            Member::new("open", "()V"),
            Member::new("read", "()I"),
            Member::new("close", "()V"),
        ];
        let filtered = oracle.filter_members("app", "com/db/Store", members);
        assert_eq!(
            filtered,
            vec![Member::new("read", "()I"), Member::new("close", "()V")]
        );
    }

    #[test]
    fn single_lookup_fails_loudly() {
        let oracle = oracle();
        assert!(oracle
            .check_member("app", "com/db/Store", &Member::new("open", "()V"))
            .is_err());
        assert!(oracle
            .check_member("app", "com/db/Store", &Member::new("close", "()V"))
            .is_ok());
    }

    #[test]
    fn define_class_and_for_name_predicates() {
        let oracle = oracle();
        assert!(oracle.define_class_allowed(false));
        assert!(!oracle.define_class_allowed(true));
        assert!(oracle.for_name_allowed(false, Some("a"), Some("b")));
        assert!(oracle.for_name_allowed(true, Some("a"), Some("a")));
        assert!(!oracle.for_name_allowed(true, Some("a"), Some("b")));
    }

    #[test]
    fn concurrent_lookups_agree() {
        let oracle = Arc::new(oracle());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let oracle = Arc::clone(&oracle);
                std::thread::spawn(move || {
                    oracle.is_allowed("app", "com/db/Store", "open", "()V")
                })
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }
    }
}
