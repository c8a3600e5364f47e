//! Fluent, scope-nested construction of a [`RuleSet`].
//!
//! Cursors narrow from module to package to class to method; each scope owns
//! its path, so cursors can be stored across statements. Settings follow
//! earliest-wins: applying a rule where one already exists keeps the first,
//! and adding a rule never removes another. All validation happens in
//! [`RulesBuilder::build`], never at transform time.

use std::sync::Arc;

use super::{
    ClassNode, DenyAction, EnforceSite, MethodNode, Rule, RuleSet, CONSTRUCTOR_NAME,
};
use crate::errors::RuleError;

/// A preset that knows how to contribute rules to a builder.
pub trait RulesApplier {
    fn apply_rules_to(&self, builder: &mut RulesBuilder);
}

/// Mutable construction state for one [`RuleSet`].
#[derive(Default)]
pub struct RulesBuilder {
    set: RuleSet,
    errors: Vec<RuleError>,
}

impl RulesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes the rules that follow to invocations issued by `module`.
    pub fn for_module(&mut self, module: &str) -> ModuleScope<'_> {
        if module.is_empty() {
            self.errors.push(RuleError::EmptyScopeName);
        }
        ModuleScope {
            builder: self,
            module: module.into(),
        }
    }

    pub fn apply(&mut self, applier: &dyn RulesApplier) -> &mut Self {
        applier.apply_rules_to(self);
        self
    }

    /// Validates every recorded action and produces the immutable set.
    pub fn build(mut self) -> Result<RuleSet, RuleError> {
        if let Some(error) = self.errors.drain(..).next() {
            return Err(error);
        }
        for module in self.set.modules.values() {
            validate_rule(module.default.as_ref())?;
            for package in module.packages.values() {
                validate_rule(package.default.as_ref())?;
                for class in package.classes.values() {
                    validate_rule(class.default.as_ref())?;
                    for method in class.methods.values() {
                        validate_rule(method.default.as_ref())?;
                        for (prefix, rule) in &method.variants {
                            if !prefix.starts_with('(') {
                                return Err(RuleError::BadDescriptor(prefix.to_string()));
                            }
                            validate_rule(Some(rule))?;
                        }
                    }
                }
            }
        }
        Ok(self.set)
    }
}

fn validate_rule(rule: Option<&Rule>) -> Result<(), RuleError> {
    if let Some(Rule::Deny { action, .. }) = rule {
        action.validate()?;
    }
    Ok(())
}

/// Cursor scoped to one caller module.
pub struct ModuleScope<'a> {
    builder: &'a mut RulesBuilder,
    module: Arc<str>,
}

impl<'a> ModuleScope<'a> {
    fn node(&mut self) -> &mut super::ModuleNode {
        self.builder
            .set
            .modules
            .entry(self.module.clone())
            .or_default()
    }

    /// Denies everything for this module unless a narrower rule allows it.
    pub fn deny_all(&mut self, action: DenyAction) -> &mut Self {
        let node = self.node();
        node.default.get_or_insert(Rule::deny(action));
        self
    }

    pub fn allow_all(&mut self) -> &mut Self {
        let node = self.node();
        node.default.get_or_insert(Rule::Allow);
        self
    }

    pub fn for_package(self, package: &str) -> PackageScope<'a> {
        if package.is_empty() {
            self.builder.errors.push(RuleError::EmptyScopeName);
        }
        PackageScope {
            module: self.module,
            package: package.into(),
            builder: self.builder,
        }
    }
}

/// Cursor scoped to one target package (internal `/` form).
pub struct PackageScope<'a> {
    builder: &'a mut RulesBuilder,
    module: Arc<str>,
    package: Arc<str>,
}

impl<'a> PackageScope<'a> {
    fn node(&mut self) -> &mut super::PackageNode {
        self.builder
            .set
            .modules
            .entry(self.module.clone())
            .or_default()
            .packages
            .entry(self.package.clone())
            .or_default()
    }

    pub fn deny_all(&mut self, action: DenyAction) -> &mut Self {
        self.node().default.get_or_insert(Rule::deny(action));
        self
    }

    pub fn allow_all(&mut self) -> &mut Self {
        self.node().default.get_or_insert(Rule::Allow);
        self
    }

    pub fn for_class(self, class: &str) -> ClassScope<'a> {
        if class.is_empty() {
            self.builder.errors.push(RuleError::EmptyScopeName);
        }
        ClassScope {
            module: self.module,
            package: self.package,
            class: class.into(),
            builder: self.builder,
        }
    }
}

/// Cursor scoped to one target class (simple name).
pub struct ClassScope<'a> {
    builder: &'a mut RulesBuilder,
    module: Arc<str>,
    package: Arc<str>,
    class: Arc<str>,
}

impl<'a> ClassScope<'a> {
    fn node(&mut self) -> &mut ClassNode {
        self.builder
            .set
            .modules
            .entry(self.module.clone())
            .or_default()
            .packages
            .entry(self.package.clone())
            .or_default()
            .classes
            .entry(self.class.clone())
            .or_default()
    }

    /// Denies every member of the class with the standard action.
    pub fn deny_all_methods(&mut self) -> &mut Self {
        self.node().default.get_or_insert(Rule::deny(DenyAction::standard()));
        self
    }

    pub fn allow_all_methods(&mut self) -> &mut Self {
        self.node().default.get_or_insert(Rule::Allow);
        self
    }

    /// A denied class permits subclassing unless this is set.
    pub fn deny_subclassing(&mut self) -> &mut Self {
        self.node().deny_subclassing = true;
        self
    }

    pub fn allow_method(&mut self, name: &str) -> &mut Self {
        self.method_node(name).default.get_or_insert(Rule::Allow);
        self
    }

    /// Denies a named method with the standard action; refine through the
    /// returned scope.
    pub fn deny_method(&mut self, name: &str) -> MethodScope<'_> {
        self.deny_member(name.into())
    }

    /// Denies every constructor; refine through the returned scope.
    pub fn deny_all_constructors(&mut self) -> MethodScope<'_> {
        self.deny_member(CONSTRUCTOR_NAME.into())
    }

    pub fn deny_constructor(&mut self, descriptor: &str) -> &mut Self {
        let rule = Rule::deny(DenyAction::standard());
        self.add_variant(CONSTRUCTOR_NAME.into(), descriptor, rule);
        self
    }

    pub fn allow_constructor(&mut self, descriptor: &str) -> &mut Self {
        self.add_variant(CONSTRUCTOR_NAME.into(), descriptor, Rule::Allow);
        self
    }

    fn method_node(&mut self, name: &str) -> &mut MethodNode {
        self.node().methods.entry(name.into()).or_default()
    }

    fn add_variant(&mut self, name: Arc<str>, descriptor: &str, rule: Rule) {
        let node = self.node().methods.entry(name).or_default();
        if !node.variants.iter().any(|(prefix, _)| **prefix == *descriptor) {
            node.variants.push((descriptor.into(), rule));
        }
    }

    fn deny_member(&mut self, name: Arc<str>) -> MethodScope<'_> {
        let owned = {
            let node = self.method_node(&name);
            let owned = node.default.is_none();
            if owned {
                node.default = Some(Rule::deny(DenyAction::standard()));
            }
            owned
        };
        MethodScope {
            module: self.module.clone(),
            package: self.package.clone(),
            class: self.class.clone(),
            name,
            action: DenyAction::standard(),
            site: EnforceSite::Caller,
            owned,
            builder: &mut *self.builder,
        }
    }
}

/// Cursor scoped to one denied method; refines the action, the enforcement
/// site, and per-variant exceptions.
pub struct MethodScope<'a> {
    builder: &'a mut RulesBuilder,
    module: Arc<str>,
    package: Arc<str>,
    class: Arc<str>,
    name: Arc<str>,
    action: DenyAction,
    site: EnforceSite,
    owned: bool,
}

impl MethodScope<'_> {
    fn node(&mut self) -> &mut MethodNode {
        self.builder
            .set
            .modules
            .entry(self.module.clone())
            .or_default()
            .packages
            .entry(self.package.clone())
            .or_default()
            .classes
            .entry(self.class.clone())
            .or_default()
            .methods
            .entry(self.name.clone())
            .or_default()
    }

    fn store_default(&mut self) {
        if self.owned {
            let rule = Rule::Deny {
                action: self.action.clone(),
                site: self.site,
            };
            self.node().default = Some(rule);
        }
    }

    /// Replaces the standard action for this application of the rule. Has no
    /// effect on an earlier application (earliest wins).
    pub fn with_action(&mut self, action: DenyAction) -> &mut Self {
        self.action = action;
        self.store_default();
        self
    }

    /// Enforce in the target's own method body instead of at call sites.
    pub fn at_target(&mut self) -> &mut Self {
        self.site = EnforceSite::Target;
        self.store_default();
        self
    }

    /// Exempts one overload (or a descriptor prefix) from the denial.
    pub fn allow_variant(&mut self, descriptor: &str) -> &mut Self {
        self.add_variant(descriptor, Rule::Allow);
        self
    }

    /// Denies one overload with this scope's action even when the method
    /// default came from an earlier application.
    pub fn deny_variant(&mut self, descriptor: &str) -> &mut Self {
        let rule = Rule::Deny {
            action: self.action.clone(),
            site: self.site,
        };
        self.add_variant(descriptor, rule);
        self
    }

    /// Denies one overload with its own action, leaving the method default
    /// untouched.
    pub fn deny_variant_with(&mut self, descriptor: &str, action: DenyAction) -> &mut Self {
        let site = self.site;
        self.add_variant(descriptor, Rule::Deny { action, site });
        self
    }

    fn add_variant(&mut self, descriptor: &str, rule: Rule) {
        let node = self.node();
        if !node.variants.iter().any(|(prefix, _)| **prefix == *descriptor) {
            node.variants.push((descriptor.into(), rule));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rules::{ConstValue, MethodRef, Rules};

    #[test]
    fn earliest_application_wins() {
        let mut builder = RulesBuilder::new();
        builder
            .for_module("app")
            .for_package("java/lang")
            .for_class("System")
            .deny_method("exit")
            .with_action(DenyAction::exception("java/lang/IllegalStateException"));
        builder
            .for_module("app")
            .for_package("java/lang")
            .for_class("System")
            .deny_method("exit")
            .with_action(DenyAction::Value(ConstValue::Null));
        let rules = builder.build().unwrap();
        let view = rules.for_class("app", "java/lang", "System");
        match view.rule_for_method("exit", "(I)V") {
            Rule::Deny { action, .. } => assert_eq!(
                action,
                DenyAction::exception("java/lang/IllegalStateException")
            ),
            rule => panic!("expected denial, got {rule:?}"),
        }
    }

    #[test]
    fn scope_defaults_nest() {
        let mut builder = RulesBuilder::new();
        {
            let mut package = builder.for_module("app").for_package("java/io");
            package.deny_all(DenyAction::standard());
            package.for_class("Console").allow_all_methods();
        }
        let rules = builder.build().unwrap();
        assert!(rules
            .for_class("app", "java/io", "File")
            .rule_for_method("delete", "()Z")
            .is_deny());
        assert_eq!(
            rules
                .for_class("app", "java/io", "Console")
                .rule_for_method("readLine", "()Ljava/lang/String;"),
            Rule::Allow
        );
    }

    #[test]
    fn constructor_variants() {
        let mut builder = RulesBuilder::new();
        {
            let mut class = builder
                .for_module("app")
                .for_package("java/io")
                .for_class("FileOutputStream");
            let mut ctors = class.deny_all_constructors();
            ctors.allow_variant("(Ljava/io/FileDescriptor;)V");
        }
        let rules = builder.build().unwrap();
        let view = rules.for_class("app", "java/io", "FileOutputStream");
        assert!(view
            .rule_for_constructor("(Ljava/lang/String;)V")
            .is_deny());
        assert_eq!(
            view.rule_for_constructor("(Ljava/io/FileDescriptor;)V"),
            Rule::Allow
        );
    }

    #[test]
    fn build_rejects_bad_predicates() {
        let mut builder = RulesBuilder::new();
        builder
            .for_module("app")
            .for_package("java/lang")
            .for_class("System")
            .deny_method("loadLibrary")
            .with_action(DenyAction::checked(
                MethodRef::new_static("s/Shim", "nativeAccess", "(I)Z"),
                DenyAction::standard(),
            ));
        assert!(matches!(
            builder.build(),
            Err(RuleError::BadPredicate(_))
        ));
    }

    #[test]
    fn empty_scope_names_fail_build() {
        let mut builder = RulesBuilder::new();
        builder.for_module("");
        assert!(matches!(builder.build(), Err(RuleError::EmptyScopeName)));
    }

    #[test]
    fn applier_contributes_rules() {
        struct DenyExit;
        impl RulesApplier for DenyExit {
            fn apply_rules_to(&self, builder: &mut RulesBuilder) {
                builder
                    .for_module("app")
                    .for_package("java/lang")
                    .for_class("System")
                    .deny_method("exit");
            }
        }
        let mut builder = RulesBuilder::new();
        builder.apply(&DenyExit);
        let rules = builder.build().unwrap();
        assert!(rules
            .for_class("app", "java/lang", "System")
            .rule_for_method("exit", "(I)V")
            .is_deny());
    }
}
