//! The rule model: what is denied, where the denial is enforced, and what the
//! denial does instead of the original operation.
//!
//! Rules are built once through [`builder::RulesBuilder`], validated, and are
//! immutable afterwards; every lookup is pure. A [`RuleSet`] answers for one
//! configured caller module at a time; the any-caller projection used for
//! target-side enforcement and the multi-source [`MergedRules`] both combine
//! per-module answers with deny-wins semantics.

pub mod builder;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use jclass::desc::{FieldType, MethodDescriptor, PrimitiveType, ReturnType};

use crate::errors::RuleError;

/// Synthetic method name constructors are keyed under.
pub const CONSTRUCTOR_NAME: &str = "<init>";

/// Splits an internal class name into `(package, simple name)`, both with
/// `/` separators.
pub fn split_internal_name(internal: &str) -> (&str, &str) {
    match internal.rfind('/') {
        Some(at) => (&internal[..at], &internal[at + 1..]),
        None => ("", internal),
    }
}

/// A compile-time constant a denied call can produce instead of running.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Null,
    Bool(bool),
    Char(u16),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(Arc<str>),
}

/// How an emitted call site dispatches to a referenced method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    Static,
    Virtual,
    Special,
    Interface,
}

/// A `(owner, name, descriptor, kind)` quadruple naming a concrete method,
/// the shape the rewriter turns into a pool entry on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub owner: Arc<str>,
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
    pub kind: DispatchKind,
}

impl MethodRef {
    pub fn new_static(owner: &str, name: &str, descriptor: &str) -> Self {
        MethodRef {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
            kind: DispatchKind::Static,
        }
    }

    pub(crate) fn parsed_descriptor(&self) -> Result<MethodDescriptor, RuleError> {
        self.descriptor
            .parse()
            .map_err(|_| RuleError::BadDescriptor(self.descriptor.to_string()))
    }
}

/// What replaces a denied operation. A closed set; every variant has a fixed
/// emission contract in the rewriter.
#[derive(Debug, Clone, PartialEq)]
pub enum DenyAction {
    /// Throw a new instance of `class_name`, optionally with a message.
    Exception {
        class_name: Arc<str>,
        message: Option<Arc<str>>,
    },
    /// Produce a constant instead of calling.
    Value(ConstValue),
    /// Produce an empty container of the declared return type.
    Empty,
    /// Call a static replacement method instead.
    Custom(MethodRef),
    /// Ask a boolean predicate at run time; on `false`, apply `inner`.
    Checked {
        predicate: MethodRef,
        inner: Box<DenyAction>,
    },
    /// Per-runtime-class denial map, consulted against the receiver's class.
    Multi(BTreeMap<Arc<str>, Rule>),
    /// Resolved against the caller module at invocation time via the oracle.
    Dynamic,
    /// [`DenyAction::Dynamic`], where at least one merged source was checked.
    CheckedDynamic,
}

impl DenyAction {
    /// The default action: throw `java.lang.SecurityException` with no
    /// message.
    pub fn standard() -> Self {
        DenyAction::Exception {
            class_name: "java/lang/SecurityException".into(),
            message: None,
        }
    }

    pub fn exception(class_name: &str) -> Self {
        DenyAction::Exception {
            class_name: class_name.into(),
            message: None,
        }
    }

    pub fn exception_with_message(class_name: &str, message: &str) -> Self {
        DenyAction::Exception {
            class_name: class_name.into(),
            message: Some(message.into()),
        }
    }

    pub fn checked(predicate: MethodRef, inner: DenyAction) -> Self {
        DenyAction::Checked {
            predicate,
            inner: Box::new(inner),
        }
    }

    fn is_checked(&self) -> bool {
        matches!(self, DenyAction::Checked { .. } | DenyAction::CheckedDynamic)
    }

    /// Structural validation, run by `build()`. Checked actions must not nest
    /// and predicates must return `boolean` taking nothing or a caller class.
    pub fn validate(&self) -> Result<(), RuleError> {
        match self {
            DenyAction::Exception { class_name, .. } => {
                if class_name.is_empty() {
                    return Err(RuleError::BadMethodRef(class_name.to_string()));
                }
                Ok(())
            }
            DenyAction::Value(_) | DenyAction::Empty | DenyAction::Dynamic
            | DenyAction::CheckedDynamic => Ok(()),
            DenyAction::Custom(target) => {
                if target.owner.is_empty() || target.name.is_empty() {
                    return Err(RuleError::BadMethodRef(format!(
                        "{}.{}",
                        target.owner, target.name
                    )));
                }
                target.parsed_descriptor().map(|_| ())
            }
            DenyAction::Checked { predicate, inner } => {
                let desc = predicate.parsed_descriptor()?;
                let boolean_return = matches!(
                    desc.return_type,
                    ReturnType::Value(FieldType::Base(PrimitiveType::Boolean))
                );
                let callable = desc.parameters.is_empty()
                    || (desc.parameters.len() == 1
                        && desc.parameters[0] == FieldType::Object("java/lang/Class".into()));
                if !boolean_return || !callable {
                    return Err(RuleError::BadPredicate(format!(
                        "{}.{}{}",
                        predicate.owner, predicate.name, predicate.descriptor
                    )));
                }
                if inner.is_checked() {
                    return Err(RuleError::CheckedInsideChecked);
                }
                inner.validate()
            }
            DenyAction::Multi(map) => {
                for rule in map.values() {
                    if let Rule::Deny { action, .. } = rule {
                        action.validate()?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Where enforcement bytecode lands for a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforceSite {
    /// Rewrite the invocation instruction in the calling class.
    Caller,
    /// Inject a prologue into the target's own declared method.
    Target,
}

/// The outcome of rule resolution for one member.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Allow,
    Deny { action: DenyAction, site: EnforceSite },
}

impl Rule {
    pub fn deny(action: DenyAction) -> Self {
        Rule::Deny {
            action,
            site: EnforceSite::Caller,
        }
    }

    pub fn deny_at_target(action: DenyAction) -> Self {
        Rule::Deny {
            action,
            site: EnforceSite::Target,
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Rule::Deny { .. })
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct MethodNode {
    pub(crate) default: Option<Rule>,
    /// `(descriptor prefix, rule)`; the longest matching prefix wins.
    pub(crate) variants: Vec<(Arc<str>, Rule)>,
}

impl MethodNode {
    fn resolve(&self, descriptor: &str) -> Option<&Rule> {
        self.variants
            .iter()
            .filter(|(prefix, _)| descriptor.starts_with(&**prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, rule)| rule)
            .or(self.default.as_ref())
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ClassNode {
    pub(crate) default: Option<Rule>,
    pub(crate) methods: HashMap<Arc<str>, MethodNode>,
    pub(crate) deny_subclassing: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct PackageNode {
    pub(crate) default: Option<Rule>,
    pub(crate) classes: HashMap<Arc<str>, ClassNode>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ModuleNode {
    pub(crate) default: Option<Rule>,
    pub(crate) packages: HashMap<Arc<str>, PackageNode>,
}

/// One candidate answer for a class, from one module projection.
#[derive(Debug, Clone)]
struct Candidate<'a> {
    default: &'a Rule,
    class: Option<&'a ClassNode>,
}

impl<'a> Candidate<'a> {
    fn rule_for(&self, name: &str, descriptor: &str) -> &'a Rule {
        if let Some(class) = self.class {
            if let Some(method) = class.methods.get(name) {
                if let Some(rule) = method.resolve(descriptor) {
                    return rule;
                }
            }
            if let Some(default) = class.default.as_ref() {
                return default;
            }
        }
        self.default
    }
}

/// The per-class resolution view handed to the rewriter and the oracle.
///
/// `covers_all_callers` marks the any-caller projection: there an allowing
/// module projection forces conflicting denials to the runtime oracle, while
/// in a caller-specific multi-source view an all-allow source is neutral
/// (merging with the empty set is identity).
pub struct ForClass<'a> {
    candidates: Vec<Candidate<'a>>,
    covers_all_callers: bool,
}

impl ForClass<'_> {
    /// Resolves one member. Multiple candidates combine with deny-wins.
    pub fn rule_for_method(&self, name: &str, descriptor: &str) -> Rule {
        merge_rules(
            self.candidates
                .iter()
                .map(|c| c.rule_for(name, descriptor)),
            self.covers_all_callers,
        )
    }

    /// Constructors never produce values, so `Value` and `Empty` denials
    /// degrade to the standard exception.
    pub fn rule_for_constructor(&self, descriptor: &str) -> Rule {
        match self.rule_for_method(CONSTRUCTOR_NAME, descriptor) {
            Rule::Deny { action, site } => Rule::Deny {
                action: match action {
                    DenyAction::Value(_) | DenyAction::Empty => DenyAction::standard(),
                    DenyAction::Checked { predicate, inner } => match *inner {
                        DenyAction::Value(_) | DenyAction::Empty => DenyAction::Checked {
                            predicate,
                            inner: Box::new(DenyAction::standard()),
                        },
                        inner => DenyAction::Checked {
                            predicate,
                            inner: Box::new(inner),
                        },
                    },
                    other => other,
                },
                site,
            },
            rule => rule,
        }
    }

    /// Whether anything at all is denied for this class; a `false` lets the
    /// transformer skip the per-method scan.
    pub fn is_any_denied(&self) -> bool {
        self.candidates.iter().any(|c| {
            c.default.is_deny()
                || c.class.is_some_and(|class| {
                    class.default.as_ref().is_some_and(Rule::is_deny)
                        || class.methods.values().any(|m| {
                            m.default.as_ref().is_some_and(Rule::is_deny)
                                || m.variants.iter().any(|(_, r)| r.is_deny())
                        })
                })
        })
    }

    /// A denied class still permits subclassing unless explicitly overridden.
    pub fn allows_subclassing(&self) -> bool {
        !self
            .candidates
            .iter()
            .any(|c| c.class.is_some_and(|class| class.deny_subclassing))
    }
}

/// Deny-wins combination: all-allow stays allow; deniers that agree keep
/// their action; conflicting deniers resolve at invocation time through the
/// oracle, keeping checkedness. With `allow_forces_dynamic` (the any-caller
/// projection), an allowing projection counts as a conflict too: a uniform
/// prologue would otherwise deny callers the rules allow.
fn merge_rules<'a>(
    rules: impl Iterator<Item = &'a Rule>,
    allow_forces_dynamic: bool,
) -> Rule {
    let mut merged: Option<(DenyAction, EnforceSite)> = None;
    let mut mixed_action = false;
    let mut mixed_site = false;
    let mut saw_allow = false;
    let mut saw_checked = false;
    for rule in rules {
        match rule {
            Rule::Allow => saw_allow = true,
            Rule::Deny { action, site } => {
                saw_checked |= action.is_checked();
                match &merged {
                    None => merged = Some((action.clone(), *site)),
                    Some((prev_action, prev_site)) => {
                        mixed_action |= prev_action != action;
                        mixed_site |= prev_site != site;
                    }
                }
            }
        }
    }
    let Some((action, site)) = merged else {
        return Rule::Allow;
    };
    // Disagreeing sites fall back to the cheaper caller-side rewrite.
    let site = if mixed_site { EnforceSite::Caller } else { site };
    if !mixed_action && !(saw_allow && allow_forces_dynamic) {
        return Rule::Deny { action, site };
    }
    Rule::Deny {
        action: if saw_checked {
            DenyAction::CheckedDynamic
        } else {
            DenyAction::Dynamic
        },
        site,
    }
}

/// The resolution interface: one concrete implementation per rule source
/// shape.
pub trait Rules: Send + Sync {
    /// The view for invocations issued from `caller_module` against
    /// `package/class`.
    fn for_class(&self, caller_module: &str, package: &str, class: &str) -> ForClass<'_>;

    /// The merged view covering every configured caller module, used for
    /// target-side enforcement.
    fn for_any_caller(&self, package: &str, class: &str) -> ForClass<'_>;

    /// The caller modules this source configures.
    fn modules(&self) -> Vec<Arc<str>>;
}

/// A single built rule set; immutable.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub(crate) modules: HashMap<Arc<str>, ModuleNode>,
}

static ALLOW: Rule = Rule::Allow;

impl RuleSet {
    fn candidate<'a>(
        node: &'a ModuleNode,
        package: &str,
        class: &str,
    ) -> Candidate<'a> {
        let package_node = node.packages.get(package);
        let class_node = package_node.and_then(|p| p.classes.get(class));
        let default = class_node
            .and_then(|c| c.default.as_ref())
            .or_else(|| package_node.and_then(|p| p.default.as_ref()))
            .or(node.default.as_ref())
            .unwrap_or(&ALLOW);
        Candidate {
            default,
            class: class_node,
        }
    }
}

impl Rules for RuleSet {
    fn for_class(&self, caller_module: &str, package: &str, class: &str) -> ForClass<'_> {
        let candidates = match self.modules.get(caller_module) {
            Some(node) => vec![Self::candidate(node, package, class)],
            // Unconfigured caller modules are not under enforcement.
            None => vec![Candidate {
                default: &ALLOW,
                class: None,
            }],
        };
        ForClass {
            candidates,
            covers_all_callers: false,
        }
    }

    fn for_any_caller(&self, package: &str, class: &str) -> ForClass<'_> {
        ForClass {
            candidates: self
                .modules
                .values()
                .map(|node| Self::candidate(node, package, class))
                .collect(),
            covers_all_callers: true,
        }
    }

    fn modules(&self) -> Vec<Arc<str>> {
        self.modules.keys().cloned().collect()
    }
}

/// Several rule sets acting together; lookups delegate to every source and
/// combine with the same deny-wins policy.
pub struct MergedRules {
    sources: Vec<Arc<RuleSet>>,
}

impl MergedRules {
    pub fn new(sources: Vec<Arc<RuleSet>>) -> Self {
        MergedRules { sources }
    }
}

impl Rules for MergedRules {
    fn for_class(&self, caller_module: &str, package: &str, class: &str) -> ForClass<'_> {
        ForClass {
            candidates: self
                .sources
                .iter()
                .flat_map(|s| s.for_class(caller_module, package, class).candidates)
                .collect(),
            covers_all_callers: false,
        }
    }

    fn for_any_caller(&self, package: &str, class: &str) -> ForClass<'_> {
        ForClass {
            candidates: self
                .sources
                .iter()
                .flat_map(|s| s.for_any_caller(package, class).candidates)
                .collect(),
            covers_all_callers: true,
        }
    }

    fn modules(&self) -> Vec<Arc<str>> {
        let mut all: Vec<Arc<str>> = self
            .sources
            .iter()
            .flat_map(|s| s.modules())
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

#[cfg(test)]
mod test {
    use super::builder::RulesBuilder;
    use super::*;

    fn deny_exit_rules() -> RuleSet {
        let mut builder = RulesBuilder::new();
        builder
            .for_module("app")
            .for_package("java/lang")
            .for_class("System")
            .deny_method("exit");
        builder.build().unwrap()
    }

    #[test]
    fn resolution_walks_longest_path() {
        let rules = deny_exit_rules();
        let view = rules.for_class("app", "java/lang", "System");
        assert!(view.rule_for_method("exit", "(I)V").is_deny());
        assert_eq!(view.rule_for_method("nanoTime", "()J"), Rule::Allow);
        let other = rules.for_class("app", "java/io", "File");
        assert_eq!(other.rule_for_method("delete", "()Z"), Rule::Allow);
    }

    #[test]
    fn unknown_caller_module_is_not_enforced() {
        let rules = deny_exit_rules();
        let view = rules.for_class("other", "java/lang", "System");
        assert_eq!(view.rule_for_method("exit", "(I)V"), Rule::Allow);
    }

    #[test]
    fn variant_prefix_longest_match() {
        let mut builder = RulesBuilder::new();
        {
            let mut class = builder
                .for_module("app")
                .for_package("java/lang")
                .for_class("Runtime");
            let mut method = class.deny_method("exec");
            method.allow_variant("([Ljava/lang/String;");
        }
        let rules = builder.build().unwrap();
        let view = rules.for_class("app", "java/lang", "Runtime");
        assert!(view
            .rule_for_method("exec", "(Ljava/lang/String;)Ljava/lang/Process;")
            .is_deny());
        assert_eq!(
            view.rule_for_method("exec", "([Ljava/lang/String;)Ljava/lang/Process;"),
            Rule::Allow
        );
    }

    #[test]
    fn constructor_denials_degrade_value_to_exception() {
        let mut builder = RulesBuilder::new();
        builder
            .for_module("app")
            .for_package("java/io")
            .for_class("FileInputStream")
            .deny_all_constructors()
            .with_action(DenyAction::Value(ConstValue::Null));
        let rules = builder.build().unwrap();
        let view = rules.for_class("app", "java/io", "FileInputStream");
        match view.rule_for_constructor("(Ljava/lang/String;)V") {
            Rule::Deny { action, .. } => assert_eq!(action, DenyAction::standard()),
            rule => panic!("expected denial, got {rule:?}"),
        }
    }

    #[test]
    fn merge_is_allow_only_when_every_source_allows() {
        let mut b1 = RulesBuilder::new();
        b1.for_module("a")
            .for_package("java/lang")
            .for_class("System")
            .deny_method("exit");
        let mut b2 = RulesBuilder::new();
        b2.for_module("b")
            .for_package("java/nio")
            .for_class("Paths")
            .deny_method("get");
        let merged = MergedRules::new(vec![
            Arc::new(b1.build().unwrap()),
            Arc::new(b2.build().unwrap()),
        ]);
        // "a" allows Paths.get, "b" denies it: caller-specific views differ
        assert!(merged
            .for_class("b", "java/nio", "Paths")
            .rule_for_method("get", "(Ljava/lang/String;)Ljava/nio/file/Path;")
            .is_deny());
        assert_eq!(
            merged
                .for_class("a", "java/nio", "Paths")
                .rule_for_method("get", "(Ljava/lang/String;)Ljava/nio/file/Path;"),
            Rule::Allow
        );
    }

    #[test]
    fn conflicting_target_actions_merge_to_dynamic() {
        let mut builder = RulesBuilder::new();
        builder
            .for_module("a")
            .for_package("java/lang")
            .for_class("System")
            .deny_method("exit")
            .with_action(DenyAction::standard());
        builder
            .for_module("b")
            .for_package("java/lang")
            .for_class("System")
            .deny_method("exit")
            .with_action(DenyAction::exception("java/lang/IllegalStateException"));
        let rules = builder.build().unwrap();
        let view = rules.for_any_caller("java/lang", "System");
        match view.rule_for_method("exit", "(I)V") {
            Rule::Deny { action, .. } => assert_eq!(action, DenyAction::Dynamic),
            rule => panic!("expected denial, got {rule:?}"),
        }
    }

    #[test]
    fn agreeing_target_actions_keep_the_action() {
        let mut builder = RulesBuilder::new();
        for module in ["a", "b"] {
            builder
                .for_module(module)
                .for_package("java/lang")
                .for_class("System")
                .deny_method("exit");
        }
        let rules = builder.build().unwrap();
        let view = rules.for_any_caller("java/lang", "System");
        match view.rule_for_method("exit", "(I)V") {
            Rule::Deny { action, .. } => assert_eq!(action, DenyAction::standard()),
            rule => panic!("expected denial, got {rule:?}"),
        }
    }

    #[test]
    fn checked_inside_checked_is_rejected() {
        let predicate = MethodRef::new_static("p/P", "ok", "()Z");
        let inner = DenyAction::checked(predicate.clone(), DenyAction::standard());
        let action = DenyAction::Checked {
            predicate,
            inner: Box::new(inner),
        };
        assert!(matches!(
            action.validate(),
            Err(RuleError::CheckedInsideChecked)
        ));
    }

    #[test]
    fn predicate_must_return_boolean() {
        let action = DenyAction::checked(
            MethodRef::new_static("p/P", "ok", "()I"),
            DenyAction::standard(),
        );
        assert!(matches!(action.validate(), Err(RuleError::BadPredicate(_))));
    }

    #[test]
    fn subclassing_allowed_unless_overridden() {
        let mut builder = RulesBuilder::new();
        builder
            .for_module("app")
            .for_package("java/lang")
            .for_class("ProcessBuilder")
            .deny_all_methods();
        let rules = builder.build().unwrap();
        assert!(rules
            .for_class("app", "java/lang", "ProcessBuilder")
            .allows_subclassing());
    }

    #[test]
    fn merging_with_all_allow_is_identity_and_order_free() {
        let deny = deny_exit_rules();
        let expected = deny
            .for_class("app", "java/lang", "System")
            .rule_for_method("exit", "(I)V");
        assert!(expected.is_deny());
        let forward = MergedRules::new(vec![
            Arc::new(deny.clone()),
            Arc::new(RuleSet::default()),
        ]);
        let backward = MergedRules::new(vec![
            Arc::new(RuleSet::default()),
            Arc::new(deny),
        ]);
        for merged in [forward, backward] {
            assert_eq!(
                merged
                    .for_class("app", "java/lang", "System")
                    .rule_for_method("exit", "(I)V"),
                expected
            );
            assert_eq!(
                merged
                    .for_class("app", "java/lang", "System")
                    .rule_for_method("nanoTime", "()J"),
                Rule::Allow
            );
        }
    }

    #[test]
    fn split_internal_name_handles_default_package() {
        assert_eq!(
            split_internal_name("java/lang/System"),
            ("java/lang", "System")
        );
        assert_eq!(split_internal_name("Main"), ("", "Main"));
    }
}
