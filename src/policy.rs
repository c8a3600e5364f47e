//! The built-in deny catalog for `java.base`, expressed as rule applications.
//!
//! Two presets: [`JavaBaseRules`] covers filesystem, network, process
//! control, native access, resources, system properties, and module/loader
//! manipulation; [`ReflectionRules`] covers the reflective lookup points and
//! is applied only when reflection rewrites are enabled.

use crate::rules::builder::{ClassScope, RulesApplier, RulesBuilder};
use crate::rules::{ConstValue, DenyAction, MethodRef};

/// The runtime support class the emitted bytecode calls into. It ships with
/// the agent and is itself never rewritten.
pub const SHIM_CLASS: &str = "classfence/runtime/Shim";

/// Shim entry points referenced by `Custom` actions: `(name, descriptor)`.
/// Each takes the caller class first, then the original receiver/arguments.
pub mod shim {
    pub const GET_METHOD: (&str, &str) = (
        "getMethod",
        "(Ljava/lang/Class;Ljava/lang/Class;Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;",
    );
    pub const GET_METHODS: (&str, &str) = (
        "getMethods",
        "(Ljava/lang/Class;Ljava/lang/Class;)[Ljava/lang/reflect/Method;",
    );
    pub const GET_DECLARED_METHOD: (&str, &str) = (
        "getDeclaredMethod",
        "(Ljava/lang/Class;Ljava/lang/Class;Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;",
    );
    pub const GET_DECLARED_METHODS: (&str, &str) = (
        "getDeclaredMethods",
        "(Ljava/lang/Class;Ljava/lang/Class;)[Ljava/lang/reflect/Method;",
    );
    pub const GET_CONSTRUCTOR: (&str, &str) = (
        "getConstructor",
        "(Ljava/lang/Class;Ljava/lang/Class;[Ljava/lang/Class;)Ljava/lang/reflect/Constructor;",
    );
    pub const GET_CONSTRUCTORS: (&str, &str) = (
        "getConstructors",
        "(Ljava/lang/Class;Ljava/lang/Class;)[Ljava/lang/reflect/Constructor;",
    );
    pub const FOR_NAME: (&str, &str) = (
        "forName",
        "(Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/Class;",
    );
    pub const FOR_NAME_LOADER: (&str, &str) = (
        "forName",
        "(Ljava/lang/Class;Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;",
    );
    pub const FIND_VIRTUAL: (&str, &str) = (
        "findVirtual",
        "(Ljava/lang/Class;Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/Class;Ljava/lang/String;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/MethodHandle;",
    );
    pub const FIND_STATIC: (&str, &str) = (
        "findStatic",
        "(Ljava/lang/Class;Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/Class;Ljava/lang/String;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/MethodHandle;",
    );
    pub const GET_PROPERTY: (&str, &str) = (
        "getProperty",
        "(Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/String;",
    );
    pub const GET_PROPERTY_DEFAULT: (&str, &str) = (
        "getProperty",
        "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/String;)Ljava/lang/String;",
    );
    pub const GET_PROPERTIES: (&str, &str) =
        ("getProperties", "(Ljava/lang/Class;)Ljava/util/Properties;");
    pub const SET_PROPERTY: (&str, &str) = (
        "setProperty",
        "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/String;)Ljava/lang/String;",
    );
    pub const SET_PROPERTIES: (&str, &str) =
        ("setProperties", "(Ljava/lang/Class;Ljava/util/Properties;)V");
    pub const CLEAR_PROPERTY: (&str, &str) = (
        "clearProperty",
        "(Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/String;",
    );
    pub const GET_INTEGER: (&str, &str) = (
        "getInteger",
        "(Ljava/lang/Class;Ljava/lang/String;I)Ljava/lang/Integer;",
    );
    pub const GET_LONG: (&str, &str) = (
        "getLong",
        "(Ljava/lang/Class;Ljava/lang/String;J)Ljava/lang/Long;",
    );
    pub const GET_BOOLEAN: (&str, &str) =
        ("getBoolean", "(Ljava/lang/Class;Ljava/lang/String;)Z");
    pub const DEFINE_CLASS: (&str, &str) = (
        "defineClass",
        "(Ljava/lang/Class;Ljava/lang/ClassLoader;Ljava/lang/String;[BIILjava/security/ProtectionDomain;)Ljava/lang/Class;",
    );
    pub const DENIED_METHOD_HANDLE: (&str, &str) = (
        "deniedMethodHandle",
        "()Ljava/lang/invoke/MethodHandle;",
    );

    pub const NATIVE_ACCESS_ALLOWED: (&str, &str) = ("nativeAccessAllowed", "()Z");
    pub const SAME_MODULE: (&str, &str) = ("sameModule", "()Z");
    pub const SAME_LOADER_OR_MODULE: (&str, &str) = ("sameLoaderOrModule", "()Z");
    pub const NO_PROTECTION_DOMAIN: (&str, &str) = ("noProtectionDomain", "()Z");
    pub const IS_CALLER_ALLOWED: (&str, &str) = (
        "isCallerAllowed",
        "(Ljava/lang/String;Ljava/lang/String;)Z",
    );
    pub const CHECK_RECEIVER: (&str, &str) =
        ("checkReceiver", "(Ljava/lang/Object;Ljava/lang/String;)V");
}

/// Builds the complete built-in rule set for the given caller modules.
pub fn default_policy(
    modules: &[&str],
    reflection: bool,
) -> Result<crate::rules::RuleSet, crate::errors::RuleError> {
    let mut builder = RulesBuilder::new();
    builder.apply(&JavaBaseRules::for_modules(modules));
    if reflection {
        builder.apply(&ReflectionRules::for_modules(modules));
    }
    builder.build()
}

fn custom(entry: (&str, &str)) -> DenyAction {
    DenyAction::Custom(MethodRef::new_static(SHIM_CLASS, entry.0, entry.1))
}

fn predicate(entry: (&str, &str)) -> MethodRef {
    MethodRef::new_static(SHIM_CLASS, entry.0, entry.1)
}

fn checked(pred: (&str, &str)) -> DenyAction {
    DenyAction::checked(predicate(pred), DenyAction::standard())
}

/// The main `java.base` deny-list.
pub struct JavaBaseRules {
    modules: Vec<String>,
}

impl JavaBaseRules {
    /// Applies the catalog to each of the given caller modules.
    pub fn for_modules(modules: &[&str]) -> Self {
        JavaBaseRules {
            modules: modules.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

impl RulesApplier for JavaBaseRules {
    fn apply_rules_to(&self, builder: &mut RulesBuilder) {
        for module in &self.modules {
            apply_java_base(builder, module);
        }
    }
}

fn class_scope<'a>(
    builder: &'a mut RulesBuilder,
    module: &str,
    package: &str,
    class: &str,
) -> ClassScope<'a> {
    builder
        .for_module(module)
        .for_package(package)
        .for_class(class)
}

fn deny_constructors_except(mut class: ClassScope<'_>, allowed: &[&str]) {
    let mut ctors = class.deny_all_constructors();
    for descriptor in allowed {
        ctors.allow_variant(descriptor);
    }
}

fn apply_java_base(builder: &mut RulesBuilder, module: &str) {
    // Filesystem: stream and random-access construction, path resolution.
    deny_constructors_except(
        class_scope(builder, module, "java/io", "FileInputStream"),
        &["(Ljava/io/FileDescriptor;)V"],
    );
    deny_constructors_except(
        class_scope(builder, module, "java/io", "FileOutputStream"),
        &["(Ljava/io/FileDescriptor;)V"],
    );
    for class in ["RandomAccessFile", "FileReader", "FileWriter"] {
        class_scope(builder, module, "java/io", class).deny_all_constructors();
    }
    {
        let mut file = class_scope(builder, module, "java/io", "File");
        for method in [
            "createNewFile",
            "createTempFile",
            "delete",
            "deleteOnExit",
            "mkdir",
            "mkdirs",
            "renameTo",
            "setExecutable",
            "setReadable",
            "setWritable",
            "list",
            "listFiles",
            "listRoots",
        ] {
            file.deny_method(method);
        }
    }
    class_scope(builder, module, "java/nio/file", "Files").deny_all_methods();
    class_scope(builder, module, "java/nio/file", "Paths").deny_method("get");
    class_scope(builder, module, "java/nio/file", "Path").deny_method("of");
    class_scope(builder, module, "java/nio/file", "FileSystems").deny_method("newFileSystem");

    // Network: socket construction and URL connections.
    deny_constructors_except(class_scope(builder, module, "java/net", "Socket"), &["()V"]);
    for class in ["ServerSocket", "DatagramSocket", "MulticastSocket", "URLClassLoader"] {
        class_scope(builder, module, "java/net", class).deny_all_constructors();
    }
    {
        let mut url = class_scope(builder, module, "java/net", "URL");
        url.deny_method("openConnection");
        url.deny_method("openStream");
        url.deny_method("setURLStreamHandlerFactory");
    }
    class_scope(builder, module, "java/net/http", "HttpClient").deny_method("send");

    // Process control, exit, and shutdown hooks.
    {
        let mut process = class_scope(builder, module, "java/lang", "ProcessBuilder");
        process.deny_all_constructors();
        process.deny_method("start");
    }
    {
        let mut runtime = class_scope(builder, module, "java/lang", "Runtime");
        runtime.deny_method("exec");
        runtime.deny_method("exit");
        runtime.deny_method("halt");
        runtime.deny_method("addShutdownHook");
        runtime.deny_method("removeShutdownHook");
        // Native access: permitted for modules with native access enabled.
        runtime
            .deny_method("load")
            .with_action(checked(shim::NATIVE_ACCESS_ALLOWED));
        runtime
            .deny_method("loadLibrary")
            .with_action(checked(shim::NATIVE_ACCESS_ALLOWED));
    }
    {
        let mut system = class_scope(builder, module, "java/lang", "System");
        system.deny_method("exit");
        system
            .deny_method("load")
            .with_action(checked(shim::NATIVE_ACCESS_ALLOWED));
        system
            .deny_method("loadLibrary")
            .with_action(checked(shim::NATIVE_ACCESS_ALLOWED));
        // System properties go through the per-module filtered view.
        system
            .deny_method("getProperty")
            .with_action(custom(shim::GET_PROPERTY))
            .deny_variant_with(
                "(Ljava/lang/String;Ljava/lang/String;)",
                custom(shim::GET_PROPERTY_DEFAULT),
            );
        system
            .deny_method("getProperties")
            .with_action(custom(shim::GET_PROPERTIES));
        system
            .deny_method("setProperty")
            .with_action(custom(shim::SET_PROPERTY));
        system
            .deny_method("setProperties")
            .with_action(custom(shim::SET_PROPERTIES));
        system
            .deny_method("clearProperty")
            .with_action(custom(shim::CLEAR_PROPERTY));
    }

    // Property-backed defaults.
    class_scope(builder, module, "java/lang", "Integer")
        .deny_method("getInteger")
        .with_action(custom(shim::GET_INTEGER));
    class_scope(builder, module, "java/lang", "Long")
        .deny_method("getLong")
        .with_action(custom(shim::GET_LONG));
    class_scope(builder, module, "java/lang", "Boolean")
        .deny_method("getBoolean")
        .with_action(custom(shim::GET_BOOLEAN));

    // Loader manipulation: class definition with a protection domain.
    {
        let mut loader = class_scope(builder, module, "java/lang", "ClassLoader");
        loader
            .deny_method("defineClass")
            .with_action(DenyAction::checked(
                predicate(shim::NO_PROTECTION_DOMAIN),
                DenyAction::standard(),
            ));
        loader.deny_method("setDefaultAssertionStatus");
    }

    // Restricted FFM operations.
    class_scope(builder, module, "java/lang/foreign", "Linker")
        .deny_method("downcallHandle")
        .with_action(checked(shim::NATIVE_ACCESS_ALLOWED));
    class_scope(builder, module, "java/lang/foreign", "SymbolLookup")
        .deny_method("libraryLookup")
        .with_action(checked(shim::NATIVE_ACCESS_ALLOWED));

    // Resources resolve only within the caller's own loader or module.
    for class in ["Class", "ClassLoader", "Module"] {
        let mut scope = class_scope(builder, module, "java/lang", class);
        for method in ["getResource", "getResourceAsStream", "getResources"] {
            scope
                .deny_method(method)
                .with_action(checked(shim::SAME_LOADER_OR_MODULE));
        }
    }

    // Pool shutdown is process-wide state.
    {
        let mut pool = class_scope(builder, module, "java/util/concurrent", "ForkJoinPool");
        pool.deny_method("shutdown");
        pool.deny_method("shutdownNow");
    }
}

/// The reflective-lookup rewrites, separate so `check` can run with
/// reflection rewrites disabled.
pub struct ReflectionRules {
    modules: Vec<String>,
}

impl ReflectionRules {
    pub fn for_modules(modules: &[&str]) -> Self {
        ReflectionRules {
            modules: modules.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

impl RulesApplier for ReflectionRules {
    fn apply_rules_to(&self, builder: &mut RulesBuilder) {
        for module in &self.modules {
            apply_reflection(builder, module);
        }
    }
}

fn apply_reflection(builder: &mut RulesBuilder, module: &str) {
    {
        let mut class = class_scope(builder, module, "java/lang", "Class");
        class
            .deny_method("getMethod")
            .with_action(custom(shim::GET_METHOD));
        class
            .deny_method("getMethods")
            .with_action(custom(shim::GET_METHODS));
        class
            .deny_method("getDeclaredMethod")
            .with_action(custom(shim::GET_DECLARED_METHOD));
        class
            .deny_method("getDeclaredMethods")
            .with_action(custom(shim::GET_DECLARED_METHODS));
        class
            .deny_method("getConstructor")
            .with_action(custom(shim::GET_CONSTRUCTOR));
        class
            .deny_method("getConstructors")
            .with_action(custom(shim::GET_CONSTRUCTORS));
        class
            .deny_method("forName")
            .with_action(custom(shim::FOR_NAME))
            .deny_variant_with(
                "(Ljava/lang/String;ZLjava/lang/ClassLoader;)",
                custom(shim::FOR_NAME_LOADER),
            );
    }
    {
        let mut lookup = class_scope(builder, module, "java/lang/invoke", "MethodHandles$Lookup");
        lookup
            .deny_method("findVirtual")
            .with_action(custom(shim::FIND_VIRTUAL));
        lookup
            .deny_method("findStatic")
            .with_action(custom(shim::FIND_STATIC));
    }
    class_scope(builder, module, "java/lang/invoke", "MethodHandles")
        .deny_method("privateLookupIn");
    {
        let mut accessible = class_scope(builder, module, "java/lang/reflect", "AccessibleObject");
        accessible
            .deny_method("setAccessible")
            .with_action(DenyAction::checked(
                predicate(shim::SAME_MODULE),
                DenyAction::standard(),
            ));
        accessible
            .deny_method("trySetAccessible")
            .with_action(DenyAction::Value(ConstValue::Bool(false)));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rules::{Rule, Rules};

    fn built() -> crate::rules::RuleSet {
        let mut builder = RulesBuilder::new();
        builder.apply(&JavaBaseRules::for_modules(&["app"]));
        builder.apply(&ReflectionRules::for_modules(&["app"]));
        builder.build().expect("catalog must validate")
    }

    #[test]
    fn catalog_validates_and_denies_exit() {
        let rules = built();
        assert!(rules
            .for_class("app", "java/lang", "System")
            .rule_for_method("exit", "(I)V")
            .is_deny());
    }

    #[test]
    fn file_descriptor_streams_stay_allowed() {
        let rules = built();
        let view = rules.for_class("app", "java/io", "FileInputStream");
        assert!(view.rule_for_constructor("(Ljava/lang/String;)V").is_deny());
        assert_eq!(
            view.rule_for_constructor("(Ljava/io/FileDescriptor;)V"),
            Rule::Allow
        );
    }

    #[test]
    fn native_access_is_checked_not_flat_denied() {
        let rules = built();
        match rules
            .for_class("app", "java/lang", "System")
            .rule_for_method("loadLibrary", "(Ljava/lang/String;)V")
        {
            Rule::Deny { action: DenyAction::Checked { inner, .. }, .. } => {
                assert_eq!(*inner, DenyAction::standard());
            }
            rule => panic!("expected checked denial, got {rule:?}"),
        }
    }

    #[test]
    fn try_set_accessible_returns_false() {
        let rules = built();
        match rules
            .for_class("app", "java/lang/reflect", "AccessibleObject")
            .rule_for_method("trySetAccessible", "()Z")
        {
            Rule::Deny { action, .. } => {
                assert_eq!(action, DenyAction::Value(ConstValue::Bool(false)));
            }
            rule => panic!("expected denial, got {rule:?}"),
        }
    }

    #[test]
    fn property_access_routes_through_the_shim() {
        let rules = built();
        match rules
            .for_class("app", "java/lang", "System")
            .rule_for_method("getProperty", "(Ljava/lang/String;)Ljava/lang/String;")
        {
            Rule::Deny { action: DenyAction::Custom(target), .. } => {
                assert_eq!(&*target.owner, SHIM_CLASS);
                assert_eq!(&*target.name, "getProperty");
            }
            rule => panic!("expected custom denial, got {rule:?}"),
        }
    }

    #[test]
    fn unlisted_members_stay_allowed() {
        let rules = built();
        assert_eq!(
            rules
                .for_class("app", "java/lang", "System")
                .rule_for_method("nanoTime", "()J"),
            Rule::Allow
        );
        assert_eq!(
            rules
                .for_class("app", "java/lang", "Math")
                .rule_for_method("abs", "(I)I"),
            Rule::Allow
        );
    }
}
