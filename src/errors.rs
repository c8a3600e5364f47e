use thiserror::Error;

/// Misconfigured rules, caught by `RulesBuilder::build` before any class is
/// touched. Fatal to agent initialization.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("a checked action must not wrap another checked action")]
    CheckedInsideChecked,
    #[error("predicate {0} must take no arguments, or a caller class, and return boolean")]
    BadPredicate(String),
    #[error("invalid method reference {0:?}")]
    BadMethodRef(String),
    #[error("invalid descriptor {0:?}")]
    BadDescriptor(String),
    #[error("empty name in rule scope")]
    EmptyScopeName,
    #[error("a multi action requires an instance target")]
    MultiOnStatic,
}

/// Failures while splicing replacement bytecode into a method. These abort
/// the class and substitute the poisoned variant; see `Transformer`.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error(transparent)]
    Format(#[from] jclass::ClassFormatError),
    #[error("method grew beyond the 65535-byte code limit")]
    MethodTooLarge,
    #[error("replacement branch distance exceeds a 16-bit offset")]
    BranchOutOfRange,
    #[error("deny value {0} does not fit the method's return type")]
    ValueTypeMismatch(&'static str),
    #[error("bytecode analysis failed: {0}")]
    Analysis(&'static str),
}
