//! Capability-based access control for JVM programs, enforced by rewriting
//! class files at load time.
//!
//! The crate is the core of an instrumentation agent: the JVM-facing glue
//! (class-file-transformer callback, retransform trigger, argument parsing)
//! lives outside and drives three operations — build rules, ask whether a
//! class needs rewriting, rewrite its bytes. Parsing and re-emission of the
//! class-file format itself live in the `jclass` crate.

/// Abstract interpretation supplying verifier states to the rewriter.
mod analyze;
pub mod errors;
/// The runtime decision oracle and reflective filtering helpers.
pub mod oracle;
/// The built-in `java.base` deny catalog.
pub mod policy;
/// Per-module filtered system properties.
pub mod props;
/// The bytecode rewriter.
pub mod rewrite;
/// Rule model, fluent builder, and resolution.
pub mod rules;
pub mod transform;

pub use errors::{RewriteError, RuleError};
pub use transform::Transformer;
