//! The transformation façade the instrumentation glue drives.

use std::sync::Arc;

use jclass::class_file::ClassFile;

use crate::errors::RewriteError;
use crate::rewrite::{self, Checkers};
use crate::rules::Rules;

/// Owns built rules and turns class-file images into enforced ones.
///
/// `transform` is safe to call concurrently: rules are immutable and every
/// parse works on its own buffers.
pub struct Transformer {
    rules: Arc<dyn Rules>,
    reflection_rewrites: bool,
}

impl Transformer {
    pub fn new(rules: Arc<dyn Rules>) -> Self {
        Transformer {
            rules,
            reflection_rewrites: true,
        }
    }

    /// Gates rewriting of reflective lookup points and method-handle
    /// constants.
    pub fn reflection_rewrites(mut self, enabled: bool) -> Self {
        self.reflection_rewrites = enabled;
        self
    }

    pub fn rules(&self) -> &Arc<dyn Rules> {
        &self.rules
    }

    /// Transforms one class loaded into `caller_module`.
    ///
    /// `Ok(None)` means every operation resolved to allow and the original
    /// bytes stand. Parse failures propagate (the caller may consult
    /// [`jclass::ClassFormatError::can_ignore`] through the `Format`
    /// variant). A failure while splicing replacements does not: per the
    /// fail-closed policy the result is then a poisoned class whose every
    /// method throws `SecurityException`.
    pub fn transform(
        &self,
        caller_module: &str,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, RewriteError> {
        let mut class = ClassFile::parse(bytes)?;
        let checkers = Checkers {
            rules: &*self.rules,
            caller_module,
        };
        let changed = match rewrite::rewrite_class(&mut class, &checkers, self.reflection_rewrites)
        {
            Ok(changed) => changed,
            Err(error) => {
                log::warn!(
                    "rewrite failed for {}: {error}; substituting a poisoned class",
                    class.class_name().map(|n| n.display()).unwrap_or_default()
                );
                return rewrite::poison_class(bytes).map(Some);
            }
        };
        if !changed {
            return Ok(None);
        }
        match class.redefine() {
            Ok(out) => Ok(Some(out)),
            Err(error) => {
                log::warn!("re-emission failed: {error}; substituting a poisoned class");
                rewrite::poison_class(bytes).map(Some)
            }
        }
    }
}

impl RewriteError {
    /// Whether the instrumentation layer may fall back to the original
    /// bytes. Mirrors [`jclass::ClassFormatError::can_ignore`].
    pub fn can_ignore(&self) -> bool {
        matches!(self, RewriteError::Format(e) if e.can_ignore())
    }
}
