use thiserror::Error;

/// Everything that can go wrong while reading or re-emitting a class file.
///
/// A transformer embedding this crate may elect to fall back to the original
/// bytes for errors where [`ClassFormatError::can_ignore`] returns `true`
/// (typically: format features newer than this crate understands), and must
/// abort the class load for the rest (truncation, internal inconsistencies).
#[derive(Debug, Error)]
pub enum ClassFormatError {
    #[error("truncated class file: {0}")]
    Truncated(#[from] std::io::Error),
    #[error("unexpected end of class file")]
    UnexpectedEof,
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    #[error("unknown constant tag {tag} at pool index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },
    #[error("constant pool index {index} is not a {expected} entry")]
    WrongConstant { index: u16, expected: &'static str },
    #[error("constant pool index {0} is out of range")]
    BadIndex(u16),
    #[error("constant pool entry is not valid modified UTF-8")]
    InvalidUtf8,
    #[error("invalid descriptor {0:?}")]
    InvalidDescriptor(String),
    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u32 },
    #[error("{0} bytes left over after the class structure")]
    ExtraBytes(usize),
    #[error("constant pool no longer accepts additions after being written")]
    PoolFrozen,
    #[error("attribute {0} does not match its declared length")]
    MalformedAttribute(&'static str),
    #[error("too many entries for a {0} table")]
    TableOverflow(&'static str),
}

impl ClassFormatError {
    /// Whether the surrounding instrumentation may keep the original class
    /// bytes instead of failing the load.
    pub fn can_ignore(&self) -> bool {
        matches!(
            self,
            ClassFormatError::UnknownConstantTag { .. }
                | ClassFormatError::UnknownOpcode { .. }
                | ClassFormatError::ExtraBytes(_)
        )
    }
}
