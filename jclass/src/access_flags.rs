use bitflags::bitflags;

bitflags! {
    /// Class-level access flags, [JVMS Table 4.1-B](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.1).
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct ClassAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

bitflags! {
    /// Method access flags, [JVMS Table 4.6-A](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.6).
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct MethodAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

impl ClassAccessFlags {
    /// Unknown bits are preserved, not rejected; the codec round-trips class
    /// files newer than it understands.
    pub fn from_raw(raw: u16) -> Self {
        Self::from_bits_retain(raw)
    }
}

impl MethodAccessFlags {
    pub fn from_raw(raw: u16) -> Self {
        Self::from_bits_retain(raw)
    }
}
