use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use byteorder::{ReadBytesExt, BE};

use crate::buffer::{read_slice, Reader, Sink};
use crate::error::ClassFormatError;
use crate::mutf8;

/// Constant tags, [JVMS §4.4](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.4).
pub mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
    pub const MODULE: u8 = 19;
    pub const PACKAGE: u8 = 20;
}

/// A `CONSTANT_Utf8_info` payload: raw modified-UTF-8 bytes plus a cached
/// hash. Equality is byte-wise; decoding happens only on demand.
#[derive(Clone)]
pub struct Utf8 {
    bytes: Box<[u8]>,
    hash: u32,
}

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

impl Utf8 {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hash = FNV_OFFSET;
        for &b in bytes {
            hash ^= u32::from(b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Utf8 {
            bytes: bytes.into(),
            hash,
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::from_bytes(&mutf8::encode(s))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Full decode to a Unicode string.
    pub fn decode(&self) -> Result<Cow<'_, str>, ClassFormatError> {
        mutf8::decode(&self.bytes)
    }

    /// Lossy decode for diagnostics only.
    pub fn display(&self) -> String {
        self.decode()
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.bytes).into_owned())
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.bytes.starts_with(prefix.as_bytes())
    }
}

impl PartialEq for Utf8 {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for Utf8 {}

impl std::hash::Hash for Utf8 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

/// Byte-wise comparison against a literal; exact for ASCII literals, which is
/// all the enforcement layer ever compares against.
impl PartialEq<str> for Utf8 {
    fn eq(&self, other: &str) -> bool {
        &*self.bytes == other.as_bytes()
    }
}

impl PartialEq<&str> for Utf8 {
    fn eq(&self, other: &&str) -> bool {
        &*self.bytes == other.as_bytes()
    }
}

impl fmt::Debug for Utf8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.display())
    }
}

/// One constant pool entry. Numeric payloads keep their raw big-endian bit
/// patterns so re-emission is byte-identical.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(Utf8),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
    /// Index 0 and the second index of every long/double entry.
    Slot,
}

/// A resolved field/method/interface-method reference.
#[derive(Debug, Clone, Copy)]
pub struct MemberRef<'a> {
    pub owner: &'a Utf8,
    pub name: &'a Utf8,
    pub descriptor: &'a Utf8,
    pub interface: bool,
}

/// The constant pool: 1-indexed, growable at the tail, interned by logical
/// value.
///
/// Indices handed out by `parse` stay valid forever; `add_*` either returns
/// an existing index or appends. After [`ConstantPool::write`] the pool is
/// frozen and additions fail.
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
    frozen: bool,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    /// An empty pool, for building classes from scratch.
    pub fn new() -> Self {
        ConstantPool {
            entries: vec![Constant::Slot],
            lookup: HashMap::new(),
            frozen: false,
        }
    }

    /// Reads `constant_pool_count` and the entries that follow it.
    pub fn parse(cur: &mut Reader<'_>) -> Result<Self, ClassFormatError> {
        let count = cur.read_u16::<BE>()?;
        let mut pool = ConstantPool {
            entries: Vec::with_capacity(count as usize),
            lookup: HashMap::with_capacity(count as usize),
            frozen: false,
        };
        pool.entries.push(Constant::Slot);
        while pool.entries.len() < count as usize {
            let index = pool.entries.len() as u16;
            let tag = cur.read_u8()?;
            let entry = match tag {
                tag::UTF8 => {
                    let len = cur.read_u16::<BE>()? as usize;
                    Constant::Utf8(Utf8::from_bytes(read_slice(cur, len)?))
                }
                tag::INTEGER => Constant::Integer(cur.read_u32::<BE>()?),
                tag::FLOAT => Constant::Float(cur.read_u32::<BE>()?),
                tag::LONG => Constant::Long(cur.read_u64::<BE>()?),
                tag::DOUBLE => Constant::Double(cur.read_u64::<BE>()?),
                tag::CLASS => Constant::Class {
                    name_index: cur.read_u16::<BE>()?,
                },
                tag::STRING => Constant::String {
                    string_index: cur.read_u16::<BE>()?,
                },
                tag::FIELDREF => Constant::Fieldref {
                    class_index: cur.read_u16::<BE>()?,
                    name_and_type_index: cur.read_u16::<BE>()?,
                },
                tag::METHODREF => Constant::Methodref {
                    class_index: cur.read_u16::<BE>()?,
                    name_and_type_index: cur.read_u16::<BE>()?,
                },
                tag::INTERFACE_METHODREF => Constant::InterfaceMethodref {
                    class_index: cur.read_u16::<BE>()?,
                    name_and_type_index: cur.read_u16::<BE>()?,
                },
                tag::NAME_AND_TYPE => Constant::NameAndType {
                    name_index: cur.read_u16::<BE>()?,
                    descriptor_index: cur.read_u16::<BE>()?,
                },
                tag::METHOD_HANDLE => Constant::MethodHandle {
                    reference_kind: cur.read_u8()?,
                    reference_index: cur.read_u16::<BE>()?,
                },
                tag::METHOD_TYPE => Constant::MethodType {
                    descriptor_index: cur.read_u16::<BE>()?,
                },
                tag::DYNAMIC => Constant::Dynamic {
                    bootstrap_method_attr_index: cur.read_u16::<BE>()?,
                    name_and_type_index: cur.read_u16::<BE>()?,
                },
                tag::INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap_method_attr_index: cur.read_u16::<BE>()?,
                    name_and_type_index: cur.read_u16::<BE>()?,
                },
                tag::MODULE => Constant::Module {
                    name_index: cur.read_u16::<BE>()?,
                },
                tag::PACKAGE => Constant::Package {
                    name_index: cur.read_u16::<BE>()?,
                },
                _ => return Err(ClassFormatError::UnknownConstantTag { tag, index }),
            };
            let double_slot = matches!(entry, Constant::Long(_) | Constant::Double(_));
            pool.lookup.entry(entry.clone()).or_insert(index);
            pool.entries.push(entry);
            if double_slot {
                pool.entries.push(Constant::Slot);
            }
        }
        Ok(pool)
    }

    /// The `constant_pool_count` value: number of index slots plus the unused
    /// zeroth.
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    /// Serializes the pool, original entries first, appended entries after.
    /// Freezes the pool.
    pub fn write(&mut self, sink: &mut Sink) {
        self.frozen = true;
        sink.u16(self.count());
        let mut skip_slot = true; // index 0
        for entry in &self.entries {
            if skip_slot {
                skip_slot = false;
                continue;
            }
            match entry {
                Constant::Utf8(utf8) => {
                    sink.u8(tag::UTF8);
                    sink.u16(utf8.len() as u16);
                    sink.bytes(utf8.as_bytes());
                }
                Constant::Integer(raw) => {
                    sink.u8(tag::INTEGER);
                    sink.u32(*raw);
                }
                Constant::Float(raw) => {
                    sink.u8(tag::FLOAT);
                    sink.u32(*raw);
                }
                Constant::Long(raw) => {
                    sink.u8(tag::LONG);
                    sink.u32((*raw >> 32) as u32);
                    sink.u32(*raw as u32);
                    skip_slot = true;
                }
                Constant::Double(raw) => {
                    sink.u8(tag::DOUBLE);
                    sink.u32((*raw >> 32) as u32);
                    sink.u32(*raw as u32);
                    skip_slot = true;
                }
                Constant::Class { name_index } => {
                    sink.u8(tag::CLASS);
                    sink.u16(*name_index);
                }
                Constant::String { string_index } => {
                    sink.u8(tag::STRING);
                    sink.u16(*string_index);
                }
                Constant::Fieldref { class_index, name_and_type_index } => {
                    sink.u8(tag::FIELDREF);
                    sink.u16(*class_index);
                    sink.u16(*name_and_type_index);
                }
                Constant::Methodref { class_index, name_and_type_index } => {
                    sink.u8(tag::METHODREF);
                    sink.u16(*class_index);
                    sink.u16(*name_and_type_index);
                }
                Constant::InterfaceMethodref { class_index, name_and_type_index } => {
                    sink.u8(tag::INTERFACE_METHODREF);
                    sink.u16(*class_index);
                    sink.u16(*name_and_type_index);
                }
                Constant::NameAndType { name_index, descriptor_index } => {
                    sink.u8(tag::NAME_AND_TYPE);
                    sink.u16(*name_index);
                    sink.u16(*descriptor_index);
                }
                Constant::MethodHandle { reference_kind, reference_index } => {
                    sink.u8(tag::METHOD_HANDLE);
                    sink.u8(*reference_kind);
                    sink.u16(*reference_index);
                }
                Constant::MethodType { descriptor_index } => {
                    sink.u8(tag::METHOD_TYPE);
                    sink.u16(*descriptor_index);
                }
                Constant::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    sink.u8(tag::DYNAMIC);
                    sink.u16(*bootstrap_method_attr_index);
                    sink.u16(*name_and_type_index);
                }
                Constant::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    sink.u8(tag::INVOKE_DYNAMIC);
                    sink.u16(*bootstrap_method_attr_index);
                    sink.u16(*name_and_type_index);
                }
                Constant::Module { name_index } => {
                    sink.u8(tag::MODULE);
                    sink.u16(*name_index);
                }
                Constant::Package { name_index } => {
                    sink.u8(tag::PACKAGE);
                    sink.u16(*name_index);
                }
                Constant::Slot => unreachable!("slot entries are skipped with their owners"),
            }
        }
    }

    fn intern(&mut self, entry: Constant) -> Result<u16, ClassFormatError> {
        if let Some(&index) = self.lookup.get(&entry) {
            return Ok(index);
        }
        if self.frozen {
            return Err(ClassFormatError::PoolFrozen);
        }
        let index = self.entries.len() as u16;
        if self.entries.len() + 1 > u16::MAX as usize {
            return Err(ClassFormatError::TableOverflow("constant pool"));
        }
        let double_slot = matches!(entry, Constant::Long(_) | Constant::Double(_));
        self.lookup.insert(entry.clone(), index);
        self.entries.push(entry);
        if double_slot {
            self.entries.push(Constant::Slot);
        }
        Ok(index)
    }

    pub fn add_utf8(&mut self, s: &str) -> Result<u16, ClassFormatError> {
        self.intern(Constant::Utf8(Utf8::from_str(s)))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16, ClassFormatError> {
        let name_index = self.add_utf8(internal_name)?;
        self.intern(Constant::Class { name_index })
    }

    pub fn add_string(&mut self, s: &str) -> Result<u16, ClassFormatError> {
        let string_index = self.add_utf8(s)?;
        self.intern(Constant::String { string_index })
    }

    pub fn add_integer(&mut self, v: i32) -> Result<u16, ClassFormatError> {
        self.intern(Constant::Integer(v as u32))
    }

    pub fn add_float(&mut self, v: f32) -> Result<u16, ClassFormatError> {
        self.intern(Constant::Float(v.to_bits()))
    }

    pub fn add_long(&mut self, v: i64) -> Result<u16, ClassFormatError> {
        self.intern(Constant::Long(v as u64))
    }

    pub fn add_double(&mut self, v: f64) -> Result<u16, ClassFormatError> {
        self.intern(Constant::Double(v.to_bits()))
    }

    pub fn add_name_and_type(&mut self, name: &str, desc: &str) -> Result<u16, ClassFormatError> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(desc)?;
        self.intern(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        desc: &str,
    ) -> Result<u16, ClassFormatError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, desc)?;
        self.intern(Constant::Methodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        desc: &str,
    ) -> Result<u16, ClassFormatError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, desc)?;
        self.intern(Constant::InterfaceMethodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_method_handle(
        &mut self,
        reference_kind: u8,
        reference_index: u16,
    ) -> Result<u16, ClassFormatError> {
        self.intern(Constant::MethodHandle {
            reference_kind,
            reference_index,
        })
    }

    /// The index of an existing UTF-8 entry, without adding one.
    pub fn find_utf8(&self, text: &str) -> Option<u16> {
        self.lookup
            .get(&Constant::Utf8(Utf8::from_str(text)))
            .copied()
    }

    /// The index of an existing class entry, without adding one.
    pub fn find_class(&self, internal_name: &str) -> Option<u16> {
        let name_index = self.find_utf8(internal_name)?;
        self.lookup.get(&Constant::Class { name_index }).copied()
    }

    pub fn get(&self, index: u16) -> Result<&Constant, ClassFormatError> {
        match self.entries.get(index as usize) {
            None | Some(Constant::Slot) => Err(ClassFormatError::BadIndex(index)),
            Some(entry) => Ok(entry),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&Utf8, ClassFormatError> {
        match self.get(index)? {
            Constant::Utf8(utf8) => Ok(utf8),
            _ => Err(ClassFormatError::WrongConstant {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// The internal name behind a `CONSTANT_Class_info` entry.
    pub fn class_name(&self, index: u16) -> Result<&Utf8, ClassFormatError> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(ClassFormatError::WrongConstant {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&Utf8, &Utf8), ClassFormatError> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(ClassFormatError::WrongConstant {
                index,
                expected: "NameAndType",
            }),
        }
    }

    /// Resolves any of the three member-reference shapes.
    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>, ClassFormatError> {
        let (class_index, nat_index, interface) = match self.get(index)? {
            Constant::Fieldref { class_index, name_and_type_index }
            | Constant::Methodref { class_index, name_and_type_index } => {
                (*class_index, *name_and_type_index, false)
            }
            Constant::InterfaceMethodref { class_index, name_and_type_index } => {
                (*class_index, *name_and_type_index, true)
            }
            _ => {
                return Err(ClassFormatError::WrongConstant {
                    index,
                    expected: "Fieldref/Methodref/InterfaceMethodref",
                })
            }
        };
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok(MemberRef {
            owner: self.class_name(class_index)?,
            name,
            descriptor,
            interface,
        })
    }

    /// Resolves the name-and-type half of an `invokedynamic` constant,
    /// returning `(bootstrap_method_attr_index, name, descriptor)`.
    pub fn invoke_dynamic(
        &self,
        index: u16,
    ) -> Result<(u16, &Utf8, &Utf8), ClassFormatError> {
        match self.get(index)? {
            Constant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                let (name, desc) = self.name_and_type(*name_and_type_index)?;
                Ok((*bootstrap_method_attr_index, name, desc))
            }
            _ => Err(ClassFormatError::WrongConstant {
                index,
                expected: "InvokeDynamic",
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::reader_at;

    fn sample_pool() -> Vec<u8> {
        let mut sink = Sink::new();
        sink.u16(7); // count: six entries
        sink.u8(tag::UTF8);
        sink.u16(4);
        sink.bytes(b"Main");
        sink.u8(tag::CLASS);
        sink.u16(1);
        sink.u8(tag::LONG);
        sink.u32(0xDEAD_BEEF);
        sink.u32(0x0BAD_F00D);
        // index 4 is the long's second slot
        sink.u8(tag::UTF8);
        sink.u16(3);
        sink.bytes(b"()V");
        sink.u8(tag::NAME_AND_TYPE);
        sink.u16(1);
        sink.u16(5);
        sink.into_bytes()
    }

    #[test]
    fn parse_and_rewrite_is_byte_identical() {
        let bytes = sample_pool();
        let mut pool = ConstantPool::parse(&mut reader_at(&bytes, 0)).unwrap();
        let mut out = Sink::new();
        pool.write(&mut out);
        assert_eq!(out.as_slice(), &bytes[..]);
    }

    #[test]
    fn long_takes_two_slots() {
        let bytes = sample_pool();
        let pool = ConstantPool::parse(&mut reader_at(&bytes, 0)).unwrap();
        assert!(matches!(pool.get(3), Ok(Constant::Long(_))));
        assert!(pool.get(4).is_err());
        assert_eq!(pool.utf8(5).unwrap(), "()V");
    }

    #[test]
    fn interning_is_idempotent_and_appends() {
        let bytes = sample_pool();
        let mut pool = ConstantPool::parse(&mut reader_at(&bytes, 0)).unwrap();
        // "Main" already exists at index 1, class entry at 2
        assert_eq!(pool.add_utf8("Main").unwrap(), 1);
        assert_eq!(pool.add_class("Main").unwrap(), 2);
        let before = pool.count();
        let exc = pool.add_class("java/lang/SecurityException").unwrap();
        assert!(exc >= before);
        assert_eq!(pool.add_class("java/lang/SecurityException").unwrap(), exc);
        // original indices untouched
        assert_eq!(pool.utf8(1).unwrap(), "Main");
    }

    #[test]
    fn frozen_after_write() {
        let bytes = sample_pool();
        let mut pool = ConstantPool::parse(&mut reader_at(&bytes, 0)).unwrap();
        let mut out = Sink::new();
        pool.write(&mut out);
        assert!(matches!(
            pool.add_utf8("late"),
            Err(ClassFormatError::PoolFrozen)
        ));
        // existing values still resolve through the intern table
        assert_eq!(pool.add_utf8("Main").unwrap(), 1);
    }

    #[test]
    fn member_ref_resolution() {
        let mut sink = Sink::new();
        sink.u16(6);
        sink.u8(tag::UTF8);
        sink.u16(16);
        sink.bytes(b"java/lang/System");
        sink.u8(tag::CLASS);
        sink.u16(1);
        sink.u8(tag::UTF8);
        sink.u16(4);
        sink.bytes(b"exit");
        sink.u8(tag::UTF8);
        sink.u16(4);
        sink.bytes(b"(I)V");
        sink.u8(tag::NAME_AND_TYPE);
        sink.u16(3);
        sink.u16(4);
        // index 6 would be the methodref; entry 5 is the nat
        let mut bytes = sink.into_bytes();
        bytes[0..2].copy_from_slice(&7u16.to_be_bytes());
        bytes.push(tag::METHODREF);
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&5u16.to_be_bytes());
        let pool = ConstantPool::parse(&mut reader_at(&bytes, 0)).unwrap();
        let mref = pool.member_ref(6).unwrap();
        assert_eq!(mref.owner, "java/lang/System");
        assert_eq!(mref.name, "exit");
        assert_eq!(mref.descriptor, "(I)V");
        assert!(!mref.interface);
    }
}
