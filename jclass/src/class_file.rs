//! Region-based class-file model.
//!
//! A parsed [`ClassFile`] is the constant pool plus byte spans into the
//! original image. [`ClassFile::redefine`] concatenates, in original order:
//! the header, the (possibly extended) pool, the untouched body prefix, each
//! method region (original span or replacement bytes), any appended synthetic
//! methods, and the untouched class-attribute tail. A class with no
//! replacements re-emits byte-identically.

use byteorder::{ReadBytesExt, BE};

use crate::access_flags::{ClassAccessFlags, MethodAccessFlags};
use crate::buffer::{reader_at, skip, Reader, Sink};
use crate::error::ClassFormatError;
use crate::pool::{ConstantPool, Utf8};

const MAGIC: u32 = 0xCAFE_BABE;

/// A contiguous byte range of the original image.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub off: usize,
    pub len: usize,
}

impl Span {
    pub fn end(self) -> usize {
        self.off + self.len
    }
}

/// One attribute of a method: name index plus the span of its `info` bytes.
#[derive(Debug, Clone, Copy)]
pub struct AttributeSpan {
    pub name_index: u16,
    pub info: Span,
}

/// A parsed `method_info` region. `replacement` switches the region from the
/// original span to rewritten bytes.
#[derive(Debug)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub span: Span,
    pub attributes: Vec<AttributeSpan>,
    replacement: Option<Vec<u8>>,
}

impl MethodInfo {
    pub fn flags(&self) -> MethodAccessFlags {
        MethodAccessFlags::from_raw(self.access_flags)
    }

    pub fn is_replaced(&self) -> bool {
        self.replacement.is_some()
    }
}

/// An exception-table entry of a `Code` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// A nested attribute of a `Code` attribute. Only the two tables the rewriter
/// maintains are distinguished; everything else round-trips opaquely.
#[derive(Debug, Clone)]
pub enum CodeSubAttribute {
    StackMapTable { name_index: u16, body: Span },
    LineNumberTable { name_index: u16, entries: Vec<(u16, u16)> },
    Opaque { name_index: u16, body: Span },
}

/// The parts of a `Code` attribute the rewriter works with. Bytecode stays in
/// the original buffer until a replacement is built.
#[derive(Debug)]
pub struct CodeAttribute {
    pub name_index: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Span,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<CodeSubAttribute>,
}

/// A class file parsed into pool + regions.
pub struct ClassFile<'a> {
    bytes: &'a [u8],
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    /// access_flags .. end of fields: never touched.
    body: Span,
    methods_count_off: usize,
    pub methods: Vec<MethodInfo>,
    /// Class-level attributes: never touched.
    tail: Span,
    appended: Vec<Vec<u8>>,
}

fn skip_attributes(cur: &mut Reader<'_>) -> Result<(), ClassFormatError> {
    let count = cur.read_u16::<BE>()?;
    for _ in 0..count {
        skip(cur, 2)?;
        let len = cur.read_u32::<BE>()?;
        skip(cur, len as usize)?;
    }
    Ok(())
}

impl<'a> ClassFile<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ClassFormatError> {
        let mut cur = reader_at(bytes, 0);
        let magic = cur.read_u32::<BE>()?;
        if magic != MAGIC {
            return Err(ClassFormatError::BadMagic(magic));
        }
        let minor_version = cur.read_u16::<BE>()?;
        let major_version = cur.read_u16::<BE>()?;
        let pool = ConstantPool::parse(&mut cur)?;
        let body_off = cur.position() as usize;
        let access_flags = cur.read_u16::<BE>()?;
        let this_class = cur.read_u16::<BE>()?;
        let super_class = cur.read_u16::<BE>()?;
        let interfaces_count = cur.read_u16::<BE>()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(cur.read_u16::<BE>()?);
        }
        let fields_count = cur.read_u16::<BE>()?;
        for _ in 0..fields_count {
            skip(&mut cur, 6)?;
            skip_attributes(&mut cur)?;
        }
        let methods_count_off = cur.position() as usize;
        let methods_count = cur.read_u16::<BE>()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let off = cur.position() as usize;
            let access_flags = cur.read_u16::<BE>()?;
            let name_index = cur.read_u16::<BE>()?;
            let descriptor_index = cur.read_u16::<BE>()?;
            let attr_count = cur.read_u16::<BE>()?;
            let mut attributes = Vec::with_capacity(attr_count as usize);
            for _ in 0..attr_count {
                let attr_name = cur.read_u16::<BE>()?;
                let len = cur.read_u32::<BE>()? as usize;
                let info_off = cur.position() as usize;
                skip(&mut cur, len)?;
                attributes.push(AttributeSpan {
                    name_index: attr_name,
                    info: Span { off: info_off, len },
                });
            }
            let len = cur.position() as usize - off;
            methods.push(MethodInfo {
                access_flags,
                name_index,
                descriptor_index,
                span: Span { off, len },
                attributes,
                replacement: None,
            });
        }
        let tail_off = cur.position() as usize;
        skip_attributes(&mut cur)?;
        let end = cur.position() as usize;
        if end != bytes.len() {
            return Err(ClassFormatError::ExtraBytes(bytes.len() - end));
        }
        Ok(ClassFile {
            bytes,
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            body: Span {
                off: body_off,
                len: methods_count_off - body_off,
            },
            methods_count_off,
            methods,
            tail: Span {
                off: tail_off,
                len: end - tail_off,
            },
            appended: Vec::new(),
        })
    }

    pub fn original_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn flags(&self) -> ClassAccessFlags {
        ClassAccessFlags::from_raw(self.access_flags)
    }

    /// Internal name of this class.
    pub fn class_name(&self) -> Result<&Utf8, ClassFormatError> {
        self.pool.class_name(self.this_class)
    }

    pub fn method_name(&self, index: usize) -> Result<&Utf8, ClassFormatError> {
        self.pool.utf8(self.methods[index].name_index)
    }

    pub fn method_descriptor(&self, index: usize) -> Result<&Utf8, ClassFormatError> {
        self.pool.utf8(self.methods[index].descriptor_index)
    }

    /// Parses the `Code` attribute of a method, if it has one.
    pub fn code_attribute(
        &self,
        method_index: usize,
    ) -> Result<Option<CodeAttribute>, ClassFormatError> {
        let method = &self.methods[method_index];
        for attr in &method.attributes {
            if *self.pool.utf8(attr.name_index)? != *"Code" {
                continue;
            }
            let mut cur = reader_at(self.bytes, attr.info.off);
            let max_stack = cur.read_u16::<BE>()?;
            let max_locals = cur.read_u16::<BE>()?;
            let code_length = cur.read_u32::<BE>()? as usize;
            let code_off = cur.position() as usize;
            skip(&mut cur, code_length)?;
            let exc_count = cur.read_u16::<BE>()?;
            let mut exception_table = Vec::with_capacity(exc_count as usize);
            for _ in 0..exc_count {
                exception_table.push(ExceptionTableEntry {
                    start_pc: cur.read_u16::<BE>()?,
                    end_pc: cur.read_u16::<BE>()?,
                    handler_pc: cur.read_u16::<BE>()?,
                    catch_type: cur.read_u16::<BE>()?,
                });
            }
            let sub_count = cur.read_u16::<BE>()?;
            let mut attributes = Vec::with_capacity(sub_count as usize);
            for _ in 0..sub_count {
                let name_index = cur.read_u16::<BE>()?;
                let len = cur.read_u32::<BE>()? as usize;
                let body_off = cur.position() as usize;
                let body = Span { off: body_off, len };
                let name = self.pool.utf8(name_index)?;
                let sub = if *name == *"StackMapTable" {
                    skip(&mut cur, len)?;
                    CodeSubAttribute::StackMapTable { name_index, body }
                } else if *name == *"LineNumberTable" {
                    let entry_count = cur.read_u16::<BE>()?;
                    let mut entries = Vec::with_capacity(entry_count as usize);
                    for _ in 0..entry_count {
                        entries.push((cur.read_u16::<BE>()?, cur.read_u16::<BE>()?));
                    }
                    if cur.position() as usize != body_off + len {
                        return Err(ClassFormatError::MalformedAttribute("LineNumberTable"));
                    }
                    CodeSubAttribute::LineNumberTable { name_index, entries }
                } else {
                    skip(&mut cur, len)?;
                    CodeSubAttribute::Opaque { name_index, body }
                };
                attributes.push(sub);
            }
            if cur.position() as usize != attr.info.end() {
                return Err(ClassFormatError::MalformedAttribute("Code"));
            }
            return Ok(Some(CodeAttribute {
                name_index: attr.name_index,
                max_stack,
                max_locals,
                code: Span {
                    off: code_off,
                    len: code_length,
                },
                exception_table,
                attributes,
            }));
        }
        Ok(None)
    }

    /// The bytecode of a parsed `Code` attribute.
    pub fn code_bytes(&self, code: &CodeAttribute) -> &'a [u8] {
        &self.bytes[code.code.off..code.code.end()]
    }

    pub fn span_bytes(&self, span: Span) -> &'a [u8] {
        &self.bytes[span.off..span.end()]
    }

    /// The `BootstrapMethods` class attribute, if present: for each entry the
    /// `CONSTANT_MethodHandle_info` index of the bootstrap method plus its
    /// static argument indices.
    pub fn bootstrap_methods(&self) -> Result<Vec<(u16, Vec<u16>)>, ClassFormatError> {
        let mut cur = reader_at(self.bytes, self.tail.off);
        let count = cur.read_u16::<BE>()?;
        for _ in 0..count {
            let name_index = cur.read_u16::<BE>()?;
            let len = cur.read_u32::<BE>()? as usize;
            if *self.pool.utf8(name_index)? != *"BootstrapMethods" {
                skip(&mut cur, len)?;
                continue;
            }
            let entry_count = cur.read_u16::<BE>()?;
            let mut entries = Vec::with_capacity(entry_count as usize);
            for _ in 0..entry_count {
                let method_ref = cur.read_u16::<BE>()?;
                let arg_count = cur.read_u16::<BE>()?;
                let mut arguments = Vec::with_capacity(arg_count as usize);
                for _ in 0..arg_count {
                    arguments.push(cur.read_u16::<BE>()?);
                }
                entries.push((method_ref, arguments));
            }
            return Ok(entries);
        }
        Ok(Vec::new())
    }

    /// Swaps a method region for rewritten `method_info` bytes.
    pub fn replace_method(&mut self, index: usize, method_info: Vec<u8>) {
        self.methods[index].replacement = Some(method_info);
    }

    /// Appends a synthetic method after the originals.
    pub fn append_method(&mut self, method_info: Vec<u8>) {
        self.appended.push(method_info);
    }

    pub fn has_replacements(&self) -> bool {
        !self.appended.is_empty() || self.methods.iter().any(MethodInfo::is_replaced)
    }

    /// Materializes the output image and freezes the pool.
    pub fn redefine(&mut self) -> Result<Vec<u8>, ClassFormatError> {
        let method_count = self.methods.len() + self.appended.len();
        if method_count > u16::MAX as usize {
            return Err(ClassFormatError::TableOverflow("method"));
        }
        let mut sink = Sink::with_capacity(self.bytes.len() + 256);
        sink.u32(MAGIC);
        sink.u16(self.minor_version);
        sink.u16(self.major_version);
        self.pool.write(&mut sink);
        sink.bytes(self.span_bytes(self.body));
        sink.u16(method_count as u16);
        for method in &self.methods {
            match &method.replacement {
                Some(bytes) => sink.bytes(bytes),
                None => sink.bytes(&self.bytes[method.span.off..method.span.end()]),
            }
        }
        for method in &self.appended {
            sink.bytes(method);
        }
        sink.bytes(self.span_bytes(self.tail));
        Ok(sink.into_bytes())
    }
}

/// Assembles a `method_info` blob with a single `Code` attribute from parts.
/// Sub-attributes are `(name_index, body)` pairs, already serialized.
pub fn write_method_info(
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    code_name_index: u16,
    max_stack: u16,
    max_locals: u16,
    code: &[u8],
    exception_table: &[ExceptionTableEntry],
    sub_attributes: &[(u16, Vec<u8>)],
) -> Result<Vec<u8>, ClassFormatError> {
    if code.len() > 65535 {
        return Err(ClassFormatError::TableOverflow("code"));
    }
    if exception_table.len() > u16::MAX as usize {
        return Err(ClassFormatError::TableOverflow("exception"));
    }
    let mut sink = Sink::with_capacity(code.len() + 64);
    sink.u16(access_flags);
    sink.u16(name_index);
    sink.u16(descriptor_index);
    sink.u16(1); // one attribute: Code
    sink.u16(code_name_index);
    let len_at = sink.len();
    sink.u32(0);
    let body_start = sink.len();
    sink.u16(max_stack);
    sink.u16(max_locals);
    sink.u32(code.len() as u32);
    sink.bytes(code);
    sink.u16(exception_table.len() as u16);
    for entry in exception_table {
        sink.u16(entry.start_pc);
        sink.u16(entry.end_pc);
        sink.u16(entry.handler_pc);
        sink.u16(entry.catch_type);
    }
    sink.u16(sub_attributes.len() as u16);
    for (name_index, body) in sub_attributes {
        sink.u16(*name_index);
        sink.u32(body.len() as u32);
        sink.bytes(body);
    }
    let body_len = (sink.len() - body_start) as u32;
    sink.patch_u32(len_at, body_len);
    Ok(sink.into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::op;

    /// A minimal class with one static method `run(I)V` that calls
    /// `java/lang/System.exit(I)V` and returns. Pool layout is fixed so tests
    /// can refer to indices.
    pub(crate) fn sample_class() -> Vec<u8> {
        let mut sink = Sink::new();
        sink.u32(MAGIC);
        sink.u16(0);
        sink.u16(61); // Java 17
        sink.u16(13); // constant pool count
        // 1: "Main", 2: Class(1), 3: "java/lang/Object", 4: Class(3)
        sink.u8(1);
        sink.u16(4);
        sink.bytes(b"Main");
        sink.u8(7);
        sink.u16(1);
        sink.u8(1);
        sink.u16(16);
        sink.bytes(b"java/lang/Object");
        sink.u8(7);
        sink.u16(3);
        // 5: "java/lang/System", 6: Class(5)
        sink.u8(1);
        sink.u16(16);
        sink.bytes(b"java/lang/System");
        sink.u8(7);
        sink.u16(5);
        // 7: "exit", 8: "(I)V", 9: NameAndType(7, 8), 10: Methodref(6, 9)
        sink.u8(1);
        sink.u16(4);
        sink.bytes(b"exit");
        sink.u8(1);
        sink.u16(4);
        sink.bytes(b"(I)V");
        sink.u8(12);
        sink.u16(7);
        sink.u16(8);
        sink.u8(10);
        sink.u16(6);
        sink.u16(9);
        // 11: "run", 12: "Code"
        sink.u8(1);
        sink.u16(3);
        sink.bytes(b"run");
        sink.u8(1);
        sink.u16(4);
        sink.bytes(b"Code");
        // class body
        sink.u16(0x0021); // public super
        sink.u16(2); // this
        sink.u16(4); // super
        sink.u16(0); // interfaces
        sink.u16(0); // fields
        sink.u16(1); // methods
        sink.u16(0x0009); // public static
        sink.u16(11); // "run"
        sink.u16(8); // "(I)V"
        sink.u16(1); // one attribute
        sink.u16(12); // "Code"
        let code = [op::ILOAD_0, op::INVOKESTATIC, 0, 10, op::RETURN];
        sink.u32(2 + 2 + 4 + code.len() as u32 + 2 + 2);
        sink.u16(1); // max_stack
        sink.u16(1); // max_locals
        sink.u32(code.len() as u32);
        sink.bytes(&code);
        sink.u16(0); // exception table
        sink.u16(0); // code attributes
        sink.u16(0); // class attributes
        sink.into_bytes()
    }

    #[test]
    fn untouched_class_redefines_byte_identically() {
        let bytes = sample_class();
        let mut class = ClassFile::parse(&bytes).unwrap();
        assert!(!class.has_replacements());
        let out = class.redefine().unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn parse_exposes_structure() {
        let bytes = sample_class();
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.major_version, 61);
        assert_eq!(class.class_name().unwrap(), "Main");
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.method_name(0).unwrap(), "run");
        assert_eq!(class.method_descriptor(0).unwrap(), "(I)V");
        let code = class.code_attribute(0).unwrap().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 1);
        assert_eq!(
            class.code_bytes(&code),
            [op::ILOAD_0, op::INVOKESTATIC, 0, 10, op::RETURN]
        );
        assert!(code.exception_table.is_empty());
    }

    #[test]
    fn replacement_region_is_spliced_in() {
        let bytes = sample_class();
        let mut class = ClassFile::parse(&bytes).unwrap();
        let code = [op::RETURN];
        let info = write_method_info(
            0x0009,
            11,
            8,
            12,
            0,
            1,
            &code,
            &[],
            &[],
        )
        .unwrap();
        class.replace_method(0, info);
        let out = class.redefine().unwrap();
        let reparsed = ClassFile::parse(&out).unwrap();
        let new_code = reparsed.code_attribute(0).unwrap().unwrap();
        assert_eq!(reparsed.code_bytes(&new_code), [op::RETURN]);
        // header and tail untouched
        assert_eq!(&out[..10], &bytes[..10]);
        assert_eq!(&out[out.len() - 2..], &bytes[bytes.len() - 2..]);
    }

    #[test]
    fn appended_method_bumps_the_count() {
        let bytes = sample_class();
        let mut class = ClassFile::parse(&bytes).unwrap();
        let info = write_method_info(0x0009, 7, 8, 12, 0, 1, &[op::RETURN], &[], &[]).unwrap();
        class.append_method(info);
        let out = class.redefine().unwrap();
        let reparsed = ClassFile::parse(&out).unwrap();
        assert_eq!(reparsed.methods.len(), 2);
        assert_eq!(reparsed.method_name(1).unwrap(), "exit");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample_class();
        bytes[0] = 0;
        assert!(matches!(
            ClassFile::parse(&bytes),
            Err(ClassFormatError::BadMagic(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_ignorable() {
        let mut bytes = sample_class();
        bytes.push(0);
        match ClassFile::parse(&bytes) {
            Err(e) => assert!(e.can_ignore()),
            Ok(_) => panic!("extra bytes accepted"),
        }
    }
}
