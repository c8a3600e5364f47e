//! Whole-file round-trip properties of the codec.

use jclass::buffer::Sink;
use jclass::bytecode::op;
use jclass::class_file::{write_method_info, ClassFile};
use jclass::pool::ConstantPool;

/// A class with a long constant, a nested unknown attribute, and a method,
/// exercising the double-slot and opaque-copy paths.
fn sample_class() -> Vec<u8> {
    let mut pool = ConstantPool::new();
    let this_class = pool.add_class("sample/Widget").unwrap();
    let super_class = pool.add_class("java/lang/Object").unwrap();
    let code_name = pool.add_utf8("Code").unwrap();
    let name = pool.add_utf8("spin").unwrap();
    let desc = pool.add_utf8("()J").unwrap();
    let seed = pool.add_long(0x1234_5678_9ABC_DEF0).unwrap();
    let custom_attr = pool.add_utf8("sample.Marker").unwrap();

    let code = vec![op::LDC2_W, (seed >> 8) as u8, seed as u8, op::LRETURN];
    let method = write_method_info(0x0009, name, desc, code_name, 2, 0, &code, &[], &[]).unwrap();

    let mut sink = Sink::new();
    sink.u32(0xCAFE_BABE);
    sink.u16(0);
    sink.u16(61);
    pool.write(&mut sink);
    sink.u16(0x0021);
    sink.u16(this_class);
    sink.u16(super_class);
    sink.u16(0);
    sink.u16(0);
    sink.u16(1);
    sink.bytes(&method);
    sink.u16(1); // one class attribute, unknown to the codec
    sink.u16(custom_attr);
    sink.u32(4);
    sink.bytes(&[0xDE, 0xAD, 0xBE, 0xEF]);
    sink.into_bytes()
}

#[test]
fn redefine_without_changes_is_identity() {
    let bytes = sample_class();
    let mut class = ClassFile::parse(&bytes).unwrap();
    assert_eq!(class.redefine().unwrap(), bytes);
}

#[test]
fn parse_of_rewritten_output_matches_parse_of_input() {
    let bytes = sample_class();
    let mut class = ClassFile::parse(&bytes).unwrap();
    let out = class.redefine().unwrap();
    let reparsed = ClassFile::parse(&out).unwrap();
    let original = ClassFile::parse(&bytes).unwrap();
    assert_eq!(reparsed.major_version, original.major_version);
    assert_eq!(
        reparsed.class_name().unwrap(),
        original.class_name().unwrap()
    );
    assert_eq!(reparsed.methods.len(), original.methods.len());
    assert_eq!(
        reparsed.method_name(0).unwrap(),
        original.method_name(0).unwrap()
    );
}

#[test]
fn pool_extension_preserves_original_indices_and_ranges() {
    let bytes = sample_class();
    let mut class = ClassFile::parse(&bytes).unwrap();
    let spin_index = class.pool.find_utf8("spin").unwrap();
    class
        .pool
        .add_method_ref("java/lang/System", "exit", "(I)V")
        .unwrap();
    let out = class.redefine().unwrap();
    let rewritten = ClassFile::parse(&out).unwrap();
    // original entries kept their indices
    assert_eq!(rewritten.pool.find_utf8("spin"), Some(spin_index));
    assert_eq!(rewritten.pool.utf8(spin_index).unwrap(), "spin");
    // the unknown class attribute round-tripped byte-identically
    assert_eq!(&out[out.len() - 4..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    // method region is byte-identical too
    let original = ClassFile::parse(&bytes).unwrap();
    assert_eq!(
        original.span_bytes(original.methods[0].span),
        rewritten.span_bytes(rewritten.methods[0].span),
    );
}
