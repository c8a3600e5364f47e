//! Synthetic class-file assembly for the transformer tests.

use jclass::buffer::Sink;
use jclass::class_file::{write_method_info, ExceptionTableEntry};
use jclass::pool::ConstantPool;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;

pub struct MethodSpec {
    pub flags: u16,
    pub name: String,
    pub descriptor: String,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exceptions: Vec<ExceptionTableEntry>,
    pub stack_map: Option<Vec<u8>>,
}

impl MethodSpec {
    pub fn of(name: &str, descriptor: &str, max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        MethodSpec {
            flags: ACC_PUBLIC | ACC_STATIC,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            max_stack,
            max_locals,
            code,
            exceptions: Vec::new(),
            stack_map: None,
        }
    }
}

/// Assembles a minimal but complete class file (major version 61, no fields,
/// no interfaces). Pool entries referenced from method code are added through
/// [`ClassBuilder::pool`] before `build`, which keeps their indices stable in
/// the output.
pub struct ClassBuilder {
    pub pool: ConstantPool,
    name: String,
    methods: Vec<MethodSpec>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        ClassBuilder {
            pool: ConstantPool::new(),
            name: name.to_owned(),
            methods: Vec::new(),
        }
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.pool
            .add_method_ref(owner, name, descriptor)
            .expect("pool space")
    }

    pub fn class_ref(&mut self, name: &str) -> u16 {
        self.pool.add_class(name).expect("pool space")
    }

    pub fn string_ref(&mut self, text: &str) -> u16 {
        self.pool.add_string(text).expect("pool space")
    }

    pub fn add_method(&mut self, spec: MethodSpec) {
        self.methods.push(spec);
    }

    pub fn build(mut self) -> Vec<u8> {
        let this_class = self.pool.add_class(&self.name).expect("pool space");
        let super_class = self.pool.add_class("java/lang/Object").expect("pool space");
        let code_name = self.pool.add_utf8("Code").expect("pool space");
        let stack_map_name = self.pool.add_utf8("StackMapTable").expect("pool space");
        let mut infos = Vec::with_capacity(self.methods.len());
        for spec in &self.methods {
            let name_index = self.pool.add_utf8(&spec.name).expect("pool space");
            let descriptor_index = self.pool.add_utf8(&spec.descriptor).expect("pool space");
            let mut sub_attributes: Vec<(u16, Vec<u8>)> = Vec::new();
            if let Some(body) = &spec.stack_map {
                sub_attributes.push((stack_map_name, body.clone()));
            }
            let info = if spec.flags & ACC_NATIVE != 0 {
                let mut sink = Sink::new();
                sink.u16(spec.flags);
                sink.u16(name_index);
                sink.u16(descriptor_index);
                sink.u16(0);
                sink.into_bytes()
            } else {
                write_method_info(
                    spec.flags,
                    name_index,
                    descriptor_index,
                    code_name,
                    spec.max_stack,
                    spec.max_locals,
                    &spec.code,
                    &spec.exceptions,
                    &sub_attributes,
                )
                .expect("method assembly")
            };
            infos.push(info);
        }
        let mut sink = Sink::new();
        sink.u32(0xCAFE_BABE);
        sink.u16(0);
        sink.u16(61);
        self.pool.write(&mut sink);
        sink.u16(0x0021); // public super
        sink.u16(this_class);
        sink.u16(super_class);
        sink.u16(0); // interfaces
        sink.u16(0); // fields
        sink.u16(infos.len() as u16);
        for info in &infos {
            sink.bytes(info);
        }
        sink.u16(0); // class attributes
        sink.into_bytes()
    }
}
