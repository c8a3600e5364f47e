//! Linear abstract interpretation of bytecode, seeded by the method's
//! existing stack map frames.
//!
//! The rewriter needs the exact verifier state (locals and operand stack) at
//! every relocated invocation and at the instruction after it. Verified code
//! carries a frame at every branch target, so between frames the flow is
//! straight-line and a single forward pass suffices: reset the state at each
//! recorded frame, apply each instruction's stack effect, and snapshot the
//! state at the requested offsets. Code that no frame reaches after an
//! unconditional exit is unreachable; its sites report `None`.

use std::collections::{BTreeSet, HashMap};

use jclass::bytecode::{self, op};
use jclass::desc::{FieldType, MethodDescriptor, ReturnType};
use jclass::error::ClassFormatError;
use jclass::pool::{Constant, ConstantPool};
use jclass::stack_map::{verification_type_of, Frame, StackMapTable, VerificationType};

use crate::errors::RewriteError;

fn analysis(reason: &'static str) -> RewriteError {
    RewriteError::Analysis(reason)
}

/// Working state with slot-indexed locals: a long or double occupies its slot
/// plus a `Top` filler, which the list form drops again on conversion.
#[derive(Debug, Clone)]
struct State {
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

impl State {
    fn from_frame(frame: &Frame) -> Self {
        let mut locals = Vec::with_capacity(frame.locals.len() * 2);
        for &t in &frame.locals {
            locals.push(t);
            if t.slots() == 2 {
                locals.push(VerificationType::Top);
            }
        }
        State {
            locals,
            stack: frame.stack.clone(),
        }
    }

    fn to_frame(&self) -> Frame {
        let mut locals = Vec::with_capacity(self.locals.len());
        let mut i = 0;
        while i < self.locals.len() {
            let t = self.locals[i];
            locals.push(t);
            i += t.slots() as usize;
        }
        Frame::new(locals, self.stack.clone())
    }

    fn push(&mut self, t: VerificationType) {
        self.stack.push(t);
    }

    fn pop(&mut self) -> Result<VerificationType, RewriteError> {
        self.stack.pop().ok_or_else(|| analysis("operand stack underflow"))
    }

    /// Pops values totalling exactly `slots` stack slots, returned
    /// bottom-to-top.
    fn take_slots(&mut self, slots: u16) -> Result<Vec<VerificationType>, RewriteError> {
        let mut taken = Vec::new();
        let mut count = 0;
        while count < slots {
            let t = self.pop()?;
            count += t.slots();
            taken.push(t);
        }
        if count != slots {
            return Err(analysis("operand stack slot boundary mismatch"));
        }
        taken.reverse();
        Ok(taken)
    }

    fn push_all(&mut self, values: &[VerificationType]) {
        self.stack.extend_from_slice(values);
    }

    fn local(&self, index: usize) -> VerificationType {
        self.locals
            .get(index)
            .copied()
            .unwrap_or(VerificationType::Top)
    }

    fn set_local(&mut self, index: usize, t: VerificationType) {
        let wide = t.slots() == 2;
        let needed = index + if wide { 2 } else { 1 };
        if self.locals.len() < needed {
            self.locals.resize(needed, VerificationType::Top);
        }
        self.locals[index] = t;
        if wide {
            self.locals[index + 1] = VerificationType::Top;
        }
    }

    /// Initialization of an uninitialized reference: every copy of it, in
    /// locals and on the stack, becomes the constructed type.
    fn initialize(&mut self, from: VerificationType, to: VerificationType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if *slot == from {
                *slot = to;
            }
        }
    }
}

fn constant_type(
    pool: &mut ConstantPool,
    index: u16,
    wide: bool,
) -> Result<VerificationType, RewriteError> {
    let t = match pool.get(index)? {
        Constant::Integer(_) => VerificationType::Integer,
        Constant::Float(_) => VerificationType::Float,
        Constant::Long(_) => VerificationType::Long,
        Constant::Double(_) => VerificationType::Double,
        Constant::String { .. } => {
            let idx = pool.add_class("java/lang/String")?;
            VerificationType::Object(idx)
        }
        Constant::Class { .. } => {
            let idx = pool.add_class("java/lang/Class")?;
            VerificationType::Object(idx)
        }
        Constant::MethodHandle { .. } => {
            let idx = pool.add_class("java/lang/invoke/MethodHandle")?;
            VerificationType::Object(idx)
        }
        Constant::MethodType { .. } => {
            let idx = pool.add_class("java/lang/invoke/MethodType")?;
            VerificationType::Object(idx)
        }
        Constant::Dynamic {
            name_and_type_index,
            ..
        } => {
            let (_, desc) = pool.name_and_type(*name_and_type_index)?;
            let text = desc.decode()?.into_owned();
            let field: FieldType = text
                .parse()
                .map_err(|_| analysis("bad dynamic constant descriptor"))?;
            verification_type_of(&field, pool)?
        }
        _ => return Err(analysis("unloadable constant")),
    };
    if wide != (t.slots() == 2) {
        return Err(analysis("ldc width does not match the constant"));
    }
    Ok(t)
}

fn field_type_at(
    pool: &mut ConstantPool,
    ref_index: u16,
) -> Result<(FieldType, VerificationType), RewriteError> {
    let text = pool.member_ref(ref_index)?.descriptor.decode()?.into_owned();
    let field: FieldType = text
        .parse()
        .map_err(|_| analysis("bad field descriptor"))?;
    let t = verification_type_of(&field, pool)?;
    Ok((field, t))
}

fn array_element(
    pool: &mut ConstantPool,
    array: VerificationType,
) -> Result<VerificationType, RewriteError> {
    match array {
        VerificationType::Null => Ok(VerificationType::Null),
        VerificationType::Object(index) => {
            let name = pool.class_name(index)?.decode()?.into_owned();
            let element = name
                .strip_prefix('[')
                .ok_or_else(|| analysis("aaload on a non-array type"))?
                .to_owned();
            let field: FieldType = element
                .parse()
                .map_err(|_| analysis("bad array component descriptor"))?;
            verification_type_of(&field, pool).map_err(RewriteError::from)
        }
        _ => Err(analysis("aaload on a non-reference")),
    }
}

const ARITH_TYPES: [VerificationType; 4] = [
    VerificationType::Integer,
    VerificationType::Long,
    VerificationType::Float,
    VerificationType::Double,
];

#[rustfmt::skip]
const CONVERSION_TARGETS: [VerificationType; 13] = [
    // i2l, i2f, i2d
    VerificationType::Long, VerificationType::Float, VerificationType::Double,
    // l2i, l2f, l2d
    VerificationType::Integer, VerificationType::Float, VerificationType::Double,
    // f2i, f2l, f2d
    VerificationType::Integer, VerificationType::Long, VerificationType::Double,
    // d2i, d2l, d2f
    VerificationType::Integer, VerificationType::Long, VerificationType::Float,
    // i2b (i2c, i2s follow)
    VerificationType::Integer,
];

/// Computes the verifier state at each requested offset. `None` marks an
/// offset no frame and no fall-through path reaches.
pub(crate) fn compute_states(
    code: &[u8],
    pool: &mut ConstantPool,
    table: &StackMapTable,
    this_class: u16,
    want: &BTreeSet<u32>,
) -> Result<HashMap<u32, Option<Frame>>, RewriteError> {
    let mut out = HashMap::with_capacity(want.len());
    let mut state: Option<State> = Some(State::from_frame(table.initial()));
    let mut pc = 0usize;
    while pc < code.len() {
        if let Some(frame) = table.frame_at(pc as u32) {
            state = Some(State::from_frame(frame));
        }
        if want.contains(&(pc as u32)) {
            out.insert(pc as u32, state.as_ref().map(State::to_frame));
        }
        let length = bytecode::instruction_length(code, pc)?;
        if pc + length > code.len() {
            return Err(analysis("truncated instruction"));
        }
        if let Some(ref mut st) = state {
            if step(st, code, pc, pool, this_class)? {
                state = None;
            }
        }
        pc += length;
    }
    Ok(out)
}

/// Applies one instruction's effect; returns `true` when the flow does not
/// fall through.
fn step(
    st: &mut State,
    code: &[u8],
    pc: usize,
    pool: &mut ConstantPool,
    this_class: u16,
) -> Result<bool, RewriteError> {
    use VerificationType::*;
    let opcode = code[pc];
    match opcode {
        op::NOP => {}
        op::ACONST_NULL => st.push(Null),
        0x02..=0x08 => st.push(Integer),
        0x09 | 0x0a => st.push(Long),
        0x0b..=0x0d => st.push(Float),
        0x0e | 0x0f => st.push(Double),
        op::BIPUSH | op::SIPUSH => st.push(Integer),
        op::LDC => {
            let t = constant_type(pool, u16::from(code[pc + 1]), false)?;
            st.push(t);
        }
        op::LDC_W => {
            let t = constant_type(pool, bytecode::read_u16(code, pc + 1)?, false)?;
            st.push(t);
        }
        op::LDC2_W => {
            let t = constant_type(pool, bytecode::read_u16(code, pc + 1)?, true)?;
            st.push(t);
        }
        op::ILOAD => st.push(Integer),
        op::LLOAD => st.push(Long),
        op::FLOAD => st.push(Float),
        op::DLOAD => st.push(Double),
        op::ALOAD => {
            let local = st.local(code[pc + 1] as usize);
            st.push(local);
        }
        0x1a..=0x1d => st.push(Integer),
        0x1e..=0x21 => st.push(Long),
        0x22..=0x25 => st.push(Float),
        0x26..=0x29 => st.push(Double),
        0x2a..=0x2d => {
            let local = st.local((opcode - op::ALOAD_0) as usize);
            st.push(local);
        }
        // iaload, baload, caload, saload
        0x2e | 0x33 | 0x34 | 0x35 => {
            st.pop()?;
            st.pop()?;
            st.push(Integer);
        }
        0x2f => {
            st.pop()?;
            st.pop()?;
            st.push(Long);
        }
        0x30 => {
            st.pop()?;
            st.pop()?;
            st.push(Float);
        }
        0x31 => {
            st.pop()?;
            st.pop()?;
            st.push(Double);
        }
        op::AALOAD => {
            st.pop()?;
            let array = st.pop()?;
            let element = array_element(pool, array)?;
            st.push(element);
        }
        op::ISTORE | op::LSTORE | op::FSTORE | op::DSTORE | op::ASTORE => {
            let value = st.pop()?;
            st.set_local(code[pc + 1] as usize, value);
        }
        0x3b..=0x3e => {
            let value = st.pop()?;
            st.set_local((opcode - 0x3b) as usize, value);
        }
        0x3f..=0x42 => {
            let value = st.pop()?;
            st.set_local((opcode - 0x3f) as usize, value);
        }
        0x43..=0x46 => {
            let value = st.pop()?;
            st.set_local((opcode - 0x43) as usize, value);
        }
        0x47..=0x4a => {
            let value = st.pop()?;
            st.set_local((opcode - 0x47) as usize, value);
        }
        0x4b..=0x4e => {
            let value = st.pop()?;
            st.set_local((opcode - 0x4b) as usize, value);
        }
        // *astore: value, index, arrayref
        0x4f..=0x56 => {
            st.pop()?;
            st.pop()?;
            st.pop()?;
        }
        op::POP => {
            st.pop()?;
        }
        op::POP2 => {
            st.take_slots(2)?;
        }
        op::DUP => {
            let a = st.pop()?;
            st.push(a);
            st.push(a);
        }
        op::DUP_X1 => {
            let a = st.take_slots(1)?;
            let b = st.take_slots(1)?;
            st.push_all(&a);
            st.push_all(&b);
            st.push_all(&a);
        }
        op::DUP_X2 => {
            let a = st.take_slots(1)?;
            let b = st.take_slots(2)?;
            st.push_all(&a);
            st.push_all(&b);
            st.push_all(&a);
        }
        op::DUP2 => {
            let a = st.take_slots(2)?;
            st.push_all(&a);
            st.push_all(&a);
        }
        op::DUP2_X1 => {
            let a = st.take_slots(2)?;
            let b = st.take_slots(1)?;
            st.push_all(&a);
            st.push_all(&b);
            st.push_all(&a);
        }
        op::DUP2_X2 => {
            let a = st.take_slots(2)?;
            let b = st.take_slots(2)?;
            st.push_all(&a);
            st.push_all(&b);
            st.push_all(&a);
        }
        op::SWAP => {
            let a = st.take_slots(1)?;
            let b = st.take_slots(1)?;
            st.push_all(&a);
            st.push_all(&b);
        }
        0x60..=0x73 => {
            let t = ARITH_TYPES[((opcode - 0x60) % 4) as usize];
            st.pop()?;
            st.pop()?;
            st.push(t);
        }
        0x74..=0x77 => {
            let t = st.pop()?;
            st.push(t);
        }
        0x78..=0x7d => {
            // shift amount is always int; the value keeps its width
            st.pop()?;
            let value = st.pop()?;
            st.push(value);
        }
        0x7e..=0x83 => {
            let t = ARITH_TYPES[((opcode - 0x7e) % 2) as usize];
            st.pop()?;
            st.pop()?;
            st.push(t);
        }
        op::IINC => {}
        0x85..=0x93 => {
            st.pop()?;
            st.push(CONVERSION_TARGETS[((opcode - 0x85) as usize).min(12)]);
        }
        0x94..=0x98 => {
            st.pop()?;
            st.pop()?;
            st.push(Integer);
        }
        // if<cond>, ifnull, ifnonnull
        0x99..=0x9e | op::IFNULL | op::IFNONNULL => {
            st.pop()?;
        }
        // if_icmp<cond>, if_acmp<cond>
        0x9f..=0xa6 => {
            st.pop()?;
            st.pop()?;
        }
        op::GOTO | op::GOTO_W => return Ok(true),
        op::JSR | op::JSR_W | op::RET => return Err(analysis("jsr/ret is unsupported")),
        op::TABLESWITCH | op::LOOKUPSWITCH => {
            st.pop()?;
            return Ok(true);
        }
        op::IRETURN | op::LRETURN | op::FRETURN | op::DRETURN | op::ARETURN => {
            st.pop()?;
            return Ok(true);
        }
        op::RETURN => return Ok(true),
        op::GETSTATIC => {
            let (_, t) = field_type_at(pool, bytecode::read_u16(code, pc + 1)?)?;
            st.push(t);
        }
        op::PUTSTATIC => {
            let (field, _) = field_type_at(pool, bytecode::read_u16(code, pc + 1)?)?;
            st.take_slots(field.slots())?;
        }
        op::GETFIELD => {
            let (_, t) = field_type_at(pool, bytecode::read_u16(code, pc + 1)?)?;
            st.pop()?;
            st.push(t);
        }
        op::PUTFIELD => {
            let (field, _) = field_type_at(pool, bytecode::read_u16(code, pc + 1)?)?;
            st.take_slots(field.slots())?;
            st.pop()?;
        }
        op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKESTATIC | op::INVOKEINTERFACE => {
            let ref_index = bytecode::read_u16(code, pc + 1)?;
            let (owner_class_index, descriptor, is_init) = {
                let mref = pool.member_ref(ref_index)?;
                let descriptor = MethodDescriptor::parse_utf8(mref.descriptor)?;
                let is_init = *mref.name == *"<init>";
                let owner_index = match pool.get(ref_index)? {
                    Constant::Methodref { class_index, .. }
                    | Constant::InterfaceMethodref { class_index, .. } => *class_index,
                    _ => return Err(analysis("invoke without a method reference")),
                };
                (owner_index, descriptor, is_init)
            };
            st.take_slots(descriptor.argument_slots())?;
            if opcode != op::INVOKESTATIC {
                let receiver = st.pop()?;
                if opcode == op::INVOKESPECIAL && is_init {
                    match receiver {
                        UninitializedThis => {
                            st.initialize(UninitializedThis, Object(this_class));
                        }
                        Uninitialized(offset) => {
                            st.initialize(Uninitialized(offset), Object(owner_class_index));
                        }
                        _ => return Err(analysis("<init> on an initialized reference")),
                    }
                }
            }
            if let ReturnType::Value(ret) = &descriptor.return_type {
                let t = verification_type_of(ret, pool)?;
                st.push(t);
            }
        }
        op::INVOKEDYNAMIC => {
            let ref_index = bytecode::read_u16(code, pc + 1)?;
            let (_, _, desc) = pool.invoke_dynamic(ref_index)?;
            let descriptor = MethodDescriptor::parse_utf8(desc)?;
            st.take_slots(descriptor.argument_slots())?;
            if let ReturnType::Value(ret) = &descriptor.return_type {
                let t = verification_type_of(ret, pool)?;
                st.push(t);
            }
        }
        op::NEW => {
            st.push(Uninitialized(pc as u16));
        }
        op::NEWARRAY => {
            st.pop()?;
            let descriptor = match code[pc + 1] {
                4 => "[Z",
                5 => "[C",
                6 => "[F",
                7 => "[D",
                8 => "[B",
                9 => "[S",
                10 => "[I",
                11 => "[J",
                _ => return Err(analysis("bad newarray component")),
            };
            let idx = pool.add_class(descriptor)?;
            st.push(Object(idx));
        }
        op::ANEWARRAY => {
            st.pop()?;
            let component_index = bytecode::read_u16(code, pc + 1)?;
            let component = pool.class_name(component_index)?.decode()?.into_owned();
            let descriptor = if component.starts_with('[') {
                format!("[{component}")
            } else {
                format!("[L{component};")
            };
            let idx = pool.add_class(&descriptor)?;
            st.push(Object(idx));
        }
        op::ARRAYLENGTH => {
            st.pop()?;
            st.push(Integer);
        }
        op::ATHROW => {
            st.pop()?;
            return Ok(true);
        }
        op::CHECKCAST => {
            st.pop()?;
            st.push(Object(bytecode::read_u16(code, pc + 1)?));
        }
        op::INSTANCEOF => {
            st.pop()?;
            st.push(Integer);
        }
        op::MONITORENTER | op::MONITOREXIT => {
            st.pop()?;
        }
        op::WIDE => {
            let index = bytecode::read_u16(code, pc + 2)? as usize;
            match code[pc + 1] {
                op::ILOAD => st.push(Integer),
                op::LLOAD => st.push(Long),
                op::FLOAD => st.push(Float),
                op::DLOAD => st.push(Double),
                op::ALOAD => {
                    let local = st.local(index);
                    st.push(local);
                }
                op::ISTORE | op::LSTORE | op::FSTORE | op::DSTORE | op::ASTORE => {
                    let value = st.pop()?;
                    st.set_local(index, value);
                }
                op::IINC => {}
                op::RET => return Err(analysis("jsr/ret is unsupported")),
                _ => return Err(analysis("bad wide form")),
            }
        }
        op::MULTIANEWARRAY => {
            let dims = code[pc + 3];
            for _ in 0..dims {
                st.pop()?;
            }
            st.push(Object(bytecode::read_u16(code, pc + 1)?));
        }
        _ => {
            return Err(RewriteError::Format(ClassFormatError::UnknownOpcode {
                opcode,
                offset: pc as u32,
            }))
        }
    }
    Ok(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use jclass::stack_map::Frame;
    use VerificationType::*;

    fn pool_with_system_exit() -> ConstantPool {
        let mut pool = ConstantPool::new();
        pool.add_method_ref("java/lang/System", "exit", "(I)V").unwrap();
        pool
    }

    #[test]
    fn straight_line_states() {
        let mut pool = pool_with_system_exit();
        let exit_ref = pool.add_method_ref("java/lang/System", "exit", "(I)V").unwrap();
        let code = [
            op::ICONST_0,
            op::INVOKESTATIC,
            (exit_ref >> 8) as u8,
            exit_ref as u8,
            op::RETURN,
        ];
        let table = StackMapTable::from_initial(Frame::new(vec![], vec![]));
        let want: BTreeSet<u32> = [1u32, 4u32].into_iter().collect();
        let states = compute_states(&code, &mut pool, &table, 1, &want).unwrap();
        let at_call = states[&1].as_ref().unwrap();
        assert_eq!(at_call.stack, vec![Integer]);
        let after_call = states[&4].as_ref().unwrap();
        assert!(after_call.stack.is_empty());
    }

    #[test]
    fn code_after_goto_without_frame_is_unreachable() {
        let mut pool = pool_with_system_exit();
        // goto +4; return (unreachable); return
        let code = [op::GOTO, 0, 4, op::RETURN, op::RETURN];
        let table = StackMapTable::from_initial(Frame::new(vec![], vec![]));
        let want: BTreeSet<u32> = [3u32].into_iter().collect();
        let states = compute_states(&code, &mut pool, &table, 1, &want).unwrap();
        assert!(states[&3].is_none());
    }

    #[test]
    fn frames_reseed_the_state() {
        let mut pool = pool_with_system_exit();
        // goto +4; iconst_0 at a frame offset; return
        let code = [op::GOTO, 0, 4, op::ICONST_0, op::RETURN];
        let mut table = StackMapTable::from_initial(Frame::new(vec![], vec![]));
        table.insert_frame(3, Frame::new(vec![], vec![]));
        let want: BTreeSet<u32> = [3u32, 4u32].into_iter().collect();
        let states = compute_states(&code, &mut pool, &table, 1, &want).unwrap();
        assert!(states[&3].as_ref().unwrap().stack.is_empty());
        assert_eq!(states[&4].as_ref().unwrap().stack, vec![Integer]);
    }

    #[test]
    fn constructor_initializes_all_copies() {
        let mut pool = pool_with_system_exit();
        let string_class = pool.add_class("java/lang/String").unwrap();
        let init_ref = pool
            .add_method_ref("java/lang/String", "<init>", "()V")
            .unwrap();
        let code = [
            op::NEW,
            (string_class >> 8) as u8,
            string_class as u8,
            op::DUP,
            op::INVOKESPECIAL,
            (init_ref >> 8) as u8,
            init_ref as u8,
            op::RETURN,
        ];
        let table = StackMapTable::from_initial(Frame::new(vec![], vec![]));
        let want: BTreeSet<u32> = [4u32, 7u32].into_iter().collect();
        let states = compute_states(&code, &mut pool, &table, 1, &want).unwrap();
        assert_eq!(
            states[&4].as_ref().unwrap().stack,
            vec![Uninitialized(0), Uninitialized(0)]
        );
        assert_eq!(states[&7].as_ref().unwrap().stack, vec![Object(string_class)]);
    }
}
