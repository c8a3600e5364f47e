//! Replacement-bytecode emission for each deny action.
//!
//! Emitters produce either a short in-place sequence (branch-free, fits the
//! original instruction window) or a trailer [`Block`] reached by `goto`.
//! Offsets of back-branches and of internal branch targets are reported to
//! the planner, which patches distances and inserts stack map frames.

use jclass::bytecode::op;
use jclass::desc::{FieldType, MethodDescriptor, PrimitiveType, ReturnType};
use jclass::pool::ConstantPool;

use crate::errors::RewriteError;
use crate::policy::{shim, SHIM_CLASS};
use crate::rules::{ConstValue, DenyAction, MethodRef};

/// A tiny linear assembler.
#[derive(Default)]
pub(super) struct Asm {
    pub bytes: Vec<u8>,
}

impl Asm {
    fn op(&mut self, opcode: u8) {
        self.bytes.push(opcode);
    }

    fn op_u16(&mut self, opcode: u8, operand: u16) {
        self.bytes.push(opcode);
        self.bytes.extend_from_slice(&operand.to_be_bytes());
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn patch_i16(&mut self, at: usize, value: i16) {
        self.bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// A local-variable instruction, using the wide form past index 255.
    fn local(&mut self, opcode: u8, slot: u16) {
        if slot <= u16::from(u8::MAX) {
            self.bytes.push(opcode);
            self.bytes.push(slot as u8);
        } else {
            self.bytes.push(op::WIDE);
            self.bytes.push(opcode);
            self.bytes.extend_from_slice(&slot.to_be_bytes());
        }
    }
}

/// One emitted trailer block. `back_gotos` are offsets of `goto` opcodes
/// whose operands must be patched to reach the instruction after the site;
/// `entry_frames` are internal offsets that need a frame equal to the
/// site-entry state.
pub(super) struct Block {
    pub bytes: Vec<u8>,
    pub back_gotos: Vec<usize>,
    pub entry_frames: Vec<usize>,
    pub temp_slots: u16,
    pub extra_stack: u16,
}

/// Everything the emitters need to know about one denied site.
pub(super) struct SiteInfo {
    pub owner: String,
    pub name: String,
    pub descriptor_text: String,
    pub descriptor: MethodDescriptor,
    pub has_receiver: bool,
    pub is_init: bool,
    /// The original instruction bytes, re-executed on the allowed path of a
    /// checked denial.
    pub original: Vec<u8>,
}

impl SiteInfo {
    fn member_key(&self) -> String {
        format!("{}.{}{}", self.owner, self.name, self.descriptor_text)
    }
}

fn discard_arguments(asm: &mut Asm, site: &SiteInfo) {
    for param in site.descriptor.parameters.iter().rev() {
        asm.op(if param.slots() == 2 { op::POP2 } else { op::POP });
    }
    // an uninitialized <init> receiver stays; the throw abandons it
    if site.has_receiver && !site.is_init {
        asm.op(op::POP);
    }
}

fn emit_throw(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    class_name: &str,
    message: Option<&str>,
) -> Result<(), RewriteError> {
    let class_index = pool.add_class(class_name)?;
    asm.op_u16(op::NEW, class_index);
    asm.op(op::DUP);
    match message {
        Some(text) => {
            let string_index = pool.add_string(text)?;
            asm.op_u16(op::LDC_W, string_index);
            let init = pool.add_method_ref(class_name, "<init>", "(Ljava/lang/String;)V")?;
            asm.op_u16(op::INVOKESPECIAL, init);
        }
        None => {
            let init = pool.add_method_ref(class_name, "<init>", "()V")?;
            asm.op_u16(op::INVOKESPECIAL, init);
        }
    }
    asm.op(op::ATHROW);
    Ok(())
}

fn push_const(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    value: &ConstValue,
) -> Result<(), RewriteError> {
    match value {
        ConstValue::Null => asm.op(op::ACONST_NULL),
        ConstValue::Bool(b) => asm.op(if *b { op::ICONST_0 + 1 } else { op::ICONST_0 }),
        ConstValue::Char(c) => push_int(asm, pool, i32::from(*c))?,
        ConstValue::Byte(b) => push_int(asm, pool, i32::from(*b))?,
        ConstValue::Short(s) => push_int(asm, pool, i32::from(*s))?,
        ConstValue::Int(i) => push_int(asm, pool, *i)?,
        ConstValue::Long(l) => {
            if *l == 0 || *l == 1 {
                asm.op(op::LCONST_0 + *l as u8);
            } else {
                let index = pool.add_long(*l)?;
                asm.op_u16(op::LDC2_W, index);
            }
        }
        ConstValue::Float(f) => {
            if *f == 0.0 && f.is_sign_positive() {
                asm.op(op::FCONST_0);
            } else {
                let index = pool.add_float(*f)?;
                asm.op_u16(op::LDC_W, index);
            }
        }
        ConstValue::Double(d) => {
            if *d == 0.0 && d.is_sign_positive() {
                asm.op(op::DCONST_0);
            } else {
                let index = pool.add_double(*d)?;
                asm.op_u16(op::LDC2_W, index);
            }
        }
        ConstValue::Str(s) => {
            let index = pool.add_string(s)?;
            asm.op_u16(op::LDC_W, index);
        }
    }
    Ok(())
}

fn push_int(asm: &mut Asm, pool: &mut ConstantPool, value: i32) -> Result<(), RewriteError> {
    if (-1..=5).contains(&value) {
        asm.op((op::ICONST_0 as i32 + value) as u8);
    } else if let Ok(b) = i8::try_from(value) {
        asm.op(op::BIPUSH);
        asm.bytes.push(b as u8);
    } else if let Ok(s) = i16::try_from(value) {
        asm.op(op::SIPUSH);
        asm.bytes.extend_from_slice(&s.to_be_bytes());
    } else {
        let index = pool.add_integer(value)?;
        asm.op_u16(op::LDC_W, index);
    }
    Ok(())
}

fn value_fits(value: &ConstValue, return_type: &ReturnType) -> bool {
    let field = match return_type {
        ReturnType::Void => return true, // nothing is pushed
        ReturnType::Value(t) => t,
    };
    match value {
        ConstValue::Null | ConstValue::Str(_) => field.is_reference(),
        ConstValue::Bool(_)
        | ConstValue::Char(_)
        | ConstValue::Byte(_)
        | ConstValue::Short(_)
        | ConstValue::Int(_) => matches!(
            field,
            FieldType::Base(
                PrimitiveType::Boolean
                    | PrimitiveType::Char
                    | PrimitiveType::Byte
                    | PrimitiveType::Short
                    | PrimitiveType::Int
            )
        ),
        ConstValue::Long(_) => matches!(field, FieldType::Base(PrimitiveType::Long)),
        ConstValue::Float(_) => matches!(field, FieldType::Base(PrimitiveType::Float)),
        ConstValue::Double(_) => matches!(field, FieldType::Base(PrimitiveType::Double)),
    }
}

fn push_value(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    value: &ConstValue,
    return_type: &ReturnType,
) -> Result<(), RewriteError> {
    if !value_fits(value, return_type) {
        return Err(RewriteError::ValueTypeMismatch("value"));
    }
    if !matches!(return_type, ReturnType::Void) {
        push_const(asm, pool, value)?;
    }
    Ok(())
}

/// Empty-container factories per declared return type; anything without a
/// well-known empty representation degrades to `null`.
fn push_empty(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    return_type: &ReturnType,
) -> Result<(), RewriteError> {
    let field = match return_type {
        ReturnType::Void => return Ok(()),
        ReturnType::Value(t) => t,
    };
    match field {
        FieldType::Base(PrimitiveType::Long) => asm.op(op::LCONST_0),
        FieldType::Base(PrimitiveType::Float) => asm.op(op::FCONST_0),
        FieldType::Base(PrimitiveType::Double) => asm.op(op::DCONST_0),
        FieldType::Base(_) => asm.op(op::ICONST_0),
        FieldType::Array(component) => {
            asm.op(op::ICONST_0);
            match &**component {
                FieldType::Base(p) => {
                    asm.op(op::NEWARRAY);
                    asm.bytes.push(match p {
                        PrimitiveType::Boolean => 4,
                        PrimitiveType::Char => 5,
                        PrimitiveType::Float => 6,
                        PrimitiveType::Double => 7,
                        PrimitiveType::Byte => 8,
                        PrimitiveType::Short => 9,
                        PrimitiveType::Int => 10,
                        PrimitiveType::Long => 11,
                    });
                }
                component => {
                    let name = component
                        .class_constant_name()
                        .expect("reference array component");
                    let index = pool.add_class(&name)?;
                    asm.op_u16(op::ANEWARRAY, index);
                }
            }
        }
        FieldType::Object(name) => {
            // (owner, name, descriptor, owner-is-interface)
            let factory: Option<(&str, &str, &str, bool)> = match name.as_str() {
                "java/lang/String" => None,
                "java/util/List" | "java/util/Collection" | "java/lang/Iterable" => {
                    Some(("java/util/List", "of", "()Ljava/util/List;", true))
                }
                "java/util/Set" => Some(("java/util/Set", "of", "()Ljava/util/Set;", true)),
                "java/util/Map" => Some(("java/util/Map", "of", "()Ljava/util/Map;", true)),
                "java/util/Iterator" => Some((
                    "java/util/Collections",
                    "emptyIterator",
                    "()Ljava/util/Iterator;",
                    false,
                )),
                "java/util/Enumeration" => Some((
                    "java/util/Collections",
                    "emptyEnumeration",
                    "()Ljava/util/Enumeration;",
                    false,
                )),
                "java/util/Optional" => {
                    Some(("java/util/Optional", "empty", "()Ljava/util/Optional;", false))
                }
                "java/util/stream/Stream" => Some((
                    "java/util/stream/Stream",
                    "empty",
                    "()Ljava/util/stream/Stream;",
                    true,
                )),
                _ => return Ok(asm.op(op::ACONST_NULL)),
            };
            match factory {
                Some((owner, method, descriptor, interface)) => {
                    let index = if interface {
                        pool.add_interface_method_ref(owner, method, descriptor)?
                    } else {
                        pool.add_method_ref(owner, method, descriptor)?
                    };
                    asm.op_u16(op::INVOKESTATIC, index);
                }
                None => {
                    let index = pool.add_string("")?;
                    asm.op_u16(op::LDC_W, index);
                }
            }
        }
    }
    Ok(())
}

fn argument_slot_layout(parameters: &[FieldType], base: u16) -> Vec<u16> {
    let mut slots = Vec::with_capacity(parameters.len());
    let mut next = base;
    for param in parameters {
        slots.push(next);
        next += param.slots();
    }
    slots
}

fn load_op(param: &FieldType) -> u8 {
    match param {
        FieldType::Base(PrimitiveType::Long) => op::LLOAD,
        FieldType::Base(PrimitiveType::Float) => op::FLOAD,
        FieldType::Base(PrimitiveType::Double) => op::DLOAD,
        FieldType::Base(_) => op::ILOAD,
        _ => op::ALOAD,
    }
}

fn store_op(param: &FieldType) -> u8 {
    match param {
        FieldType::Base(PrimitiveType::Long) => op::LSTORE,
        FieldType::Base(PrimitiveType::Float) => op::FSTORE,
        FieldType::Base(PrimitiveType::Double) => op::DSTORE,
        FieldType::Base(_) => op::ISTORE,
        _ => op::ASTORE,
    }
}

/// Stores the stacked arguments into temporaries past `base`, top of stack
/// first; returns the slot count used.
fn spill_arguments(asm: &mut Asm, parameters: &[FieldType], base: u16) -> u16 {
    let slots = argument_slot_layout(parameters, base);
    for (param, slot) in parameters.iter().zip(&slots).rev() {
        asm.local(store_op(param), *slot);
    }
    parameters.iter().map(FieldType::slots).sum()
}

fn reload_arguments(asm: &mut Asm, parameters: &[FieldType], base: u16) {
    let slots = argument_slot_layout(parameters, base);
    for (param, slot) in parameters.iter().zip(&slots) {
        asm.local(load_op(param), *slot);
    }
}

/// Whether a custom target wants the caller class prepended: one extra
/// leading `java/lang/Class` parameter relative to the site's shape.
fn custom_wants_caller(
    custom: &MethodDescriptor,
    site_parameter_count: usize,
) -> bool {
    custom.parameters.len() == site_parameter_count + 1
        && custom.parameters[0] == FieldType::Object("java/lang/Class".into())
}

fn emit_custom_call(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    target: &MethodRef,
    site: &SiteInfo,
    this_class: u16,
    temp_base: u16,
) -> Result<(u16, u16), RewriteError> {
    let custom_desc: MethodDescriptor = target
        .descriptor
        .parse()
        .map_err(RewriteError::Format)?;
    let site_params = site.descriptor.parameters.len() + usize::from(site.has_receiver);
    let target_index =
        pool.add_method_ref(&target.owner, &target.name, &target.descriptor)?;
    let args_slots: u16 = site.descriptor.argument_slots();
    if custom_wants_caller(&custom_desc, site_params) {
        // the caller class goes under the arguments: spill, push, reload
        let temp_slots = spill_arguments(asm, &site.descriptor.parameters, temp_base);
        asm.op_u16(op::LDC_W, this_class);
        reload_arguments(asm, &site.descriptor.parameters, temp_base);
        asm.op_u16(op::INVOKESTATIC, target_index);
        Ok((temp_slots, args_slots + 2))
    } else {
        asm.op_u16(op::INVOKESTATIC, target_index);
        Ok((0, args_slots + 1))
    }
}

fn predicate_call(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    predicate: &MethodRef,
    this_class: u16,
) -> Result<(), RewriteError> {
    let desc: MethodDescriptor = predicate
        .descriptor
        .parse()
        .map_err(RewriteError::Format)?;
    if !desc.parameters.is_empty() {
        asm.op_u16(op::LDC_W, this_class);
    }
    let index =
        pool.add_method_ref(&predicate.owner, &predicate.name, &predicate.descriptor)?;
    asm.op_u16(op::INVOKESTATIC, index);
    Ok(())
}

fn oracle_call(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    site: &SiteInfo,
) -> Result<(), RewriteError> {
    let owner_index = pool.add_string(&site.owner)?;
    let member_index =
        pool.add_string(&format!("{}{}", site.name, site.descriptor_text))?;
    asm.op_u16(op::LDC_W, owner_index);
    asm.op_u16(op::LDC_W, member_index);
    let check = pool.add_method_ref(
        SHIM_CLASS,
        shim::IS_CALLER_ALLOWED.0,
        shim::IS_CALLER_ALLOWED.1,
    )?;
    asm.op_u16(op::INVOKESTATIC, check);
    Ok(())
}

/// The tail of a denial: what runs once the decision is final. Throws end
/// the block; producing variants record a back-goto.
fn emit_deny_tail(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    action: &DenyAction,
    site: &SiteInfo,
    this_class: u16,
    temp_base: u16,
    block: &mut BlockState,
) -> Result<(), RewriteError> {
    match action {
        DenyAction::Exception {
            class_name,
            message,
        } => {
            discard_arguments(asm, site);
            emit_throw(asm, pool, class_name, message.as_deref())?;
        }
        DenyAction::Value(value) => {
            discard_arguments(asm, site);
            push_value(asm, pool, value, &site.descriptor.return_type)?;
            block.back_goto(asm);
        }
        DenyAction::Empty => {
            discard_arguments(asm, site);
            push_empty(asm, pool, &site.descriptor.return_type)?;
            block.back_goto(asm);
        }
        DenyAction::Custom(target) => {
            let (temps, stack) =
                emit_custom_call(asm, pool, target, site, this_class, temp_base)?;
            block.temp_slots = block.temp_slots.max(temps);
            block.extra_stack = block.extra_stack.max(stack);
            block.back_goto(asm);
        }
        DenyAction::Dynamic | DenyAction::CheckedDynamic => {
            // the oracle answered false already; deny with the standard throw
            discard_arguments(asm, site);
            emit_throw(asm, pool, "java/lang/SecurityException", None)?;
        }
        DenyAction::Checked { .. } | DenyAction::Multi(_) => {
            return Err(RewriteError::Analysis("unsupported nested deny action"));
        }
    }
    Ok(())
}

#[derive(Default)]
struct BlockState {
    back_gotos: Vec<usize>,
    entry_frames: Vec<usize>,
    temp_slots: u16,
    extra_stack: u16,
}

impl BlockState {
    fn back_goto(&mut self, asm: &mut Asm) {
        self.back_gotos.push(asm.len());
        asm.op(op::GOTO);
        asm.bytes.extend_from_slice(&[0, 0]);
    }
}

/// Emits the trailer block for one denied site.
pub(super) fn emit_site_block(
    pool: &mut ConstantPool,
    site: &SiteInfo,
    action: &DenyAction,
    this_class: u16,
    temp_base: u16,
) -> Result<Block, RewriteError> {
    let mut asm = Asm::default();
    let mut block = BlockState::default();
    match action {
        DenyAction::Checked { predicate, inner } => {
            predicate_call(&mut asm, pool, predicate, this_class)?;
            let branch_at = asm.len();
            asm.op(op::IFEQ);
            asm.bytes.extend_from_slice(&[0, 0]);
            asm.bytes.extend_from_slice(&site.original);
            block.back_goto(&mut asm);
            let deny_label = asm.len();
            asm.patch_i16(
                branch_at + 1,
                i16::try_from(deny_label - branch_at)
                    .map_err(|_| RewriteError::BranchOutOfRange)?,
            );
            block.entry_frames.push(deny_label);
            block.extra_stack = block.extra_stack.max(2);
            emit_deny_tail(&mut asm, pool, inner, site, this_class, temp_base, &mut block)?;
        }
        DenyAction::Multi(_) => {
            if !site.has_receiver {
                return Err(RewriteError::Analysis("multi action on a static target"));
            }
            let temps = spill_arguments(&mut asm, &site.descriptor.parameters, temp_base);
            asm.op(op::DUP);
            let key_index = pool.add_string(&site.member_key())?;
            asm.op_u16(op::LDC_W, key_index);
            let check = pool.add_method_ref(
                SHIM_CLASS,
                shim::CHECK_RECEIVER.0,
                shim::CHECK_RECEIVER.1,
            )?;
            asm.op_u16(op::INVOKESTATIC, check);
            reload_arguments(&mut asm, &site.descriptor.parameters, temp_base);
            asm.bytes.extend_from_slice(&site.original);
            block.back_goto(&mut asm);
            block.temp_slots = temps;
            block.extra_stack = site.descriptor.argument_slots() + 2;
        }
        DenyAction::Dynamic | DenyAction::CheckedDynamic => {
            oracle_call(&mut asm, pool, site)?;
            let branch_at = asm.len();
            asm.op(op::IFEQ);
            asm.bytes.extend_from_slice(&[0, 0]);
            asm.bytes.extend_from_slice(&site.original);
            block.back_goto(&mut asm);
            let deny_label = asm.len();
            asm.patch_i16(
                branch_at + 1,
                i16::try_from(deny_label - branch_at)
                    .map_err(|_| RewriteError::BranchOutOfRange)?,
            );
            block.entry_frames.push(deny_label);
            block.extra_stack = 2;
            discard_arguments(&mut asm, site);
            emit_throw(&mut asm, pool, "java/lang/SecurityException", None)?;
        }
        other => {
            emit_deny_tail(&mut asm, pool, other, site, this_class, temp_base, &mut block)?;
        }
    }
    block.extra_stack = block.extra_stack.max(3);
    Ok(Block {
        bytes: asm.bytes,
        back_gotos: block.back_gotos,
        entry_frames: block.entry_frames,
        temp_slots: block.temp_slots,
        extra_stack: block.extra_stack,
    })
}

/// A branch-free replacement that fits the instruction window, if the action
/// admits one. Padded with `nop` by the caller.
pub(super) fn try_inline(
    pool: &mut ConstantPool,
    site: &SiteInfo,
    action: &DenyAction,
    window: usize,
) -> Result<Option<Vec<u8>>, RewriteError> {
    let candidate = match action {
        DenyAction::Value(value) if !site.is_init => {
            let mut asm = Asm::default();
            discard_arguments(&mut asm, site);
            push_value(&mut asm, pool, value, &site.descriptor.return_type)?;
            asm.bytes
        }
        DenyAction::Empty if !site.is_init => {
            let mut asm = Asm::default();
            discard_arguments(&mut asm, site);
            push_empty(&mut asm, pool, &site.descriptor.return_type)?;
            asm.bytes
        }
        _ => return Ok(None),
    };
    Ok((candidate.len() <= window).then_some(candidate))
}

/// An in-place rewrite of an `ldc_w` of a denied method-handle constant.
pub(super) fn denied_handle_ldc(pool: &mut ConstantPool) -> Result<Vec<u8>, RewriteError> {
    let index = pool.add_method_ref(
        SHIM_CLASS,
        shim::DENIED_METHOD_HANDLE.0,
        shim::DENIED_METHOD_HANDLE.1,
    )?;
    let mut asm = Asm::default();
    asm.op_u16(op::INVOKESTATIC, index);
    Ok(asm.bytes)
}

/// The assembled method-entry check for a target-side denial, padded with
/// `nop` to a multiple of four bytes so switch-padding downstream is
/// preserved.
pub(super) struct Prologue {
    pub bytes: Vec<u8>,
    pub extra_stack: u16,
}

pub(super) fn emit_prologue(
    pool: &mut ConstantPool,
    action: &DenyAction,
    owner_internal: &str,
    name: &str,
    descriptor_text: &str,
    descriptor: &MethodDescriptor,
    is_static: bool,
    this_class: u16,
) -> Result<Prologue, RewriteError> {
    let mut asm = Asm::default();
    let mut extra_stack: u16 = 3;
    // branch opcode positions whose target is the padded prologue end
    let mut fall_branches: Vec<usize> = Vec::new();
    match action {
        DenyAction::Exception {
            class_name,
            message,
        } => emit_throw(&mut asm, pool, class_name, message.as_deref())?,
        DenyAction::Value(value) => {
            push_value(&mut asm, pool, value, &descriptor.return_type)?;
            asm.op(return_opcode(&descriptor.return_type));
        }
        DenyAction::Empty => {
            push_empty(&mut asm, pool, &descriptor.return_type)?;
            asm.op(return_opcode(&descriptor.return_type));
        }
        DenyAction::Custom(target) => {
            let custom_desc: MethodDescriptor = target
                .descriptor
                .parse()
                .map_err(RewriteError::Format)?;
            if custom_desc.return_type != descriptor.return_type {
                return Err(RewriteError::ValueTypeMismatch("custom"));
            }
            let own_params = descriptor.parameters.len() + usize::from(!is_static);
            if custom_wants_caller(&custom_desc, own_params) {
                asm.op_u16(op::LDC_W, this_class);
            }
            load_own_arguments(&mut asm, descriptor, is_static);
            let index =
                pool.add_method_ref(&target.owner, &target.name, &target.descriptor)?;
            asm.op_u16(op::INVOKESTATIC, index);
            asm.op(return_opcode(&descriptor.return_type));
            extra_stack =
                extra_stack.max(descriptor.argument_slots() + u16::from(!is_static) + 2);
        }
        DenyAction::Checked { predicate, inner } => {
            predicate_call(&mut asm, pool, predicate, this_class)?;
            fall_branches.push(asm.len());
            asm.op(op::IFNE);
            asm.bytes.extend_from_slice(&[0, 0]);
            emit_prologue_deny(&mut asm, pool, inner, descriptor)?;
        }
        DenyAction::Dynamic | DenyAction::CheckedDynamic | DenyAction::Multi(_) => {
            let owner_index = pool.add_string(owner_internal)?;
            let member_index =
                pool.add_string(&format!("{name}{descriptor_text}"))?;
            asm.op_u16(op::LDC_W, owner_index);
            asm.op_u16(op::LDC_W, member_index);
            let check = pool.add_method_ref(
                SHIM_CLASS,
                shim::IS_CALLER_ALLOWED.0,
                shim::IS_CALLER_ALLOWED.1,
            )?;
            asm.op_u16(op::INVOKESTATIC, check);
            fall_branches.push(asm.len());
            asm.op(op::IFNE);
            asm.bytes.extend_from_slice(&[0, 0]);
            emit_throw(&mut asm, pool, "java/lang/SecurityException", None)?;
        }
    }
    // Pad at the front: trailing nops after a throw or return would be
    // unreachable code the verifier has no frame for.
    let pad = (4 - asm.len() % 4) % 4;
    let mut bytes = vec![op::NOP; pad];
    bytes.extend_from_slice(&asm.bytes);
    let end = bytes.len();
    for branch_at in fall_branches {
        let branch_at = branch_at + pad;
        let distance = i16::try_from(end - branch_at)
            .map_err(|_| RewriteError::BranchOutOfRange)?;
        bytes[branch_at + 1..branch_at + 3].copy_from_slice(&distance.to_be_bytes());
    }
    Ok(Prologue { bytes, extra_stack })
}

fn emit_prologue_deny(
    asm: &mut Asm,
    pool: &mut ConstantPool,
    action: &DenyAction,
    descriptor: &MethodDescriptor,
) -> Result<(), RewriteError> {
    match action {
        DenyAction::Exception {
            class_name,
            message,
        } => emit_throw(asm, pool, class_name, message.as_deref()),
        DenyAction::Value(value) => {
            push_value(asm, pool, value, &descriptor.return_type)?;
            asm.op(return_opcode(&descriptor.return_type));
            Ok(())
        }
        DenyAction::Empty => {
            push_empty(asm, pool, &descriptor.return_type)?;
            asm.op(return_opcode(&descriptor.return_type));
            Ok(())
        }
        _ => emit_throw(asm, pool, "java/lang/SecurityException", None),
    }
}

pub(super) fn return_opcode(return_type: &ReturnType) -> u8 {
    match return_type {
        ReturnType::Void => op::RETURN,
        ReturnType::Value(FieldType::Base(PrimitiveType::Long)) => op::LRETURN,
        ReturnType::Value(FieldType::Base(PrimitiveType::Float)) => op::FRETURN,
        ReturnType::Value(FieldType::Base(PrimitiveType::Double)) => op::DRETURN,
        ReturnType::Value(FieldType::Base(_)) => op::IRETURN,
        ReturnType::Value(_) => op::ARETURN,
    }
}

/// The minimal always-throwing body used for poisoned classes and for flatly
/// denied native methods.
pub(super) fn throw_only_body(pool: &mut ConstantPool) -> Result<Vec<u8>, RewriteError> {
    let mut asm = Asm::default();
    emit_throw(&mut asm, pool, "java/lang/SecurityException", None)?;
    Ok(asm.bytes)
}

/// The body of the synthetic wrapper standing in for a conditionally denied
/// native method: check, deny, or delegate to the [`NATIVE_PREFIX`]-renamed
/// implementation.
pub(super) struct WrapperBody {
    pub code: Vec<u8>,
    /// Offset of the delegate label, which needs an entry-state frame.
    pub frame_offset: Option<u32>,
    pub max_stack: u16,
}

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_native_wrapper(
    pool: &mut ConstantPool,
    action: &DenyAction,
    owner_internal: &str,
    name: &str,
    descriptor_text: &str,
    descriptor: &MethodDescriptor,
    is_static: bool,
    this_class: u16,
) -> Result<WrapperBody, RewriteError> {
    let mut asm = Asm::default();
    let mut branch_at: Option<usize> = None;
    match action {
        DenyAction::Checked { predicate, inner } => {
            predicate_call(&mut asm, pool, predicate, this_class)?;
            branch_at = Some(asm.len());
            asm.op(op::IFNE);
            asm.bytes.extend_from_slice(&[0, 0]);
            emit_prologue_deny(&mut asm, pool, inner, descriptor)?;
        }
        DenyAction::Custom(target) => {
            let custom_desc: MethodDescriptor = target
                .descriptor
                .parse()
                .map_err(RewriteError::Format)?;
            if custom_desc.return_type != descriptor.return_type {
                return Err(RewriteError::ValueTypeMismatch("custom"));
            }
            let own_params = descriptor.parameters.len() + usize::from(!is_static);
            if custom_wants_caller(&custom_desc, own_params) {
                asm.op_u16(op::LDC_W, this_class);
            }
            load_own_arguments(&mut asm, descriptor, is_static);
            let index =
                pool.add_method_ref(&target.owner, &target.name, &target.descriptor)?;
            asm.op_u16(op::INVOKESTATIC, index);
            asm.op(return_opcode(&descriptor.return_type));
        }
        _ => {
            let owner_index = pool.add_string(owner_internal)?;
            let member_index = pool.add_string(&format!("{name}{descriptor_text}"))?;
            asm.op_u16(op::LDC_W, owner_index);
            asm.op_u16(op::LDC_W, member_index);
            let check = pool.add_method_ref(
                SHIM_CLASS,
                shim::IS_CALLER_ALLOWED.0,
                shim::IS_CALLER_ALLOWED.1,
            )?;
            asm.op_u16(op::INVOKESTATIC, check);
            branch_at = Some(asm.len());
            asm.op(op::IFNE);
            asm.bytes.extend_from_slice(&[0, 0]);
            emit_throw(&mut asm, pool, "java/lang/SecurityException", None)?;
        }
    }
    let mut frame_offset = None;
    if let Some(branch_at) = branch_at {
        // the allowed path: call the renamed native implementation
        let delegate = asm.len();
        frame_offset = Some(delegate as u32);
        let distance = i16::try_from(delegate - branch_at)
            .map_err(|_| RewriteError::BranchOutOfRange)?;
        asm.patch_i16(branch_at + 1, distance);
        load_own_arguments(&mut asm, descriptor, is_static);
        let renamed = pool.add_method_ref(
            owner_internal,
            &format!("{}{name}", super::NATIVE_PREFIX),
            descriptor_text,
        )?;
        let opcode = if is_static {
            op::INVOKESTATIC
        } else {
            op::INVOKESPECIAL
        };
        asm.op_u16(opcode, renamed);
        asm.op(return_opcode(&descriptor.return_type));
    }
    let arg_slots = descriptor.argument_slots() + u16::from(!is_static);
    Ok(WrapperBody {
        code: asm.bytes,
        frame_offset,
        max_stack: arg_slots.max(1) + 3,
    })
}

fn load_own_arguments(asm: &mut Asm, descriptor: &MethodDescriptor, is_static: bool) {
    let mut slot = 0u16;
    if !is_static {
        asm.local(op::ALOAD, 0);
        slot = 1;
    }
    for param in &descriptor.parameters {
        asm.local(load_op(param), slot);
        slot += param.slots();
    }
}
