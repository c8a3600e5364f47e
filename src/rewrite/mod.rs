//! The code rewriter: splices enforcement bytecode into parsed class files.
//!
//! Original instruction offsets never move. A denied invocation is rewritten
//! in place when the replacement fits its instruction window; otherwise the
//! window becomes a `goto` to a block appended after the original code, which
//! either throws or produces the substitute value and branches back. Target-
//! side denials prepend a prologue, shifting every absolute offset by its
//! (4-byte aligned) length. The stack map table, exception table, and line
//! number table are maintained across all three shapes.

mod emit;

use std::collections::BTreeSet;

use jclass::access_flags::MethodAccessFlags;
use jclass::buffer::{reader_at, Sink};
use jclass::bytecode::{self, op};
use jclass::class_file::{ClassFile, CodeAttribute, CodeSubAttribute, ExceptionTableEntry};
use jclass::desc::MethodDescriptor;
use jclass::pool::{Constant, ConstantPool};
use jclass::stack_map::{initial_frame, StackMapTable};

use crate::errors::RewriteError;
use crate::policy::SHIM_CLASS;
use crate::rules::{
    split_internal_name, DenyAction, EnforceSite, Rule, Rules, CONSTRUCTOR_NAME,
};

/// Prefix given to a renamed native method whose wrapper enforces the rule.
pub const NATIVE_PREFIX: &str = "$fence$_";

const MAX_CODE: usize = 65535;

/// The caller-side and target-side projections of one rule source, bound to
/// the module of the class being transformed.
pub(crate) struct Checkers<'r> {
    pub rules: &'r dyn Rules,
    pub caller_module: &'r str,
}

impl Checkers<'_> {
    /// The rule enforced at an invocation instruction in the current class.
    fn caller_rule(&self, owner: &str, name: &str, descriptor: &str) -> Rule {
        if owner.starts_with('[') || owner == SHIM_CLASS {
            return Rule::Allow;
        }
        let (package, class) = split_internal_name(owner);
        let view = self.rules.for_class(self.caller_module, package, class);
        let rule = if name == CONSTRUCTOR_NAME {
            view.rule_for_constructor(descriptor)
        } else {
            view.rule_for_method(name, descriptor)
        };
        match rule {
            Rule::Deny {
                site: EnforceSite::Caller,
                ..
            } => rule,
            _ => Rule::Allow,
        }
    }

    /// The action enforced in the body of a method the current class itself
    /// declares, merged over every configured caller module.
    fn target_action(
        &self,
        package: &str,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<DenyAction> {
        let view = self.rules.for_any_caller(package, class);
        let rule = if name == CONSTRUCTOR_NAME {
            view.rule_for_constructor(descriptor)
        } else {
            view.rule_for_method(name, descriptor)
        };
        match rule {
            Rule::Deny {
                action,
                site: EnforceSite::Target,
            } => Some(action),
            _ => None,
        }
    }

    fn caller_is_configured(&self) -> bool {
        self.rules
            .modules()
            .iter()
            .any(|m| &**m == self.caller_module)
    }
}

/// One denied site found by the scan, with offsets relative to the original
/// bytecode.
struct ScannedSite {
    pc: u32,
    window: usize,
    action: DenyAction,
    info: emit::SiteInfo,
    handle_constant: bool,
}

/// Transforms one parsed class. Returns whether anything was registered.
pub(crate) fn rewrite_class(
    class: &mut ClassFile<'_>,
    checkers: &Checkers<'_>,
    reflection: bool,
) -> Result<bool, RewriteError> {
    let this_internal = class.class_name()?.decode()?.into_owned();
    let (this_package, this_class_name) = {
        let (p, c) = split_internal_name(&this_internal);
        (p.to_owned(), c.to_owned())
    };
    let caller_active = checkers.caller_is_configured();
    let mut bootstrap: Option<Vec<(u16, Vec<u16>)>> = None;

    for index in 0..class.methods.len() {
        let flags = class.methods[index].flags();
        let name = class.method_name(index)?.decode()?.into_owned();
        let descriptor_text = class.method_descriptor(index)?.decode()?.into_owned();
        let target_action = checkers.target_action(
            &this_package,
            &this_class_name,
            &name,
            &descriptor_text,
        );

        if flags.contains(MethodAccessFlags::NATIVE) {
            if let Some(action) = target_action {
                rewrite_native(class, index, &name, &descriptor_text, flags, &action)?;
            }
            continue;
        }
        let Some(code_attr) = class.code_attribute(index)? else {
            continue; // abstract
        };
        let sites = if caller_active {
            scan_sites(class, &code_attr, checkers, reflection, &mut bootstrap)?
        } else {
            Vec::new()
        };
        if sites.is_empty() && target_action.is_none() {
            continue;
        }
        log::debug!(
            "rewriting {}.{}{}: {} denied site(s), prologue: {}",
            this_internal,
            name,
            descriptor_text,
            sites.len(),
            target_action.is_some()
        );
        let replacement = rewrite_method(
            class,
            index,
            &code_attr,
            &this_internal,
            &name,
            &descriptor_text,
            flags,
            sites,
            target_action,
        )?;
        if let Some(bytes) = replacement {
            class.replace_method(index, bytes);
        }
    }
    Ok(class.has_replacements())
}

/// Scans one method's bytecode for denied invocation instructions and denied
/// `ldc_w` method-handle constants.
fn scan_sites(
    class: &ClassFile<'_>,
    code_attr: &CodeAttribute,
    checkers: &Checkers<'_>,
    reflection: bool,
    bootstrap: &mut Option<Vec<(u16, Vec<u16>)>>,
) -> Result<Vec<ScannedSite>, RewriteError> {
    let code = class.code_bytes(code_attr);
    let pool = &class.pool;
    let mut sites = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let length = bytecode::instruction_length(code, pc)?;
        if pc + length > code.len() {
            return Err(RewriteError::Analysis("truncated instruction"));
        }
        let opcode = code[pc];
        match opcode {
            op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKESTATIC | op::INVOKEINTERFACE => {
                let ref_index = bytecode::read_u16(code, pc + 1)?;
                let mref = pool.member_ref(ref_index)?;
                let owner = mref.owner.decode()?.into_owned();
                let name = mref.name.decode()?.into_owned();
                let descriptor_text = mref.descriptor.decode()?.into_owned();
                if let Rule::Deny { action, .. } =
                    checkers.caller_rule(&owner, &name, &descriptor_text)
                {
                    let descriptor: MethodDescriptor = descriptor_text.parse()?;
                    sites.push(ScannedSite {
                        pc: pc as u32,
                        window: length,
                        action,
                        info: emit::SiteInfo {
                            owner,
                            has_receiver: opcode != op::INVOKESTATIC,
                            is_init: name == CONSTRUCTOR_NAME,
                            original: code[pc..pc + length].to_vec(),
                            name,
                            descriptor_text,
                            descriptor,
                        },
                        handle_constant: false,
                    });
                }
            }
            op::INVOKEDYNAMIC => {
                let ref_index = bytecode::read_u16(code, pc + 1)?;
                let (bsm_index, name, desc) = pool.invoke_dynamic(ref_index)?;
                let name = name.decode()?.into_owned();
                let descriptor_text = desc.decode()?.into_owned();
                if bootstrap.is_none() {
                    *bootstrap = Some(class.bootstrap_methods()?);
                }
                let entries = bootstrap.as_ref().expect("just initialized");
                if let Some(action) =
                    denied_bootstrap(pool, entries.get(bsm_index as usize), checkers)?
                {
                    let descriptor: MethodDescriptor = descriptor_text.parse()?;
                    sites.push(ScannedSite {
                        pc: pc as u32,
                        window: length,
                        action,
                        info: emit::SiteInfo {
                            owner: "java/lang/invoke/CallSite".to_owned(),
                            has_receiver: false,
                            is_init: false,
                            original: code[pc..pc + length].to_vec(),
                            name,
                            descriptor_text,
                            descriptor,
                        },
                        handle_constant: false,
                    });
                }
            }
            op::LDC_W if reflection => {
                let ref_index = bytecode::read_u16(code, pc + 1)?;
                if let Constant::MethodHandle {
                    reference_index, ..
                } = pool.get(ref_index)?
                {
                    if let Some(site) =
                        denied_handle_site(pool, *reference_index, pc as u32, checkers)?
                    {
                        sites.push(site);
                    }
                }
            }
            op::LDC if reflection => {
                // a 2-byte window cannot hold any rewrite; target-side
                // prologues cover the referenced member instead
                let ref_index = u16::from(code[pc + 1]);
                if let Ok(Constant::MethodHandle { .. }) = pool.get(ref_index) {
                    log::trace!("narrow ldc of a method handle at {pc} left in place");
                }
            }
            _ => {}
        }
        pc += length;
    }
    Ok(sites)
}

fn denied_bootstrap(
    pool: &ConstantPool,
    entry: Option<&(u16, Vec<u16>)>,
    checkers: &Checkers<'_>,
) -> Result<Option<DenyAction>, RewriteError> {
    let Some((method_handle, arguments)) = entry else {
        return Ok(None);
    };
    let mut handles = vec![*method_handle];
    for argument in arguments {
        if matches!(pool.get(*argument), Ok(Constant::MethodHandle { .. })) {
            handles.push(*argument);
        }
    }
    for handle_index in handles {
        let Ok(Constant::MethodHandle {
            reference_index, ..
        }) = pool.get(handle_index)
        else {
            continue;
        };
        let Ok(mref) = pool.member_ref(*reference_index) else {
            continue;
        };
        let owner = mref.owner.decode()?.into_owned();
        let name = mref.name.decode()?.into_owned();
        let descriptor = mref.descriptor.decode()?.into_owned();
        if let Rule::Deny { action, .. } = checkers.caller_rule(&owner, &name, &descriptor) {
            return Ok(Some(action));
        }
    }
    Ok(None)
}

fn denied_handle_site(
    pool: &ConstantPool,
    reference_index: u16,
    pc: u32,
    checkers: &Checkers<'_>,
) -> Result<Option<ScannedSite>, RewriteError> {
    let Ok(mref) = pool.member_ref(reference_index) else {
        return Ok(None);
    };
    let owner = mref.owner.decode()?.into_owned();
    let name = mref.name.decode()?.into_owned();
    let descriptor_text = mref.descriptor.decode()?.into_owned();
    match checkers.caller_rule(&owner, &name, &descriptor_text) {
        Rule::Deny { action, .. } => Ok(Some(ScannedSite {
            pc,
            window: 3,
            action,
            info: emit::SiteInfo {
                owner,
                name,
                descriptor_text,
                descriptor: "()Ljava/lang/invoke/MethodHandle;".parse()?,
                has_receiver: false,
                is_init: false,
                original: Vec::new(),
            },
            handle_constant: true,
        })),
        Rule::Allow => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn rewrite_method(
    class: &mut ClassFile<'_>,
    method_index: usize,
    code_attr: &CodeAttribute,
    this_internal: &str,
    name: &str,
    descriptor_text: &str,
    flags: MethodAccessFlags,
    mut sites: Vec<ScannedSite>,
    target_action: Option<DenyAction>,
) -> Result<Option<Vec<u8>>, RewriteError> {
    let frames_enabled = class.major_version >= 50;
    let original_image = class.original_bytes();
    let code0 = class.code_bytes(code_attr).to_vec();
    let this_class = class.this_class;
    let is_static = flags.contains(MethodAccessFlags::STATIC);
    let is_init = name == CONSTRUCTOR_NAME;
    let descriptor: MethodDescriptor = descriptor_text.parse()?;
    let pool = &mut class.pool;

    let initial = initial_frame(is_static, is_init, this_class, &descriptor, pool)?;
    let mut table = match find_stack_map(code_attr) {
        Some(span) => {
            let mut cur = reader_at(original_image, span);
            StackMapTable::parse(&mut cur, initial.clone())?
        }
        None => StackMapTable::from_initial(initial.clone()),
    };
    let mut exceptions = code_attr.exception_table.clone();
    let mut lines = find_line_numbers(code_attr);

    // Prologue for a target-side denial of this declared method.
    let prologue = match &target_action {
        Some(action) => Some(emit::emit_prologue(
            pool,
            action,
            this_internal,
            name,
            descriptor_text,
            &descriptor,
            is_static,
            this_class,
        )?),
        None => None,
    };
    let shift = prologue.as_ref().map_or(0, |p| p.bytes.len());
    let mut new_code = Vec::with_capacity(shift + code0.len() + sites.len() * 16);
    if let Some(p) = &prologue {
        new_code.extend_from_slice(&p.bytes);
    }
    new_code.extend_from_slice(&code0);
    if shift > 0 {
        let delta = u16::try_from(shift).map_err(|_| RewriteError::MethodTooLarge)?;
        table.shift(0, u32::from(delta));
        for entry in &mut exceptions {
            entry.start_pc = shifted(entry.start_pc, delta)?;
            entry.end_pc = shifted(entry.end_pc, delta)?;
            entry.handler_pc = shifted(entry.handler_pc, delta)?;
        }
        if let Some(entries) = &mut lines {
            for (start_pc, _) in entries.iter_mut() {
                *start_pc = shifted(*start_pc, delta)?;
            }
        }
        for site in &mut sites {
            site.pc += u32::from(delta);
        }
        if frames_enabled {
            table.insert_frame(u32::from(delta), initial.clone());
        }
    }

    // Verifier states at every site and at every return-to offset.
    let states = if frames_enabled {
        let want: BTreeSet<u32> = sites
            .iter()
            .flat_map(|s| [s.pc, s.pc + s.window as u32])
            .collect();
        Some(crate::analyze::compute_states(
            &new_code, pool, &table, this_class, &want,
        )?)
    } else {
        None
    };

    let original_exceptions = exceptions.clone();
    let mut max_extra_stack: u16 = if prologue.is_some() { 3 } else { 0 };
    if let Some(p) = &prologue {
        max_extra_stack = max_extra_stack.max(p.extra_stack);
    }
    let mut max_temp_slots: u16 = 0;
    let mut any_change = prologue.is_some();

    for site in &sites {
        let pc = site.pc as usize;
        let entry_state = match &states {
            Some(map) => match map.get(&site.pc) {
                Some(Some(frame)) => Some(frame.clone()),
                // unreachable code cannot execute; leave the site alone
                Some(None) | None => {
                    log::debug!("denied site at {pc} is unreachable, skipped");
                    continue;
                }
            },
            None => None,
        };
        if site.handle_constant {
            let inline = emit::denied_handle_ldc(pool)?;
            new_code[pc..pc + inline.len()].copy_from_slice(&inline);
            any_change = true;
            continue;
        }
        if let Some(inline) = emit::try_inline(pool, &site.info, &site.action, site.window)? {
            new_code[pc..pc + inline.len()].copy_from_slice(&inline);
            for filler in &mut new_code[pc + inline.len()..pc + site.window] {
                *filler = op::NOP;
            }
            any_change = true;
            continue;
        }

        // Relocate: the window branches to a block appended after the code.
        // The goto sits at the window's end so no unreachable filler follows
        // a transfer instruction; what follows the window gets a frame below.
        let block_off = new_code.len();
        let block = emit::emit_site_block(
            pool,
            &site.info,
            &site.action,
            this_class,
            code_attr.max_locals,
        )?;
        let goto_at = pc + site.window - 3;
        let forward = block_off as i64 - goto_at as i64;
        let forward = i16::try_from(forward).map_err(|_| RewriteError::BranchOutOfRange)?;
        for filler in &mut new_code[pc..goto_at] {
            *filler = op::NOP;
        }
        new_code[goto_at] = op::GOTO;
        new_code[goto_at + 1..goto_at + 3].copy_from_slice(&forward.to_be_bytes());
        let mut block_bytes = block.bytes;
        let resume = site.pc + site.window as u32;
        for goto_pos in &block.back_gotos {
            let goto_pc = block_off + goto_pos;
            let back = i64::from(resume) - goto_pc as i64;
            let back = i16::try_from(back).map_err(|_| RewriteError::BranchOutOfRange)?;
            block_bytes[goto_pos + 1..goto_pos + 3].copy_from_slice(&back.to_be_bytes());
        }
        if let Some(entry) = &entry_state {
            table.insert_frame(block_off as u32, entry.clone());
            for frame_at in &block.entry_frames {
                table.insert_frame((block_off + frame_at) as u32, entry.clone());
            }
            // the code after the site needs a frame either way: it is a
            // back-branch target, or dead after an always-throwing block
            if let Some(Some(after)) =
                states.as_ref().and_then(|m| m.get(&resume)).map(Clone::clone)
            {
                table.insert_frame(resume, after);
            }
        }
        let block_end = block_off + block_bytes.len();
        for entry in &original_exceptions {
            if u32::from(entry.start_pc) <= site.pc && site.pc < u32::from(entry.end_pc) {
                exceptions.push(ExceptionTableEntry {
                    start_pc: pc_u16(block_off)?,
                    end_pc: pc_u16(block_end)?,
                    handler_pc: entry.handler_pc,
                    catch_type: entry.catch_type,
                });
            }
        }
        if let Some(entries) = &mut lines {
            let line = entries
                .iter()
                .filter(|(start, _)| u32::from(*start) <= site.pc)
                .map(|(_, line)| *line)
                .last();
            if let Some(line) = line {
                entries.push((pc_u16(block_off)?, line));
            }
        }
        max_extra_stack = max_extra_stack.max(block.extra_stack);
        max_temp_slots = max_temp_slots.max(block.temp_slots);
        new_code.extend_from_slice(&block_bytes);
        any_change = true;
    }

    if !any_change {
        return Ok(None);
    }
    if new_code.len() > MAX_CODE {
        return Err(RewriteError::MethodTooLarge);
    }

    let max_stack = code_attr
        .max_stack
        .saturating_add(max_extra_stack);
    let max_locals = code_attr.max_locals.saturating_add(max_temp_slots);

    // Reassemble the Code attribute's nested attributes.
    let mut sub_attributes: Vec<(u16, Vec<u8>)> = Vec::new();
    let mut emitted_stack_map = false;
    for sub in &code_attr.attributes {
        match sub {
            CodeSubAttribute::StackMapTable { name_index, .. } => {
                if frames_enabled && !table.is_empty() {
                    let mut body = Sink::new();
                    table.emit(&mut body)?;
                    sub_attributes.push((*name_index, body.into_bytes()));
                }
                emitted_stack_map = true;
            }
            CodeSubAttribute::LineNumberTable { name_index, .. } => {
                if let Some(entries) = &lines {
                    let mut body = Sink::new();
                    body.u16(entries.len() as u16);
                    for (start_pc, line) in entries {
                        body.u16(*start_pc);
                        body.u16(*line);
                    }
                    sub_attributes.push((*name_index, body.into_bytes()));
                }
            }
            CodeSubAttribute::Opaque { name_index, body } => {
                sub_attributes
                    .push((*name_index, original_image[body.off..body.end()].to_vec()));
            }
        }
    }
    if !emitted_stack_map && frames_enabled && !table.is_empty() {
        let name_index = pool.add_utf8("StackMapTable")?;
        let mut body = Sink::new();
        table.emit(&mut body)?;
        sub_attributes.push((name_index, body.into_bytes()));
    }

    let method_info = assemble_method_info(
        class,
        method_index,
        code_attr.name_index,
        max_stack,
        max_locals,
        &new_code,
        &exceptions,
        &sub_attributes,
    )?;
    Ok(Some(method_info))
}

fn shifted(pc: u16, delta: u16) -> Result<u16, RewriteError> {
    pc.checked_add(delta).ok_or(RewriteError::MethodTooLarge)
}

fn pc_u16(offset: usize) -> Result<u16, RewriteError> {
    u16::try_from(offset).map_err(|_| RewriteError::MethodTooLarge)
}

fn find_stack_map(code_attr: &CodeAttribute) -> Option<usize> {
    code_attr.attributes.iter().find_map(|sub| match sub {
        CodeSubAttribute::StackMapTable { body, .. } => Some(body.off),
        _ => None,
    })
}

fn find_line_numbers(code_attr: &CodeAttribute) -> Option<Vec<(u16, u16)>> {
    code_attr.attributes.iter().find_map(|sub| match sub {
        CodeSubAttribute::LineNumberTable { entries, .. } => Some(entries.clone()),
        _ => None,
    })
}

/// Rebuilds `method_info`, replacing the `Code` attribute and copying every
/// other method attribute byte for byte.
#[allow(clippy::too_many_arguments)]
fn assemble_method_info(
    class: &ClassFile<'_>,
    method_index: usize,
    code_name_index: u16,
    max_stack: u16,
    max_locals: u16,
    code: &[u8],
    exceptions: &[ExceptionTableEntry],
    sub_attributes: &[(u16, Vec<u8>)],
) -> Result<Vec<u8>, RewriteError> {
    let method = &class.methods[method_index];
    let image = class.original_bytes();
    let mut sink = Sink::with_capacity(code.len() + 128);
    sink.u16(method.access_flags);
    sink.u16(method.name_index);
    sink.u16(method.descriptor_index);
    sink.u16(method.attributes.len() as u16);
    for attribute in &method.attributes {
        if attribute.name_index == code_name_index {
            sink.u16(code_name_index);
            let len_at = sink.len();
            sink.u32(0);
            let body_start = sink.len();
            sink.u16(max_stack);
            sink.u16(max_locals);
            sink.u32(code.len() as u32);
            sink.bytes(code);
            sink.u16(exceptions.len() as u16);
            for entry in exceptions {
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
            sink.patch_u32(len_at, (sink.len() - body_start) as u32);
        } else {
            sink.u16(attribute.name_index);
            sink.u32(attribute.info.len as u32);
            sink.bytes(&image[attribute.info.off..attribute.info.end()]);
        }
    }
    Ok(sink.into_bytes())
}

/// Enforcement on a `native` method: a flat denial replaces the method with
/// a throwing body; conditional denials rename the native method with
/// [`NATIVE_PREFIX`] and append a synthetic wrapper that checks first and
/// delegates on the allowed path.
fn rewrite_native(
    class: &mut ClassFile<'_>,
    method_index: usize,
    name: &str,
    descriptor_text: &str,
    flags: MethodAccessFlags,
    action: &DenyAction,
) -> Result<(), RewriteError> {
    let descriptor: MethodDescriptor = descriptor_text.parse()?;
    let is_static = flags.contains(MethodAccessFlags::STATIC);
    let arg_slots = descriptor.argument_slots() + u16::from(!is_static);
    let frames_enabled = class.major_version >= 50;
    let this_internal = class.class_name()?.decode()?.into_owned();
    let this_class = class.this_class;
    let method = &class.methods[method_index];
    let (method_flags, name_index, descriptor_index) =
        (method.access_flags, method.name_index, method.descriptor_index);
    let span = method.span;

    match action {
        DenyAction::Exception { .. } | DenyAction::Value(_) | DenyAction::Empty => {
            // no path ever reaches the native implementation; drop it
            let pool = &mut class.pool;
            let body = emit::emit_prologue(
                pool,
                action,
                &this_internal,
                name,
                descriptor_text,
                &descriptor,
                is_static,
                this_class,
            )?;
            let code_name_index = pool.add_utf8("Code")?;
            let info = jclass::class_file::write_method_info(
                method_flags & !MethodAccessFlags::NATIVE.bits(),
                name_index,
                descriptor_index,
                code_name_index,
                body.extra_stack.max(3),
                arg_slots.max(1),
                &body.bytes,
                &[],
                &[],
            )?;
            class.replace_method(method_index, info);
        }
        _ => {
            let pool = &mut class.pool;
            let renamed_index = pool.add_utf8(&format!("{NATIVE_PREFIX}{name}"))?;
            let wrapper = emit::emit_native_wrapper(
                pool,
                action,
                &this_internal,
                name,
                descriptor_text,
                &descriptor,
                is_static,
                this_class,
            )?;
            let code_name_index = pool.add_utf8("Code")?;
            let sub_attributes: Vec<(u16, Vec<u8>)> = match &wrapper.frame_offset {
                Some(offset) if frames_enabled => {
                    let initial =
                        initial_frame(is_static, false, this_class, &descriptor, pool)?;
                    let mut table = StackMapTable::from_initial(initial.clone());
                    table.insert_frame(*offset, initial);
                    let mut body = Sink::new();
                    table.emit(&mut body)?;
                    vec![(pool.add_utf8("StackMapTable")?, body.into_bytes())]
                }
                _ => Vec::new(),
            };
            let wrapper_flags = (method_flags
                & !(MethodAccessFlags::NATIVE.bits() | MethodAccessFlags::ABSTRACT.bits()))
                | MethodAccessFlags::SYNTHETIC.bits();
            let info = jclass::class_file::write_method_info(
                wrapper_flags,
                name_index,
                descriptor_index,
                code_name_index,
                wrapper.max_stack,
                arg_slots.max(1),
                &wrapper.code,
                &[],
                &sub_attributes,
            )?;
            class.append_method(info);
            // rename the original in place: the name index sits at offset 2
            let mut renamed = class.original_bytes()[span.off..span.end()].to_vec();
            renamed[2..4].copy_from_slice(&renamed_index.to_be_bytes());
            class.replace_method(method_index, renamed);
        }
    }
    Ok(())
}

/// Replaces every concrete method body with a throwing stub; the substitute
/// for a class whose rewrite failed part-way. Also available to the
/// instrumentation glue for classes it wants to disable outright.
pub fn poison_class(bytes: &[u8]) -> Result<Vec<u8>, RewriteError> {
    let mut class = ClassFile::parse(bytes)?;
    let code_name_index = class.pool.add_utf8("Code")?;
    let throw_body = emit::throw_only_body(&mut class.pool)?;
    for index in 0..class.methods.len() {
        if class.code_attribute(index)?.is_none() {
            continue;
        }
        let method = &class.methods[index];
        let descriptor: MethodDescriptor = class
            .method_descriptor(index)?
            .decode()?
            .parse()?;
        let is_static = method.flags().contains(MethodAccessFlags::STATIC);
        let max_locals = descriptor.argument_slots() + u16::from(!is_static);
        let info = jclass::class_file::write_method_info(
            method.access_flags,
            method.name_index,
            method.descriptor_index,
            code_name_index,
            3,
            max_locals.max(1),
            &throw_body,
            &[],
            &[],
        )?;
        class.replace_method(index, info);
    }
    class.redefine().map_err(RewriteError::Format)
}
