//! `StackMapTable` handling.
//!
//! Frames are materialized to absolute offsets with fully expanded locals, so
//! the rewriter can shift, query, and add them without caring about the
//! delta-and-diff encoding. [`StackMapTable::emit`] reconstructs the most
//! compact verification-frame form that holds for each pair of neighbours.

use byteorder::{ReadBytesExt, BE};

use crate::buffer::{Reader, Sink};
use crate::error::ClassFormatError;

/// A single verification type, [JVMS §4.7.4](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Class constant index of the object's type.
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

impl VerificationType {
    fn parse(cur: &mut Reader<'_>) -> Result<Self, ClassFormatError> {
        Ok(match cur.read_u8()? {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(cur.read_u16::<BE>()?),
            8 => VerificationType::Uninitialized(cur.read_u16::<BE>()?),
            _ => return Err(ClassFormatError::MalformedAttribute("StackMapTable")),
        })
    }

    fn write(self, sink: &mut Sink) {
        match self {
            VerificationType::Top => sink.u8(0),
            VerificationType::Integer => sink.u8(1),
            VerificationType::Float => sink.u8(2),
            VerificationType::Double => sink.u8(3),
            VerificationType::Long => sink.u8(4),
            VerificationType::Null => sink.u8(5),
            VerificationType::UninitializedThis => sink.u8(6),
            VerificationType::Object(index) => {
                sink.u8(7);
                sink.u16(index);
            }
            VerificationType::Uninitialized(offset) => {
                sink.u8(8);
                sink.u16(offset);
            }
        }
    }

    /// Slots the type occupies in the locals array or on the operand stack.
    pub fn slots(self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }
}

/// A fully expanded frame: verification types of locals and operand stack.
/// Long and double values are one entry each, as in the encoded form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub locals: Vec<VerificationType>,
    pub stack: Vec<VerificationType>,
}

impl Frame {
    pub fn new(locals: Vec<VerificationType>, stack: Vec<VerificationType>) -> Self {
        Frame { locals, stack }
    }

    /// Operand-stack depth in slots.
    pub fn stack_slots(&self) -> u16 {
        self.stack.iter().map(|t| t.slots()).sum()
    }

    /// Locals size in slots.
    pub fn local_slots(&self) -> u16 {
        self.locals.iter().map(|t| t.slots()).sum()
    }
}

/// The verification type of a field type; object and array types resolve to
/// class constants, added to the pool on demand.
pub fn verification_type_of(
    field_type: &crate::desc::FieldType,
    pool: &mut crate::pool::ConstantPool,
) -> Result<VerificationType, ClassFormatError> {
    use crate::desc::{FieldType, PrimitiveType};
    Ok(match field_type {
        FieldType::Base(PrimitiveType::Float) => VerificationType::Float,
        FieldType::Base(PrimitiveType::Long) => VerificationType::Long,
        FieldType::Base(PrimitiveType::Double) => VerificationType::Double,
        FieldType::Base(_) => VerificationType::Integer,
        FieldType::Object(name) => VerificationType::Object(pool.add_class(name)?),
        FieldType::Array(_) => {
            VerificationType::Object(pool.add_class(&field_type.descriptor())?)
        }
    })
}

/// The implied frame at offset 0: receiver (uninitialized for `<init>`) plus
/// the argument types, empty stack.
pub fn initial_frame(
    is_static: bool,
    is_constructor: bool,
    this_class: u16,
    descriptor: &crate::desc::MethodDescriptor,
    pool: &mut crate::pool::ConstantPool,
) -> Result<Frame, ClassFormatError> {
    let mut locals = Vec::with_capacity(descriptor.parameters.len() + 1);
    if !is_static {
        locals.push(if is_constructor {
            VerificationType::UninitializedThis
        } else {
            VerificationType::Object(this_class)
        });
    }
    for param in &descriptor.parameters {
        locals.push(verification_type_of(param, pool)?);
    }
    Ok(Frame::new(locals, Vec::new()))
}

/// Absolute-offset stack map frames for one `Code` attribute.
///
/// The implicit frame at the start of the method is stored separately and
/// never emitted; the entries list holds the explicit frames in offset order.
#[derive(Debug, Clone)]
pub struct StackMapTable {
    initial: Frame,
    frames: Vec<(u32, Frame)>,
}

impl StackMapTable {
    /// An empty table: only the implicit entry frame.
    pub fn from_initial(initial: Frame) -> Self {
        StackMapTable {
            initial,
            frames: Vec::new(),
        }
    }

    /// Parses the attribute body (`number_of_entries` + entries), expanding
    /// each delta-encoded frame against its predecessor.
    pub fn parse(cur: &mut Reader<'_>, initial: Frame) -> Result<Self, ClassFormatError> {
        let count = cur.read_u16::<BE>()?;
        let mut frames: Vec<(u32, Frame)> = Vec::with_capacity(count as usize);
        let mut prev = initial.clone();
        let mut prev_offset: Option<u32> = None;
        for _ in 0..count {
            let frame_type = cur.read_u8()?;
            let (delta, frame) = match frame_type {
                0..=63 => (u16::from(frame_type), Frame::new(prev.locals.clone(), vec![])),
                64..=127 => {
                    let item = VerificationType::parse(cur)?;
                    (
                        u16::from(frame_type - 64),
                        Frame::new(prev.locals.clone(), vec![item]),
                    )
                }
                247 => {
                    let delta = cur.read_u16::<BE>()?;
                    let item = VerificationType::parse(cur)?;
                    (delta, Frame::new(prev.locals.clone(), vec![item]))
                }
                248..=250 => {
                    let delta = cur.read_u16::<BE>()?;
                    let chopped = usize::from(251 - frame_type);
                    if chopped > prev.locals.len() {
                        return Err(ClassFormatError::MalformedAttribute("StackMapTable"));
                    }
                    let keep = prev.locals.len() - chopped;
                    (delta, Frame::new(prev.locals[..keep].to_vec(), vec![]))
                }
                251 => {
                    let delta = cur.read_u16::<BE>()?;
                    (delta, Frame::new(prev.locals.clone(), vec![]))
                }
                252..=254 => {
                    let delta = cur.read_u16::<BE>()?;
                    let mut locals = prev.locals.clone();
                    for _ in 0..(frame_type - 251) {
                        locals.push(VerificationType::parse(cur)?);
                    }
                    (delta, Frame::new(locals, vec![]))
                }
                255 => {
                    let delta = cur.read_u16::<BE>()?;
                    let n_locals = cur.read_u16::<BE>()?;
                    let mut locals = Vec::with_capacity(n_locals as usize);
                    for _ in 0..n_locals {
                        locals.push(VerificationType::parse(cur)?);
                    }
                    let n_stack = cur.read_u16::<BE>()?;
                    let mut stack = Vec::with_capacity(n_stack as usize);
                    for _ in 0..n_stack {
                        stack.push(VerificationType::parse(cur)?);
                    }
                    (delta, Frame::new(locals, stack))
                }
                _ => return Err(ClassFormatError::MalformedAttribute("StackMapTable")),
            };
            let offset = match prev_offset {
                None => u32::from(delta),
                Some(p) => p + u32::from(delta) + 1,
            };
            prev = frame.clone();
            prev_offset = Some(offset);
            frames.push((offset, frame));
        }
        Ok(StackMapTable { initial, frames })
    }

    pub fn initial(&self) -> &Frame {
        &self.initial
    }

    pub fn frames(&self) -> &[(u32, Frame)] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The explicit frame recorded exactly at `offset`, if any.
    pub fn frame_at(&self, offset: u32) -> Option<&Frame> {
        self.frames
            .binary_search_by_key(&offset, |(o, _)| *o)
            .ok()
            .map(|i| &self.frames[i].1)
    }

    /// Inserts a frame, keeping offsets sorted. An existing frame at the same
    /// offset wins; returns whether the new frame was inserted.
    pub fn insert_frame(&mut self, offset: u32, frame: Frame) -> bool {
        match self.frames.binary_search_by_key(&offset, |(o, _)| *o) {
            Ok(_) => false,
            Err(at) => {
                self.frames.insert(at, (offset, frame));
                true
            }
        }
    }

    /// Shifts every frame at `from` or later (and every uninitialized-type
    /// operand referring to a shifted `new`) forward by `delta` bytes.
    pub fn shift(&mut self, from: u32, delta: u32) {
        for (offset, frame) in &mut self.frames {
            if *offset >= from {
                *offset += delta;
            }
            for t in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
                if let VerificationType::Uninitialized(o) = t {
                    if u32::from(*o) >= from {
                        *o += delta as u16;
                    }
                }
            }
        }
    }

    /// Serializes `number_of_entries` and the frames, picking the most
    /// compact encoding whose preconditions hold for each frame.
    pub fn emit(&self, sink: &mut Sink) -> Result<(), ClassFormatError> {
        if self.frames.len() > u16::MAX as usize {
            return Err(ClassFormatError::TableOverflow("StackMapTable"));
        }
        sink.u16(self.frames.len() as u16);
        let mut prev = &self.initial;
        let mut prev_offset: Option<u32> = None;
        for (offset, frame) in &self.frames {
            let delta = match prev_offset {
                None => *offset,
                Some(p) => offset - p - 1,
            } as u16;
            let same_locals = frame.locals == prev.locals;
            if same_locals && frame.stack.is_empty() {
                if delta < 64 {
                    sink.u8(delta as u8);
                } else {
                    sink.u8(251);
                    sink.u16(delta);
                }
            } else if same_locals && frame.stack.len() == 1 {
                if delta < 64 {
                    sink.u8(64 + delta as u8);
                } else {
                    sink.u8(247);
                    sink.u16(delta);
                }
                frame.stack[0].write(sink);
            } else if frame.stack.is_empty()
                && frame.locals.len() < prev.locals.len()
                && prev.locals.len() - frame.locals.len() <= 3
                && prev.locals[..frame.locals.len()] == frame.locals[..]
            {
                let chopped = (prev.locals.len() - frame.locals.len()) as u8;
                sink.u8(251 - chopped);
                sink.u16(delta);
            } else if frame.stack.is_empty()
                && frame.locals.len() > prev.locals.len()
                && frame.locals.len() - prev.locals.len() <= 3
                && frame.locals[..prev.locals.len()] == prev.locals[..]
            {
                let appended = (frame.locals.len() - prev.locals.len()) as u8;
                sink.u8(251 + appended);
                sink.u16(delta);
                for t in &frame.locals[prev.locals.len()..] {
                    t.write(sink);
                }
            } else {
                sink.u8(255);
                sink.u16(delta);
                sink.u16(frame.locals.len() as u16);
                for t in &frame.locals {
                    t.write(sink);
                }
                sink.u16(frame.stack.len() as u16);
                for t in &frame.stack {
                    t.write(sink);
                }
            }
            prev = frame;
            prev_offset = Some(*offset);
        }
        Ok(())
    }
}
