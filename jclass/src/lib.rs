//! Class-file codec: parsing, region-based rewriting, and re-emission of the
//! JVM `class` file format.
//!
//! The crate deliberately knows nothing about access-control rules. It reads a
//! class file once, hands out spans into the original buffer, and writes a new
//! image by concatenating untouched ranges with replacement regions. Anything
//! it does not understand is round-tripped byte for byte.

pub mod access_flags;
/// Byte-level reader and big-endian sink shared by every other module.
pub mod buffer;
/// Opcode constants, instruction lengths, and invocation decoding.
pub mod bytecode;
/// [Class File Format](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html)
pub mod class_file;
/// [Descriptors](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.3)
pub mod desc;
pub mod error;
/// Modified UTF-8 as stored in `CONSTANT_Utf8_info` entries.
pub mod mutf8;
/// [The Constant Pool](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.4)
pub mod pool;
/// [StackMapTable](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.7.4)
pub mod stack_map;

pub use error::ClassFormatError;
