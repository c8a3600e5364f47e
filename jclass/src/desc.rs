use std::fmt;
use std::str::FromStr;

use crate::error::ClassFormatError;
use crate::pool::Utf8;

/// A JVM primitive type with its descriptor character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Char,
    Byte,
    Short,
    Int,
    Float,
    Long,
    Double,
}

impl PrimitiveType {
    pub fn descriptor_char(self) -> char {
        match self {
            PrimitiveType::Boolean => 'Z',
            PrimitiveType::Char => 'C',
            PrimitiveType::Byte => 'B',
            PrimitiveType::Short => 'S',
            PrimitiveType::Int => 'I',
            PrimitiveType::Float => 'F',
            PrimitiveType::Long => 'J',
            PrimitiveType::Double => 'D',
        }
    }
}

impl TryFrom<char> for PrimitiveType {
    type Error = ();

    fn try_from(c: char) -> Result<Self, ()> {
        Ok(match c {
            'Z' => PrimitiveType::Boolean,
            'C' => PrimitiveType::Char,
            'B' => PrimitiveType::Byte,
            'S' => PrimitiveType::Short,
            'I' => PrimitiveType::Int,
            'F' => PrimitiveType::Float,
            'J' => PrimitiveType::Long,
            'D' => PrimitiveType::Double,
            _ => return Err(()),
        })
    }
}

/// A field type: primitive, object (by internal name), or array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Base(PrimitiveType),
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    /// Operand-stack / local-variable slots the type occupies.
    pub fn slots(&self) -> u16 {
        match self {
            FieldType::Base(PrimitiveType::Long | PrimitiveType::Double) => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::new();
        self.push_descriptor(&mut out);
        out
    }

    fn push_descriptor(&self, out: &mut String) {
        match self {
            FieldType::Base(p) => out.push(p.descriptor_char()),
            FieldType::Object(name) => {
                out.push('L');
                out.push_str(name);
                out.push(';');
            }
            FieldType::Array(inner) => {
                out.push('[');
                inner.push_descriptor(out);
            }
        }
    }

    /// The internal name an array type or object type refers to in a
    /// `CONSTANT_Class_info`: the bare name for objects, the full descriptor
    /// for arrays.
    pub fn class_constant_name(&self) -> Option<String> {
        match self {
            FieldType::Object(name) => Some(name.clone()),
            FieldType::Array(_) => Some(self.descriptor()),
            FieldType::Base(_) => None,
        }
    }
}

/// The return half of a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReturnType {
    Void,
    Value(FieldType),
}

impl ReturnType {
    pub fn slots(&self) -> u16 {
        match self {
            ReturnType::Void => 0,
            ReturnType::Value(t) => t.slots(),
        }
    }
}

/// A parsed method descriptor, e.g. `(Ljava/lang/String;I)V`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: ReturnType,
}

impl MethodDescriptor {
    pub fn parse_utf8(desc: &Utf8) -> Result<Self, ClassFormatError> {
        let text = desc.decode()?;
        text.parse()
    }

    /// Total operand-stack slots the arguments occupy, excluding any receiver.
    pub fn argument_slots(&self) -> u16 {
        self.parameters.iter().map(FieldType::slots).sum()
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::from("(");
        for p in &self.parameters {
            p.push_descriptor(&mut out);
        }
        out.push(')');
        match &self.return_type {
            ReturnType::Void => out.push('V'),
            ReturnType::Value(t) => t.push_descriptor(&mut out),
        }
        out
    }
}

struct DescParser<'a> {
    text: &'a str,
    chars: std::str::Chars<'a>,
}

impl<'a> DescParser<'a> {
    fn new(text: &'a str) -> Self {
        DescParser {
            text,
            chars: text.chars(),
        }
    }

    fn err(&self) -> ClassFormatError {
        ClassFormatError::InvalidDescriptor(self.text.to_owned())
    }

    fn field_type(&mut self, prefix: char) -> Result<FieldType, ClassFormatError> {
        if let Ok(p) = PrimitiveType::try_from(prefix) {
            return Ok(FieldType::Base(p));
        }
        match prefix {
            'L' => {
                let rest = self.chars.as_str();
                let end = rest.find(';').ok_or_else(|| self.err())?;
                if end == 0 {
                    return Err(self.err());
                }
                let name = rest[..end].to_owned();
                self.chars = rest[end + 1..].chars();
                Ok(FieldType::Object(name))
            }
            '[' => {
                let next = self.chars.next().ok_or_else(|| self.err())?;
                Ok(FieldType::Array(Box::new(self.field_type(next)?)))
            }
            _ => Err(self.err()),
        }
    }
}

impl FromStr for FieldType {
    type Err = ClassFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = DescParser::new(s);
        let first = parser
            .chars
            .next()
            .ok_or(ClassFormatError::InvalidDescriptor(String::new()))?;
        let parsed = parser.field_type(first)?;
        if parser.chars.next().is_some() {
            return Err(parser.err());
        }
        Ok(parsed)
    }
}

impl FromStr for MethodDescriptor {
    type Err = ClassFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = DescParser::new(s);
        if parser.chars.next() != Some('(') {
            return Err(parser.err());
        }
        let mut parameters = Vec::new();
        let return_type = loop {
            match parser.chars.next() {
                Some(')') => {
                    let ret = parser.chars.as_str();
                    break if ret == "V" {
                        ReturnType::Void
                    } else {
                        let first = parser.chars.next().ok_or_else(|| parser.err())?;
                        let t = parser.field_type(first)?;
                        if parser.chars.next().is_some() {
                            return Err(parser.err());
                        }
                        ReturnType::Value(t)
                    };
                }
                Some(c) => parameters.push(parser.field_type(c)?),
                None => return Err(parser.err()),
            }
        };
        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_int_param() {
        let d: MethodDescriptor = "(I)V".parse().unwrap();
        assert_eq!(d.parameters, vec![FieldType::Base(PrimitiveType::Int)]);
        assert_eq!(d.return_type, ReturnType::Void);
        assert_eq!(d.argument_slots(), 1);
    }

    #[test]
    fn mixed_params() {
        let d: MethodDescriptor = "(I[JLjava/lang/String;J)I".parse().unwrap();
        assert_eq!(
            d.parameters,
            vec![
                FieldType::Base(PrimitiveType::Int),
                FieldType::Array(Box::new(FieldType::Base(PrimitiveType::Long))),
                FieldType::Object("java/lang/String".into()),
                FieldType::Base(PrimitiveType::Long),
            ]
        );
        assert_eq!(d.argument_slots(), 5);
        assert_eq!(
            d.return_type,
            ReturnType::Value(FieldType::Base(PrimitiveType::Int))
        );
    }

    #[test]
    fn trailing_junk_rejected() {
        assert!("(I)VJ".parse::<MethodDescriptor>().is_err());
        assert!("(I)".parse::<MethodDescriptor>().is_err());
        assert!("".parse::<MethodDescriptor>().is_err());
        assert!("(I[Ljava/lang/StringJ)V".parse::<MethodDescriptor>().is_err());
        assert!("(V)V".parse::<MethodDescriptor>().is_err());
    }

    #[test]
    fn array_class_constant_uses_descriptor_form() {
        let t: FieldType = "[[I".parse().unwrap();
        assert_eq!(t.class_constant_name().unwrap(), "[[I");
        let o: FieldType = "Ljava/util/List;".parse().unwrap();
        assert_eq!(o.class_constant_name().unwrap(), "java/util/List");
    }

    proptest! {
        #[test]
        fn descriptor_round_trips(
            params in proptest::collection::vec("(\\[{0,2})[ZBCSIJFD]|(\\[{0,2})Ljava/[a-z]{1,8}/[A-Z][a-zA-Z]{0,8};", 0..6),
            ret in "V|I|J|Ljava/lang/Object;",
        ) {
            let text = format!("({}){}", params.concat(), ret);
            let parsed: MethodDescriptor = text.parse().unwrap();
            prop_assert_eq!(parsed.descriptor(), text);
        }
    }
}
