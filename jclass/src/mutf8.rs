use std::borrow::Cow;

use crate::error::ClassFormatError;

/// Decodes modified UTF-8 (JVM flavour of CESU-8) into a string.
///
/// Only called on demand; pool comparisons work on the raw bytes.
pub fn decode(bytes: &[u8]) -> Result<Cow<'_, str>, ClassFormatError> {
    cesu8::from_java_cesu8(bytes).map_err(|_| ClassFormatError::InvalidUtf8)
}

/// Encodes a string into modified UTF-8. ASCII input borrows.
pub fn encode(s: &str) -> Cow<'_, [u8]> {
    cesu8::to_java_cesu8(s)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ascii_round_trip() {
        let encoded = encode("java/lang/System");
        assert_eq!(&*encoded, b"java/lang/System");
        assert_eq!(decode(&encoded).unwrap(), "java/lang/System");
    }

    #[test]
    fn embedded_nul_uses_two_bytes() {
        let encoded = encode("a\0b");
        assert_eq!(&*encoded, &[0x61, 0xC0, 0x80, 0x62]);
        assert_eq!(decode(&encoded).unwrap(), "a\0b");
    }
}
