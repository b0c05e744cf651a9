// BER definite-length octets (X.690 8.1.3)

use crate::error::DecodeError;

/// Long form with this many length octets is reserved by X.690.
const RESERVED_LENGTH_OCTETS: usize = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BerLength {
    pub value: usize,
    pub encoded_len: usize,
}

impl BerLength {
    /// Parse the length octets at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let first = *data.first().ok_or(DecodeError::PartialData)?;
        if first & 0x80 == 0 {
            return Ok(BerLength {
                value: first as usize,
                encoded_len: 1,
            });
        }

        let octets = (first & 0x7F) as usize;
        if octets == 0 {
            return Err(DecodeError::IndefiniteLength);
        }
        if octets == RESERVED_LENGTH_OCTETS {
            return Err(DecodeError::malformed("reserved long-form length octet 0xFF"));
        }
        if octets > std::mem::size_of::<usize>() {
            return Err(DecodeError::malformed(format!(
                "length uses {} octets, more than supported",
                octets
            )));
        }
        if data.len() < 1 + octets {
            return Err(DecodeError::PartialData);
        }

        let value = data[1..=octets]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        Ok(BerLength {
            value,
            encoded_len: 1 + octets,
        })
    }
}

/// Append the shortest definite-length encoding of `length`.
pub fn encode_length(length: usize, out: &mut Vec<u8>) {
    if length < 0x80 {
        out.push(length as u8);
        return;
    }
    let bytes = length.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    out.push(0x80 | (bytes.len() - start) as u8);
    out.extend_from_slice(&bytes[start..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(length: usize) -> Vec<u8> {
        let mut out = Vec::new();
        encode_length(length, &mut out);
        out
    }

    #[test]
    fn test_short_form() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(127), vec![0x7F]);
        let len = BerLength::parse(&[0x05, 0xAA]).unwrap();
        assert_eq!(len.value, 5);
        assert_eq!(len.encoded_len, 1);
    }

    #[test]
    fn test_long_form() {
        assert_eq!(encoded(128), vec![0x81, 0x80]);
        assert_eq!(encoded(256), vec![0x82, 0x01, 0x00]);
        assert_eq!(encoded(131071), vec![0x83, 0x01, 0xFF, 0xFF]);
        let len = BerLength::parse(&[0x83, 0x01, 0xFF, 0xFF]).unwrap();
        assert_eq!(len.value, 131071);
        assert_eq!(len.encoded_len, 4);
    }

    #[test]
    fn test_indefinite_is_distinct_error() {
        assert_eq!(BerLength::parse(&[0x80]), Err(DecodeError::IndefiniteLength));
    }

    #[test]
    fn test_reserved_length_octet() {
        assert!(matches!(
            BerLength::parse(&[0xFF, 0x00, 0x00]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_need_more_data() {
        assert_eq!(BerLength::parse(&[]), Err(DecodeError::PartialData));
        assert_eq!(BerLength::parse(&[0x82, 0x01]), Err(DecodeError::PartialData));
    }
}
