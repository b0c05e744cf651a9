// Security-layer message wrapping (RFC 4422 section 3.7 buffers)

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WrapError {
    /// The raw bytes do not yet hold a complete wrapped frame.
    #[error("incomplete wrapped frame")]
    Partial,
    #[error("{0}")]
    Failed(String),
}

/// Plaintext recovered from the wire, and how many raw bytes it used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub data: Vec<u8>,
    pub consumed: usize,
}

/// Sits between the byte stream and the BER codec.
pub trait MessageWrapper: Send {
    fn wrap(&mut self, plain: &[u8]) -> Result<Vec<u8>, WrapError>;

    /// Unwrap the first frame in `raw`. Leftover bytes stay with the caller.
    fn unwrap(&mut self, raw: &[u8]) -> Result<Unwrapped, WrapError>;
}

/// A negotiated SASL security layer (integrity and/or confidentiality).
pub trait SecurityLayer: Send {
    fn encode(&mut self, plain: &[u8]) -> Result<Vec<u8>, String>;
    fn decode(&mut self, cipher: &[u8]) -> Result<Vec<u8>, String>;
}

const LENGTH_PREFIX: usize = 4;
pub const DEFAULT_MAX_BUFFER: usize = 0x00FF_FFFF;

/// Frames each security-layer buffer with a four octet big-endian length.
pub struct SaslBufferWrapper<L> {
    layer: L,
    max_buffer: usize,
}

impl<L: SecurityLayer> SaslBufferWrapper<L> {
    pub fn new(layer: L) -> Self {
        Self {
            layer,
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }

    /// The largest buffer the peer may send, as negotiated during bind.
    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }
}

impl<L: SecurityLayer> MessageWrapper for SaslBufferWrapper<L> {
    fn wrap(&mut self, plain: &[u8]) -> Result<Vec<u8>, WrapError> {
        let body = self.layer.encode(plain).map_err(WrapError::Failed)?;
        let len = u32::try_from(body.len())
            .map_err(|_| WrapError::Failed(format!("security layer buffer too large: {}", body.len())))?;
        let mut out = Vec::with_capacity(LENGTH_PREFIX + body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn unwrap(&mut self, raw: &[u8]) -> Result<Unwrapped, WrapError> {
        let Some(prefix) = raw.get(..LENGTH_PREFIX) else {
            return Err(WrapError::Partial);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > self.max_buffer {
            return Err(WrapError::Failed(format!(
                "security layer buffer of {} bytes exceeds the negotiated maximum {}",
                len, self.max_buffer
            )));
        }
        let end = LENGTH_PREFIX + len;
        let Some(body) = raw.get(LENGTH_PREFIX..end) else {
            return Err(WrapError::Partial);
        };
        Ok(Unwrapped {
            data: self.layer.decode(body).map_err(WrapError::Failed)?,
            consumed: end,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// XORs every byte; enough to prove bytes pass through the layer.
    pub(crate) struct XorLayer(pub u8);

    impl SecurityLayer for XorLayer {
        fn encode(&mut self, plain: &[u8]) -> Result<Vec<u8>, String> {
            Ok(plain.iter().map(|b| b ^ self.0).collect())
        }

        fn decode(&mut self, cipher: &[u8]) -> Result<Vec<u8>, String> {
            Ok(cipher.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[test]
    fn test_wrap_prefixes_length() {
        let mut wrapper = SaslBufferWrapper::new(XorLayer(0));
        assert_eq!(wrapper.wrap(b"abc").unwrap(), vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_unwrap_reports_partial_and_consumed() {
        let mut wrapper = SaslBufferWrapper::new(XorLayer(0x5A));
        let mut raw = wrapper.wrap(b"hello").unwrap();
        assert_eq!(wrapper.unwrap(&raw[..3]), Err(WrapError::Partial));
        assert_eq!(wrapper.unwrap(&raw[..6]), Err(WrapError::Partial));

        raw.extend_from_slice(&[0, 0]);
        let unwrapped = wrapper.unwrap(&raw).unwrap();
        assert_eq!(unwrapped.data, b"hello");
        assert_eq!(unwrapped.consumed, 9);
    }

    #[test]
    fn test_unwrap_rejects_oversized_buffer() {
        let mut wrapper = SaslBufferWrapper::new(XorLayer(0)).with_max_buffer(4);
        assert!(matches!(wrapper.unwrap(&[0, 0, 0, 5, 1]), Err(WrapError::Failed(_))));
    }
}
