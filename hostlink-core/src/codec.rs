//! Body encoding errors.
//!
//! The connection layer never interprets a message body: each request encodes
//! itself and each reply prototype decodes itself. [`CodecError`] is what those
//! hand-written codecs report, and [`CodecError::require`] covers the bounds
//! check every fixed-layout decoder starts with.
//!
//! ```rust
//! use hostlink_core::CodecError;
//!
//! fn decode_level(body: &[u8]) -> Result<u16, CodecError> {
//!     CodecError::require(body, 2)?;
//!     Ok(u16::from_be_bytes([body[0], body[1]]))
//! }
//!
//! assert_eq!(decode_level(&[0, 7]).expect("level"), 7);
//! assert!(matches!(
//!     decode_level(&[0]),
//!     Err(CodecError::Truncated { needed: 2, have: 1 })
//! ));
//! ```

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// A message body could not be built or read.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A request body could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[source] BoxedError),

    /// A reply body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[source] BoxedError),

    /// The body ended before a fixed-size field.
    #[error("truncated body: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes the field layout requires.
        needed: usize,
        /// Bytes actually present.
        have: usize,
    },
}

impl CodecError {
    /// Decode failure described by a message.
    pub fn malformed(message: impl Into<String>) -> Self {
        let message: String = message.into();
        CodecError::Decode(message.into())
    }

    /// Encode failure described by a message.
    pub fn unencodable(message: impl Into<String>) -> Self {
        let message: String = message.into();
        CodecError::Encode(message.into())
    }

    /// Fail with [`CodecError::Truncated`] unless `body` holds `needed` bytes.
    pub fn require(body: &[u8], needed: usize) -> Result<(), CodecError> {
        if body.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                have: body.len(),
            });
        }
        Ok(())
    }
}
