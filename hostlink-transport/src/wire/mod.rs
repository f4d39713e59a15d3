//! Envelope framing for host server datastreams.
//!
//! Frame format (all fields big-endian):
//! `[length:4][header_id:2][server_id:2][instance:4][correlation:4][template_len:2][req_rep_id:2][body:N]`
//!
//! - **length**: total frame size including the 20-byte header
//! - **header_id**: flags word, zero for ordinary datastreams
//! - **server_id**: wire code of the service job (see `hostlink_core::ServiceId`)
//! - **instance**: client/server instance, zero unless a service assigns one
//! - **correlation**: routes a reply to the request that produced it
//! - **template_len**: size of the fixed template that starts the body
//! - **req_rep_id**: request or reply type, the reply prototype discriminator
//!
//! The length prefix is what makes resynchronisation possible: a frame whose
//! header parses can always be skipped, even when its body is not understood.

/// Header size: 4 + 2 + 2 + 4 + 4 + 2 + 2 = 20 bytes.
pub const HEADER_SIZE: usize = 20;

/// Default upper bound on a frame, header included (16 MiB).
///
/// Larger length fields are treated as stream corruption.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Length field is smaller than the header itself.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Frame exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame size in bytes, header included.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl WireError {
    /// Whether the stream position is lost and the connection must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::InvalidLength { .. } | WireError::FrameTooLarge { .. }
        )
    }
}

/// Fixed-size envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeHeader {
    /// Total frame size including header.
    pub length: u32,
    /// Header flags word.
    pub header_id: u16,
    /// Wire code of the service job.
    pub server_id: u16,
    /// Client/server instance.
    pub instance: u32,
    /// Correlation id.
    pub correlation_id: u32,
    /// Length of the fixed template at the start of the body.
    pub template_length: u16,
    /// Request or reply type.
    pub request_reply_id: u16,
}

impl EnvelopeHeader {
    /// Serialize header into buffer (must be at least HEADER_SIZE bytes).
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than HEADER_SIZE.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.header_id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.server_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.instance.to_be_bytes());
        buf[12..16].copy_from_slice(&self.correlation_id.to_be_bytes());
        buf[16..18].copy_from_slice(&self.template_length.to_be_bytes());
        buf[18..20].copy_from_slice(&self.request_reply_id.to_be_bytes());
    }

    /// Deserialize header from buffer.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if buffer is smaller than HEADER_SIZE.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        Ok(Self {
            length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            header_id: u16::from_be_bytes([buf[4], buf[5]]),
            server_id: u16::from_be_bytes([buf[6], buf[7]]),
            instance: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            correlation_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            template_length: u16::from_be_bytes([buf[16], buf[17]]),
            request_reply_id: u16::from_be_bytes([buf[18], buf[19]]),
        })
    }

    /// Body size implied by the length field.
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }

    fn validate(&self, max_frame_size: usize) -> Result<(), WireError> {
        if (self.length as usize) < HEADER_SIZE {
            return Err(WireError::InvalidLength {
                length: self.length,
            });
        }
        if self.length as usize > max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: self.length as usize,
                max: max_frame_size,
            });
        }
        Ok(())
    }
}

/// Serialize a frame from a header template and body.
///
/// The header's `length` field is computed; whatever the caller put there is
/// ignored.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the frame would exceed `max_frame_size`.
///
/// # Examples
///
/// ```
/// use hostlink_transport::wire::{EnvelopeHeader, encode_frame, try_split_frame, HEADER_SIZE};
///
/// let header = EnvelopeHeader { server_id: 0xE009, correlation_id: 5, ..Default::default() };
/// let frame = encode_frame(header, b"body", 1024).expect("encode");
/// assert_eq!(frame.len(), HEADER_SIZE + 4);
///
/// let (parsed, consumed) = try_split_frame(&frame, 1024).expect("valid").expect("complete");
/// assert_eq!(parsed.correlation_id, 5);
/// assert_eq!(consumed, frame.len());
/// ```
pub fn encode_frame(
    header: EnvelopeHeader,
    body: &[u8],
    max_frame_size: usize,
) -> Result<Vec<u8>, WireError> {
    let total_length = HEADER_SIZE + body.len();
    if total_length > max_frame_size || total_length > u32::MAX as usize {
        return Err(WireError::FrameTooLarge {
            size: total_length,
            max: max_frame_size,
        });
    }

    let header = EnvelopeHeader {
        length: total_length as u32,
        ..header
    };

    let mut data = vec![0u8; total_length];
    header.serialize_into(&mut data[..HEADER_SIZE]);
    data[HEADER_SIZE..].copy_from_slice(body);
    Ok(data)
}

/// Try to split one frame off the front of a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some((header, consumed)))` if a complete frame is buffered; the body
///   is `data[HEADER_SIZE..consumed]`
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if the length field is unusable; the stream cannot be resynchronised
pub fn try_split_frame(
    data: &[u8],
    max_frame_size: usize,
) -> Result<Option<(EnvelopeHeader, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = EnvelopeHeader::deserialize(data)?;
    header.validate(max_frame_size)?;

    let expected_len = header.length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    Ok(Some((header, expected_len)))
}
