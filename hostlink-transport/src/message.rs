//! Message trait and the decoded [`Reply`] type.
//!
//! Messages are opaque to the connection layer: they expose a correlation id,
//! a request/reply discriminator and know how to write their own body. The
//! envelope header around the body is produced here.

use std::any::Any;
use std::fmt;

use hostlink_core::CodecError;

use crate::wire::{self, EnvelopeHeader};

/// Object-safe access to [`Any`] for message trait objects.
pub trait AsAny {
    /// Borrow as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;

    /// Convert a boxed value into `Box<dyn Any>`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A request or reply datastream.
pub trait Message: AsAny + fmt::Debug + Send + Sync + 'static {
    /// Request or reply type carried in the envelope.
    fn request_reply_id(&self) -> u16;

    /// Size of the fixed template at the start of the body.
    fn template_length(&self) -> u16 {
        0
    }

    /// Correlation id currently stamped on the message.
    fn correlation_id(&self) -> u32;

    /// Stamp a correlation id on the message.
    fn set_correlation_id(&mut self, correlation_id: u32);

    /// Append the body (everything after the envelope header) to `out`.
    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError>;
}

/// A message that can be rebuilt from an inbound envelope.
pub trait DecodeReply: Message + Sized {
    /// Decode from the envelope header and the body bytes.
    fn decode(header: &EnvelopeHeader, body: &[u8]) -> Result<Self, CodecError>;
}

/// A decoded reply together with the envelope it arrived in.
pub struct Reply {
    header: EnvelopeHeader,
    message: Box<dyn Message>,
}

impl Reply {
    /// Wrap a decoded message.
    pub fn new(header: EnvelopeHeader, message: Box<dyn Message>) -> Self {
        Self { header, message }
    }

    /// Envelope header of the frame that carried the reply.
    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// Correlation id of the reply.
    pub fn correlation_id(&self) -> u32 {
        self.message.correlation_id()
    }

    /// Reply discriminator.
    pub fn request_reply_id(&self) -> u16 {
        self.header.request_reply_id
    }

    /// The decoded message as a trait object.
    pub fn message(&self) -> &dyn Message {
        &*self.message
    }

    /// Whether the reply decoded to `T`.
    pub fn is<T: Message>(&self) -> bool {
        self.message().as_any().is::<T>()
    }

    /// Borrow the concrete reply.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.message().as_any().downcast_ref::<T>()
    }

    /// Take the concrete reply, or get `self` back if it is another type.
    pub fn downcast<T: Message>(self) -> Result<T, Reply> {
        if !self.is::<T>() {
            return Err(self);
        }
        match self.message.into_any().downcast::<T>() {
            Ok(message) => Ok(*message),
            // is::<T>() held above
            Err(_) => unreachable!("reply type changed during downcast"),
        }
    }

    pub(crate) fn set_correlation_id(&mut self, correlation_id: u32) {
        self.header.correlation_id = correlation_id;
        self.message.set_correlation_id(correlation_id);
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("header", &self.header)
            .field("message", &self.message)
            .finish()
    }
}

/// Frame a message for `server_id`.
pub(crate) fn encode_message(
    server_id: u16,
    message: &dyn Message,
    max_frame_size: usize,
) -> Result<Vec<u8>, crate::ServerError> {
    let mut body = Vec::new();
    message.encode_body(&mut body)?;

    let header = EnvelopeHeader {
        server_id,
        correlation_id: message.correlation_id(),
        template_length: message.template_length(),
        request_reply_id: message.request_reply_id(),
        ..Default::default()
    };
    Ok(wire::encode_frame(header, &body, max_frame_size)?)
}
