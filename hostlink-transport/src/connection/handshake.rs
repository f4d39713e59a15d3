//! Connection handshake: attribute exchange, then optional server start.
//!
//! The connection layer does not know what a service's handshake messages
//! look like. A [`Handshake`] builds them and judges the replies; the default
//! [`Handshake::negotiate`] drives the exchange over the new connection.

use async_trait::async_trait;
use hostlink_core::Credentials;
use thiserror::Error;

use super::core::ServiceConnection;
use crate::error::{ServerError, ServerResult};
use crate::message::{Message, Reply};
use crate::registry::ReplyPrototype;

/// A handshake reply was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The host's attributes are unusable: wrong level, bad seed, missing data.
    #[error("negotiation failed: {message}")]
    Negotiation {
        /// Details about the failure.
        message: String,
    },

    /// The host refused the credentials.
    #[error("sign-on rejected (return code {return_code:#x}): {message}")]
    Rejected {
        /// Return code reported by the host.
        return_code: u32,
        /// Details about the rejection.
        message: String,
    },
}

impl From<HandshakeError> for ServerError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Negotiation { message } => ServerError::Connect { message },
            HandshakeError::Rejected {
                return_code,
                message,
            } => ServerError::Authentication {
                return_code,
                message,
            },
        }
    }
}

/// Service-specific opening exchange of a connection.
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Prototypes for the handshake replies, installed on the connection
    /// before the exchange starts.
    fn reply_prototypes(&self) -> Vec<(u16, ReplyPrototype)> {
        Vec::new()
    }

    /// The exchange-attributes request.
    fn exchange_attributes(&self) -> Box<dyn Message>;

    /// Accept or refuse the exchange-attributes reply.
    fn check_attributes(&self, reply: &Reply) -> Result<(), HandshakeError>;

    /// The start-server request, if this service authenticates the job.
    fn start_server(&self, _credentials: &Credentials) -> Option<Box<dyn Message>> {
        None
    }

    /// Accept or refuse the start-server reply, returning the job identifier
    /// when the host reports one.
    fn check_start_server(&self, _reply: &Reply) -> Result<Option<String>, HandshakeError> {
        Ok(None)
    }

    /// Run the exchange over `connection`.
    ///
    /// The exchange-attributes reply is cached on the connection. Returns the
    /// job identifier, if any.
    async fn negotiate(
        &self,
        connection: &ServiceConnection,
        credentials: Option<&Credentials>,
    ) -> ServerResult<Option<String>> {
        let mut request = self.exchange_attributes();
        let reply = connection.send_and_receive(request.as_mut()).await?;
        self.check_attributes(&reply)?;
        connection.set_exchange_attributes_reply(reply);

        let Some(credentials) = credentials else {
            return Ok(None);
        };
        let Some(mut request) = self.start_server(credentials) else {
            return Ok(None);
        };
        let reply = connection.send_and_receive(request.as_mut()).await?;
        Ok(self.check_start_server(&reply)?)
    }
}
