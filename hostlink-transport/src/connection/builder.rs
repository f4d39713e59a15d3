//! Opening a connection: transport, dispatcher, handshake.

use hostlink_core::{Credentials, HostAddress, SecureChannelOptions, ServiceId, TransportProvider};

use super::config::ConnectionConfig;
use super::core::{Endpoints, ServiceConnection};
use super::handshake::Handshake;
use super::lease::ConnectionLease;
use crate::error::{ServerError, ServerResult};
use crate::registry::{self, ReplyRegistry};

/// Builder for a handshaken [`ServiceConnection`].
///
/// # Examples
///
/// ```ignore
/// let lease = ConnectionBuilder::new(ServiceId::Command)
///     .address(HostAddress::for_service("sys1", ServiceId::Command, false))
///     .credentials(Credentials::new("QUSER", "secret"))
///     .open(&TokioTransportProvider::new(), &CommandHandshake::default())
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    service: ServiceId,
    address: Option<HostAddress>,
    credentials: Option<Credentials>,
    secure: Option<SecureChannelOptions>,
    registry: Option<ReplyRegistry>,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Start building a connection to `service`.
    pub fn new(service: ServiceId) -> Self {
        Self {
            service,
            address: None,
            credentials: None,
            secure: None,
            registry: None,
            config: ConnectionConfig::default(),
        }
    }

    /// Address of the service job listener.
    pub fn address(mut self, address: HostAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Credentials presented by the start-server step.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Ask the provider for a secure channel.
    pub fn secure(mut self, options: SecureChannelOptions) -> Self {
        self.secure = Some(options);
        self
    }

    /// Reply registry to route with. Defaults to the process-wide registry.
    pub fn registry(mut self, registry: ReplyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Connection configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect, start the dispatcher and run the handshake.
    ///
    /// Both the connect and the handshake are bounded by
    /// `config.connect_timeout`. On failure the half-open connection is torn
    /// down before returning.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Connect`] if the transport cannot be opened or the
    ///   handshake does not complete
    /// - [`ServerError::Authentication`] if the host rejects the credentials
    pub async fn open<P, H>(self, provider: &P, handshake: &H) -> ServerResult<ConnectionLease>
    where
        P: TransportProvider,
        H: Handshake + ?Sized,
    {
        let service = self.service;
        let address = self.address.ok_or_else(|| ServerError::Connect {
            message: format!("no address configured for {service}"),
        })?;
        let connect_timeout = self.config.connect_timeout;

        let connect = provider.connect(&address, self.secure.as_ref());
        let stream = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::debug!(service = %service, address = %address, error = %err, "connect failed");
                return Err(ServerError::Connect {
                    message: format!("cannot reach {address}: {err}"),
                });
            }
            Err(_) => {
                return Err(ServerError::Connect {
                    message: format!("connect to {address} timed out after {connect_timeout:?}"),
                });
            }
        };

        let endpoints = Endpoints {
            local: provider.local_address(&stream),
            peer: Some(address.clone()),
        };
        let registry = self.registry.unwrap_or_else(registry::global::registry);
        let lease = ServiceConnection::spawn(service, stream, registry, self.config, endpoints);
        for (discriminator, prototype) in handshake.reply_prototypes() {
            lease.add_instance_prototype(discriminator, prototype);
        }

        let negotiation = tokio::time::timeout(
            connect_timeout,
            handshake.negotiate(&lease, self.credentials.as_ref()),
        )
        .await;

        let job = match negotiation {
            Ok(Ok(job)) => job,
            Ok(Err(err)) => {
                lease.force_disconnect();
                return Err(open_error(err));
            }
            Err(_) => {
                lease.force_disconnect();
                return Err(ServerError::Connect {
                    message: format!(
                        "handshake with {address} timed out after {connect_timeout:?}"
                    ),
                });
            }
        };

        if let Some(job) = job {
            lease.set_job(job);
        }
        tracing::debug!(
            service = %service,
            connection_id = lease.connection_id(),
            job = %lease.job(),
            "connection open"
        );
        Ok(lease)
    }
}

/// Anything that ends an open attempt other than a refusal is a connect failure.
fn open_error(err: ServerError) -> ServerError {
    match err {
        ServerError::Authentication { .. } | ServerError::Connect { .. } => err,
        ServerError::Configuration(_) => err,
        other => ServerError::Connect {
            message: format!("handshake failed: {other}"),
        },
    }
}
