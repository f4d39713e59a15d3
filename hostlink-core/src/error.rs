//! Configuration errors.

use crate::ServiceId;

/// A lookup or registration that can never succeed with the given input.
///
/// These are programming or deployment errors. Callers must not fall back to a
/// default service or prototype when they see one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// No service is known under this symbolic name.
    #[error("unknown service name: {name:?}")]
    UnknownServiceName {
        /// The name that was looked up.
        name: String,
    },

    /// No service uses this server id on the wire.
    #[error("unknown service wire code: {code:#06x}")]
    UnknownWireCode {
        /// The wire code that was looked up.
        code: u16,
    },

    /// No service has this service constant.
    #[error("unknown service index: {index}")]
    UnknownServiceIndex {
        /// The index that was looked up.
        index: u8,
    },

    /// A different reply prototype is already registered for the discriminator.
    #[error(
        "conflicting reply prototype for {service} discriminator {discriminator:#06x}: \
         {existing} already registered, refused {attempted}"
    )]
    ConflictingPrototype {
        /// Service whose table holds the discriminator.
        service: ServiceId,
        /// The reply discriminator.
        discriminator: u16,
        /// Type name of the prototype that won the first registration.
        existing: &'static str,
        /// Type name of the refused prototype.
        attempted: &'static str,
    },

    /// The process-wide registry was already frozen by its first reader.
    #[error(
        "reply registry is frozen: cannot register {attempted} for {service} \
         discriminator {discriminator:#06x}"
    )]
    RegistryFrozen {
        /// Service of the refused registration.
        service: ServiceId,
        /// Discriminator of the refused registration.
        discriminator: u16,
        /// Type name of the refused prototype.
        attempted: &'static str,
    },
}
