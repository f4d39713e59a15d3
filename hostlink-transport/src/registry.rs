//! Reply prototype registry: (service, discriminator) → reply factory.
//!
//! The dispatcher asks the registry how to rebuild the concrete reply type of
//! an inbound envelope. Registration happens once, up front, through
//! [`ReplyRegistryBuilder`]; the built [`ReplyRegistry`] is immutable and
//! shared by `Arc`, so lookups on the read path take no lock.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hostlink_core::{CodecError, ConfigurationError, ServiceId};

use crate::message::{DecodeReply, Message, Reply};
use crate::wire::EnvelopeHeader;

type DecodeFn = fn(&EnvelopeHeader, &[u8]) -> Result<Box<dyn Message>, CodecError>;

fn decode_as<T: DecodeReply>(
    header: &EnvelopeHeader,
    body: &[u8],
) -> Result<Box<dyn Message>, CodecError> {
    Ok(Box::new(T::decode(header, body)?))
}

/// Factory for one concrete reply type.
///
/// Two prototypes are equal when they build the same type.
#[derive(Clone, Copy)]
pub struct ReplyPrototype {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl ReplyPrototype {
    /// Prototype decoding inbound bodies as `T`.
    pub fn of<T: DecodeReply>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            decode: decode_as::<T>,
        }
    }

    /// Name of the reply type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Rebuild a reply from an envelope.
    pub fn decode(&self, header: &EnvelopeHeader, body: &[u8]) -> Result<Reply, CodecError> {
        let message = (self.decode)(header, body)?;
        Ok(Reply::new(*header, message))
    }
}

impl PartialEq for ReplyPrototype {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ReplyPrototype {}

impl fmt::Debug for ReplyPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReplyPrototype")
            .field(&self.type_name)
            .finish()
    }
}

type PrototypeKey = (ServiceId, u16);

/// Collects registrations before the registry is frozen.
#[derive(Debug, Default, Clone)]
pub struct ReplyRegistryBuilder {
    prototypes: HashMap<PrototypeKey, ReplyPrototype>,
}

impl ReplyRegistryBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `prototype` for replies of `service` carrying `discriminator`.
    ///
    /// Registering the same prototype again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::ConflictingPrototype`] if another
    /// prototype already owns the key. The first registration is kept.
    pub fn register(
        &mut self,
        service: ServiceId,
        discriminator: u16,
        prototype: ReplyPrototype,
    ) -> Result<&mut Self, ConfigurationError> {
        match self.prototypes.get(&(service, discriminator)) {
            Some(existing) if *existing == prototype => {}
            Some(existing) => {
                return Err(ConfigurationError::ConflictingPrototype {
                    service,
                    discriminator,
                    existing: existing.type_name,
                    attempted: prototype.type_name,
                });
            }
            None => {
                self.prototypes.insert((service, discriminator), prototype);
            }
        }
        Ok(self)
    }

    /// Shorthand for `register(service, discriminator, ReplyPrototype::of::<T>())`.
    pub fn register_type<T: DecodeReply>(
        &mut self,
        service: ServiceId,
        discriminator: u16,
    ) -> Result<&mut Self, ConfigurationError> {
        self.register(service, discriminator, ReplyPrototype::of::<T>())
    }

    /// Freeze into an immutable registry.
    pub fn build(self) -> ReplyRegistry {
        ReplyRegistry {
            prototypes: Arc::new(self.prototypes),
        }
    }
}

/// Immutable reply prototype table shared by every connection.
#[derive(Debug, Default, Clone)]
pub struct ReplyRegistry {
    prototypes: Arc<HashMap<PrototypeKey, ReplyPrototype>>,
}

impl ReplyRegistry {
    /// Prototype registered for `discriminator` on `service`.
    pub fn lookup(&self, service: ServiceId, discriminator: u16) -> Option<ReplyPrototype> {
        self.prototypes.get(&(service, discriminator)).copied()
    }

    /// Number of registered prototypes across all services.
    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}

/// Process-wide registration.
///
/// Registrations are accepted until the first call to [`registry`], which
/// freezes the snapshot every later caller shares.
pub mod global {
    use parking_lot::Mutex;

    use super::*;

    struct GlobalState {
        builder: Option<ReplyRegistryBuilder>,
        frozen: Option<ReplyRegistry>,
    }

    static STATE: Mutex<GlobalState> = Mutex::new(GlobalState {
        builder: None,
        frozen: None,
    });

    /// Register a prototype in the process-wide registry.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::ConflictingPrototype`] for a different prototype
    ///   under an existing key
    /// - [`ConfigurationError::RegistryFrozen`] for a new key after the first
    ///   [`registry`] call
    pub fn register(
        service: ServiceId,
        discriminator: u16,
        prototype: ReplyPrototype,
    ) -> Result<(), ConfigurationError> {
        let mut state = STATE.lock();
        if let Some(frozen) = &state.frozen {
            return match frozen.lookup(service, discriminator) {
                Some(existing) if existing == prototype => Ok(()),
                Some(existing) => Err(ConfigurationError::ConflictingPrototype {
                    service,
                    discriminator,
                    existing: existing.type_name(),
                    attempted: prototype.type_name(),
                }),
                None => Err(ConfigurationError::RegistryFrozen {
                    service,
                    discriminator,
                    attempted: prototype.type_name(),
                }),
            };
        }

        state
            .builder
            .get_or_insert_with(ReplyRegistryBuilder::new)
            .register(service, discriminator, prototype)?;
        Ok(())
    }

    /// The frozen process-wide registry.
    pub fn registry() -> ReplyRegistry {
        let mut state = STATE.lock();
        if let Some(frozen) = &state.frozen {
            return frozen.clone();
        }
        let registry = state.builder.take().unwrap_or_default().build();
        state.frozen = Some(registry.clone());
        registry
    }

    /// Whether [`registry`] has been called.
    pub fn is_frozen() -> bool {
        STATE.lock().frozen.is_some()
    }
}
