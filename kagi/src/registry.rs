//! Mechanism table: name and SASL-name lookup, registration order.

use std::fmt;
use std::sync::{Arc, OnceLock};

use kagi_mech::Credentials;
use tracing::debug;

use crate::active_exchange::{KRB5, NTLMSSP};
use crate::error::{Error, Result};
use crate::mechanism::{Mechanism, MechanismOptions, Role};
use crate::spnego::SPNEGO;

/// Builds a fresh provider for one context.
pub type MechanismFactory = fn(MechanismOptions) -> Box<dyn Mechanism>;

/// Whether a mechanism can run in `role` with the given credentials.
pub type UsablePredicate = fn(Role, &Credentials) -> bool;

/// Static description of a registered mechanism.
#[derive(Clone, Copy)]
pub struct MechanismDescriptor {
    /// Unique, case-sensitive mechanism name.
    pub name: &'static str,
    /// SASL name (RFC 4422), matched case-insensitively.
    pub sasl_name: &'static str,
    /// Negotiates among other mechanisms rather than authenticating itself.
    pub negotiates: bool,
    pub factory: MechanismFactory,
    pub usable: UsablePredicate,
}

impl fmt::Debug for MechanismDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismDescriptor")
            .field("name", &self.name)
            .field("sasl_name", &self.sasl_name)
            .field("negotiates", &self.negotiates)
            .finish_non_exhaustive()
    }
}

/// Registered mechanisms in priority (registration) order.
#[derive(Debug, Default)]
pub struct Registry {
    mechanisms: Vec<MechanismDescriptor>,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `krb5`, `ntlmssp` and `spnego`, in that order.
    pub fn with_defaults() -> Self {
        Self {
            mechanisms: vec![KRB5, NTLMSSP, SPNEGO],
        }
    }

    /// The process-wide registry, built from [`with_defaults`](Self::with_defaults)
    /// on first use unless [`install_global`](Self::install_global) ran first.
    pub fn global() -> Arc<Registry> {
        GLOBAL
            .get_or_init(|| Arc::new(Registry::with_defaults()))
            .clone()
    }

    /// Install `registry` as the process-wide registry.
    ///
    /// Fails once the global registry has been initialized, either by an
    /// earlier install or by a call to [`global`](Self::global).
    pub fn install_global(registry: Registry) -> Result<()> {
        GLOBAL
            .set(Arc::new(registry))
            .map_err(|_| Error::RegistryInitialized)
    }

    pub fn register(&mut self, descriptor: MechanismDescriptor) -> Result<()> {
        let taken = self.mechanisms.iter().any(|m| {
            m.name == descriptor.name || m.sasl_name.eq_ignore_ascii_case(descriptor.sasl_name)
        });
        if taken {
            return Err(Error::DuplicateMechanism(descriptor.name.to_owned()));
        }
        debug!(
            "Registered mechanism {} (SASL {})",
            descriptor.name, descriptor.sasl_name
        );
        self.mechanisms.push(descriptor);
        Ok(())
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<&MechanismDescriptor> {
        self.mechanisms
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::UnknownMechanism(name.to_owned()))
    }

    pub fn lookup_by_sasl_name(&self, sasl_name: &str) -> Result<&MechanismDescriptor> {
        self.mechanisms
            .iter()
            .find(|m| m.sasl_name.eq_ignore_ascii_case(sasl_name))
            .ok_or_else(|| Error::UnknownMechanism(sasl_name.to_owned()))
    }

    /// All mechanisms, in registration order.
    pub fn enumerate(&self) -> impl Iterator<Item = &MechanismDescriptor> {
        self.mechanisms.iter()
    }

    /// The first registered negotiation wrapper.
    pub fn negotiator(&self) -> Option<&MechanismDescriptor> {
        self.mechanisms.iter().find(|m| m.negotiates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_in_priority_order() {
        let registry = Registry::with_defaults();
        let names: Vec<_> = registry.enumerate().map(|m| m.name).collect();
        assert_eq!(names, ["krb5", "ntlmssp", "spnego"]);
        assert_eq!(registry.negotiator().map(|m| m.name), Some("spnego"));
    }

    #[test]
    fn lookup_by_name_is_exact() {
        let registry = Registry::with_defaults();
        assert_eq!(registry.lookup_by_name("ntlmssp").unwrap().sasl_name, "NTLM");
        assert_eq!(
            registry.lookup_by_name("NTLMSSP").unwrap_err(),
            Error::UnknownMechanism("NTLMSSP".into())
        );
    }

    #[test]
    fn lookup_by_sasl_name_ignores_case() {
        let registry = Registry::with_defaults();
        assert_eq!(registry.lookup_by_sasl_name("gssapi").unwrap().name, "krb5");
        assert_eq!(registry.lookup_by_sasl_name("GSS-SPNEGO").unwrap().name, "spnego");
        assert!(registry.lookup_by_sasl_name("PLAIN").is_err());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut registry = Registry::with_defaults();
        assert_eq!(
            registry.register(KRB5),
            Err(Error::DuplicateMechanism("krb5".into()))
        );

        let sasl_clash = MechanismDescriptor {
            name: "other",
            sasl_name: "ntlm",
            ..NTLMSSP
        };
        assert_eq!(
            registry.register(sasl_clash),
            Err(Error::DuplicateMechanism("other".into()))
        );
        assert_eq!(registry.enumerate().count(), 3);
    }

    #[test]
    fn empty_registry_has_no_negotiator() {
        let mut registry = Registry::new();
        assert!(registry.negotiator().is_none());
        registry.register(NTLMSSP).unwrap();
        assert!(registry.negotiator().is_none());
        assert_eq!(registry.enumerate().count(), 1);
    }
}
