use thiserror::Error;

/// Errors returned by the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),

    #[error("mechanism already registered: {0}")]
    DuplicateMechanism(String),

    /// The token exchange failed; the context is now unusable.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("no mechanism acceptable to both peers")]
    NoCompatibleMechanism,

    /// The context has not completed negotiation yet.
    #[error("security context not established")]
    NotEstablished,

    #[error("message integrity check failed")]
    IntegrityFailure,

    /// The context failed earlier and will never succeed.
    #[error("security context has already failed")]
    AlreadyFailed,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("peer authentication failed")]
    AuthenticationFailed,

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("global registry already initialized")]
    RegistryInitialized,
}

impl From<kagi_mech::Error> for Error {
    fn from(err: kagi_mech::Error) -> Self {
        match err {
            kagi_mech::Error::IntegrityFailure => Self::IntegrityFailure,
            kagi_mech::Error::AuthenticationFailed => Self::AuthenticationFailed,
            kagi_mech::Error::MissingCredentials => {
                Self::MissingCredentials("credentials lack what the mechanism requires")
            }
            other => Self::Negotiation(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
