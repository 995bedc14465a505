/// Errors raised by the mechanism state machines and the protection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A cryptographic operation failed (e.g., AEAD decryption during the exchange).
    CryptoFailed,
    /// A public key is invalid (low-order point, wrong length, etc.).
    BadKey,
    /// An operation was attempted in the wrong exchange state.
    WrongState,
    /// The mechanism message is malformed, truncated or of the wrong kind.
    BadMessage,
    /// A message does not fit the 16-bit frame length.
    MessageTooLarge,
    /// The sequence counter of a protection channel has been exhausted.
    NonceExhausted,
    /// The peer could not be authenticated (unknown principal, bad proof, wrong key).
    AuthenticationFailed,
    /// The local credentials lack what this mechanism and role require.
    MissingCredentials,
    /// A protected message failed its integrity check.
    IntegrityFailure,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::CryptoFailed => write!(f, "cryptographic operation failed"),
            Self::BadKey => write!(f, "invalid public key"),
            Self::WrongState => write!(f, "operation not valid in current state"),
            Self::BadMessage => write!(f, "malformed mechanism message"),
            Self::MessageTooLarge => write!(f, "message exceeds the frame length limit"),
            Self::NonceExhausted => write!(f, "sequence counter exhausted"),
            Self::AuthenticationFailed => write!(f, "peer authentication failed"),
            Self::MissingCredentials => write!(f, "credentials insufficient for mechanism"),
            Self::IntegrityFailure => write!(f, "message integrity check failed"),
        }
    }
}

impl core::error::Error for Error {}
