#![deny(unsafe_code)]

//! # kagi-mech
//!
//! Pure, sans-IO state machines for the authentication mechanisms behind
//! the `kagi` negotiation engine, plus the message protection they key.
//!
//! - [`TicketExchange`]: mutual authentication of a client principal to a
//!   named service, both holding X25519 static keys (IK pattern,
//!   `25519_ChaChaPoly_BLAKE2s`)
//! - [`ChallengeExchange`]: three-message challenge/response over a
//!   password-derived key
//! - [`Protection`]: per-direction sign or seal with sequence counters
//!
//! Every mechanism message is a [`wire`] frame, so a receiver can always
//! tell a complete message from a prefix.
//!
//! ## Security Properties
//!
//! - X25519 low-order point rejection
//! - All key material zeroized on drop
//! - Constant-time MAC and key comparisons
//! - Bounds-checked parsing; no panics on peer input

pub mod credentials;
pub mod crypto;
pub mod error;
pub mod features;
pub mod keys;
pub mod wire;

mod challenge;
mod cipher_state;
mod exchange;
mod protection;
mod symmetric_state;
mod ticket;

pub use challenge::{AUTHENTICATE, CHALLENGE, ChallengeExchange, NEGOTIATE};
pub use credentials::Credentials;
pub use error::Error;
pub use exchange::{Action, Established};
pub use features::Features;
pub use keys::{KeyPair, PublicKey, StaticSecret};
pub use protection::Protection;
pub use ticket::{AP_REP, AP_REQ, PROTOCOL_NAME, TicketExchange};
