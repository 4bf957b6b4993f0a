//! `nip46-core` — a client-side implementation of the NIP-46 remote-signing
//! protocol carried over a publish/subscribe relay network. The crate holds
//! no user private key: it pairs with an external remote signer and
//! mediates pairing, session persistence, the encrypted request/response
//! codec, in-flight request tracking, relay fan-out, and observable session
//! state for a host UI.

pub(crate) mod cipher;
pub mod config;
pub mod error;
pub mod keys;
pub(crate) mod payload;
pub mod relay;
pub(crate) mod rt;
pub mod session;
pub mod storage;
pub mod telemetry;
pub(crate) mod time;
pub mod uri;

mod queue;
mod service;


pub use config::{QueueConfig, RelayTransportConfig};
pub use error::Nip46Error;
pub use payload::{Method, RequestPayload, ResponsePayload};
pub use relay::{Filter, RelayEvent, RelayTransport, Transport};
pub use service::{CreateInvitationOptions, Nip46Client, PairOptions};
pub use session::{Session, SessionManager, SessionMetadata, SessionSnapshot, SessionStatus, SessionType};
pub use storage::{FileStorage, InMemoryStorage, Storage};
pub use uri::{ClientInitiatedToken, PairingToken, SignerInitiatedToken};
