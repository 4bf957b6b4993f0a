//! Encryption codec: algo-44 (NIP-44 v2), legacy algo-04, and the shared
//! encryption-context abstraction the payload codec and request queue build on.

pub mod codec;
pub mod nip04;
pub mod nip44;

pub use codec::{combine, decrypt, encrypt, normalize_remote_pubkey, Algorithm, EncryptionContext};
