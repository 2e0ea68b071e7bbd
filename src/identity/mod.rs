//! 身份与配对：Ed25519 密钥对、地址派生、执行端配对注册表

pub mod keys;
pub mod pairing;

pub use keys::{address_of, parse_public_key, Identity};
pub use pairing::{PairingRecord, PairingRegistry, PairingStatus};
