pub mod canonical;
pub mod keys;
pub mod kdf;
pub mod symmetric;

pub use canonical::canonical_json;
pub use keys::{KeyPair, PublicKey};
