pub mod digest;
pub mod dilithium;
pub mod keypair;

pub use digest::{digest_of, Digest, DigestWriter, DIGEST_LEN};
pub use dilithium::{verify_signature, PublicKey, Signature, SignatureError};
pub use keypair::KeyPair;
