//! Transformers bound to the stream processor's transform stack
//! (`gw_protocol::transform`), plus the bandwidth limiter used by the
//! tunnel lifecycle engine's data pump.

pub mod bandwidth;
pub mod compress;
pub mod encrypt;

pub use bandwidth::TokenBucket;
pub use compress::ZlibCompressor;
pub use encrypt::{AesGcmEncryptor, ChaCha20Poly1305Encryptor};
