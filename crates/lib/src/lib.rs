//! Leaf types shared by every ATP crate: content hashes, the wire buffer
//! codec, and asset path validation.

pub mod buffer;
pub mod error;
pub mod hash;
pub mod path;

pub use hash::{hash_bytes, Hash};
