pub mod error;
pub mod fingerprint;
pub mod image;
pub mod limiters;

pub use fingerprint::{fingerprint, ContentFingerprint};
