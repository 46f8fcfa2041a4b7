//! Issued token values and the redacted secret wrapper they carry.

pub mod access;
pub mod secret;
