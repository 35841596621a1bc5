//! # Bounded Copy Utilities
//!
//! Helpers for moving borrowed strings and byte slices into fixed-capacity
//! `heapless` buffers, reporting overflow as [`Error::BufferTooSmall`] instead
//! of truncating.

use heapless::{String, Vec};

use crate::error::Error;

/// Copies a string into an owned fixed-capacity string.
pub fn copy_str<const N: usize>(src: &str) -> Result<String<N>, Error> {
    let mut owned = String::new();
    owned.push_str(src).map_err(|_| Error::BufferTooSmall)?;
    Ok(owned)
}

/// Copies a byte slice into an owned fixed-capacity vector.
pub fn copy_bytes<const N: usize>(src: &[u8]) -> Result<Vec<u8, N>, Error> {
    Vec::from_slice(src).map_err(|_| Error::BufferTooSmall)
}
