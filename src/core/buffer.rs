//! Immutable byte chunks carried from the pty read path to the renderer.

use std::ops::Deref;
use std::sync::Arc;

/// A reference-counted, immutable chunk of session output.
///
/// Cloning only bumps the reference count; the bytes are shared between all
/// holders and freed when the last clone drops. A buffer is never resized or
/// reused after construction.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Arc<[u8]>,
}

impl Buffer {
    /// Build a buffer by copying `bytes` out of a read scratch buffer.
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self {
            data: Arc::from(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[allow(dead_code)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
