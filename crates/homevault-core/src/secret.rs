//! Zeroizing container for secret material
//!
//! All passwords, PINs, derived keys and high-entropy secrets travel in
//! `SecretBytes`, which wipes its buffer on drop. Copies out of the
//! container are deliberately not offered beyond `as_slice`.

use std::fmt;

use zeroize::Zeroizing;

/// Byte buffer that zeroes its contents when dropped.
#[derive(Clone, Default)]
pub struct SecretBytes {
    data: Zeroizing<Vec<u8>>,
}

impl SecretBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Zeroizing::new(data),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    /// Secret filled with `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Concatenation of two secrets, `a` then `b`.
    pub fn combine(a: &SecretBytes, b: &SecretBytes) -> SecretBytes {
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a.as_slice());
        out.extend_from_slice(b.as_slice());
        SecretBytes::new(out)
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for SecretBytes {}

impl AsRef<[u8]> for SecretBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&str> for SecretBytes {
    fn from(data: &str) -> Self {
        Self::from_slice(data.as_bytes())
    }
}

// The contents never appear in logs.
impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes({} bytes)", self.data.len())
    }
}
