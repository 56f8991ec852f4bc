//! This module defines the checked types shared by the node and the master:
//! command keys, access widths and the crate error type.

use snafu::{ensure, OptionExt, Snafu};

use arrayvec::ArrayVec;
use core::convert::TryFrom;
use core::ops::Deref;

/// Maximum length of a command key, in bytes.
pub const MAX_KEY_LEN: usize = 7;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// The key is longer than seven bytes or contains a colon.
    #[snafu(display("Invalid command key"))]
    InvalidKey,
    /// All handler slots are taken.
    #[snafu(display("Handler registry is full"))]
    RegistryFull,
    /// A handler is already registered for the key.
    #[snafu(display("Key is already registered"))]
    DuplicateKey,
    /// The payload doesn't fit in the 16-bit size field, or its size
    /// equals the resync marker.
    #[snafu(display("Payload of {len} bytes is too large"))]
    PayloadTooLarge { len: usize },
}

const fn invalid_key() -> InvalidKeySnafu {
    InvalidKeySnafu
}

/// Key is a short (at most seven bytes) command name without colons.
///
/// ## Example
/// ```
/// use seracc_proto::Key;
/// let key = Key::new("led").unwrap();
/// assert_eq!(key.as_bytes(), b"led");
/// assert!(Key::new("too_long").is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Hash)]
pub struct Key(ArrayVec<u8, MAX_KEY_LEN>);

impl Key {
    /// Create a new key, checking length and the absence of `:`.
    /// # Errors
    /// Returns [`Error::InvalidKey`] if `key` can't be used as a command key.
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, Error> {
        let key = key.as_ref();
        ensure!(!key.contains(&b':'), invalid_key());
        let mut buf = ArrayVec::new();
        buf.try_extend_from_slice(key).ok().with_context(invalid_key)?;
        Ok(Self(buf))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Deref for Key {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl PartialEq<[u8]> for Key {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

/// Trait to convert strings and byte slices into a [`Key`].
pub trait IntoKey {
    /// Convert self to a Key.
    /// # Errors
    /// Returns `Error::InvalidKey` if self isn't a valid key.
    fn into_key(self) -> Result<Key, Error>;
}

impl IntoKey for Key {
    fn into_key(self) -> Result<Key, Error> {
        Ok(self)
    }
}

impl IntoKey for &str {
    fn into_key(self) -> Result<Key, Error> {
        Key::new(self)
    }
}

impl IntoKey for &[u8] {
    fn into_key(self) -> Result<Key, Error> {
        Key::new(self)
    }
}

impl TryFrom<&str> for Key {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Access width of a register read or write.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum Width {
    /// 8-bit access
    Byte,
    /// 16-bit access
    Half,
    /// 32-bit access
    Word,
}

impl Width {
    /// Number of bytes moved by an access of this width.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Half => 2,
            Self::Word => 4,
        }
    }

    /// Mask of the bits covered by this width.
    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Half => 0xFFFF,
            Self::Word => u32::MAX,
        }
    }
}

impl TryFrom<u32> for Width {
    type Error = ();

    /// Converts a width in bits.
    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(Self::Byte),
            16 => Ok(Self::Half),
            32 => Ok(Self::Word),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod key_tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert_eq!(Key::new("").unwrap().len(), 0);
        assert_eq!(Key::new("_").unwrap().as_bytes(), b"_");
        assert_eq!(Key::new("1234567").unwrap().len(), 7);
        let key: Key = "led".try_into().unwrap();
        assert_eq!(&key, b"led".as_slice());
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(Key::new("12345678"), Err(Error::InvalidKey));
        assert_eq!(Key::new("a:b"), Err(Error::InvalidKey));
        assert_eq!(Key::new(":"), Err(Error::InvalidKey));
    }
}
