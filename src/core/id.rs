//! Protocol identifier types.

use std::fmt;

#[cfg(feature = "codec")]
use bincode::{Decode, Encode};
use sha2::{Digest, Sha256};

/// A 256-bit identifier that implements a non-euclidian XOR-based distance metric.
///
/// The bytes are interpreted as a big-endian unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Id {
    bytes: [u8; Self::BYTES],
}

/// Identifies a peer.
pub type NodeId = Id;

/// Identifies a piece of content, derived from its content key.
pub type ContentId = Id;

impl Id {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 32;

    /// The size of the identifier in bits.
    pub const BITS: usize = 32 * 8;

    /// Creates a new identifier from the supplied bytes.
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        Id { bytes }
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    /// Derives the content identifier for a content key (`sha256(key)`).
    pub fn from_content_key(content_key: &[u8]) -> Self {
        let digest = Sha256::digest(content_key);
        let mut bytes = [0u8; Self::BYTES];
        bytes.copy_from_slice(&digest);

        Self { bytes }
    }

    #[doc(hidden)]
    /// Convenience function for working with small identifiers during testing.
    pub fn from_u16(raw: u16) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - 2..].copy_from_slice(&raw.to_be_bytes());

        Self { bytes }
    }

    #[doc(hidden)]
    /// Convenience function for generating random identifiers during testing.
    pub fn rand() -> Self {
        use rand::{thread_rng, Fill};

        let mut rng = thread_rng();
        let mut bytes = [0u8; Self::BYTES];
        let _res = bytes.try_fill(&mut rng);
        debug_assert!(_res.is_ok());

        Self { bytes }
    }

    /// Returns the XOR distance between two identifiers.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ other.bytes[i];
        }

        Distance(bytes)
    }

    /// Computes the log2 of the XOR-based distance between two identifiers, `0` if they are
    /// identical and `1..=256` otherwise.
    pub fn log2_distance(&self, other: &Id) -> u32 {
        // Bytes are BE, the first non-zero byte of the XOR holds the most-significant bit. Its
        // position counts down from the top of the 256-bit range.
        //
        // [0, 0, 1, 2] <- XOR bytes
        //  0  1  2  3  <- i
        //
        // Here the most-significant byte is at index 2, i.e. there are (4 - 2 - 1) full bytes
        // below it, each worth 8 bits, plus the bit position within the byte itself (1-indexed).
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(&a, &b)| a ^ b)
            .enumerate()
            .find(|(_, byte)| byte != &0b0)
            .map(|(i, byte)| Self::msb(byte) + 1 + (((Self::BYTES - i - 1) as u32) << 3))
            .unwrap_or(0)
    }

    // Returns the position of the most-significant bit set in a byte (0-indexed).
    fn msb(n: u8) -> u32 {
        debug_assert_ne!(n, 0);
        // Safety: can't be 0 - 1.
        u8::BITS - n.leading_zeros() - 1
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl fmt::Display for Id {
    // Short form, enough to tell peers apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.bytes[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")?;
        for byte in &self.bytes[Self::BYTES - 2..] {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

/// The XOR distance between two identifiers, ordered as a 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Distance([u8; Id::BYTES]);

impl Distance {
    /// The largest possible distance.
    pub const MAX: Distance = Distance([u8::MAX; Id::BYTES]);

    /// Creates a distance from its big-endian bytes.
    pub fn new(bytes: [u8; Id::BYTES]) -> Self {
        Distance(bytes)
    }

    /// Returns the big-endian bytes backing the distance.
    pub fn bytes(&self) -> [u8; Id::BYTES] {
        self.0
    }
}
