//! 160-bit node id, storage key, or lookup target.

use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use sha1_smol::Sha1;

/// The size of ids in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// 160-bit node id, storage key, or lookup target.
///
/// Distance between two ids is their bitwise XOR interpreted as a
/// big-endian unsigned integer; a smaller XOR means "closer".
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The zero id, lower bound of the id space.
    pub const ZERO: Id = Id([0; ID_SIZE]);
    /// The all-ones id, upper bound of the id space.
    pub const MAX: Id = Id([0xff; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns None if `bytes` is not of
    /// length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Option<Id> {
        let bytes = bytes.as_ref();

        bytes.try_into().ok().map(Id)
    }

    /// The SHA-1 digest of `bytes` as an Id.
    ///
    /// Used both for deriving a node id from its public key and for
    /// addressing values by their content.
    pub fn hash_of(bytes: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(bytes);

        Id(hasher.digest().bytes())
    }

    /// Bitwise XOR with another id. Comparing two `xor` results against a
    /// common target compares distances to that target.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The midpoint of the inclusive range `[low, high]`, rounded down.
    ///
    /// Computed as `(low + high) / 2` over the full 160-bit width, carrying
    /// through a 161st bit so the sum cannot overflow.
    pub(crate) fn midpoint(low: &Id, high: &Id) -> Id {
        let mut sum = [0u8; ID_SIZE + 1];
        let mut carry = 0u16;

        for i in (0..ID_SIZE).rev() {
            let total = low.0[i] as u16 + high.0[i] as u16 + carry;
            sum[i + 1] = total as u8;
            carry = total >> 8;
        }
        sum[0] = carry as u8;

        // Shift the 161-bit sum right by one.
        let mut result = [0u8; ID_SIZE];
        for i in 0..ID_SIZE {
            result[i] = (sum[i] << 7) | (sum[i + 1] >> 1);
        }

        Id(result)
    }

    /// The next id after this one. Saturates at [Id::MAX].
    pub(crate) fn successor(&self) -> Id {
        let mut result = self.0;

        for byte in result.iter_mut().rev() {
            let (incremented, overflowed) = byte.overflowing_add(1);
            *byte = incremented;

            if !overflowed {
                return Id(result);
            }
        }

        Id::MAX
    }

    /// An id with the value of `n` in its low 64 bits. Handy for addressing
    /// deterministic points of the id space in tests and demos.
    pub fn from_u64(n: u64) -> Id {
        let mut bytes = [0u8; ID_SIZE];
        bytes[ID_SIZE - 8..].copy_from_slice(&n.to_be_bytes());

        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if s.len() % 2 != 0 {
            return Err(DecodeIdError::OddLength);
        }
        if s.len() != ID_SIZE * 2 {
            return Err(DecodeIdError::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = Vec::with_capacity(ID_SIZE);
        for i in 0..ID_SIZE {
            let byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DecodeIdError::InvalidHexCharacter)?;
            bytes.push(byte);
        }

        Id::from_bytes(&bytes).ok_or(DecodeIdError::InvalidIdSize(bytes.len()))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors from decoding an [Id] from a hex string.
pub enum DecodeIdError {
    #[error("hex string has an odd length")]
    OddLength,

    #[error("expected 20 bytes, got {0}")]
    InvalidIdSize(usize),

    #[error("invalid hex character")]
    InvalidHexCharacter,
}
