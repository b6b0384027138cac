#![cfg_attr(not(feature = "std"), no_std)]

//! Codec for the DECnet Phase II/III/IV routing-layer and MOP wire
//! formats.
//!
//! Every frame class exposes `decode` over a byte slice and `encode`
//! into a caller-provided buffer; nothing here allocates.  Payloads
//! and image fields borrow from the input buffer.

use core::fmt::{self, Display};

pub mod addr;
pub mod bytes;
pub mod mop;
pub mod route;

pub use addr::{EthAddr, NodeAddr, NodeType, Version, HIORD};

/// Decode/encode failures, in the taxonomy the routing layer counts
/// and logs by.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Error {
    /// The buffer ended before the field did.
    MissingData,
    /// A semantic constraint was violated (bad length, bad address,
    /// invalid segment bounds).
    FormatError,
    /// An unexpected tag or code point where wildcards are not allowed.
    InvalidTag,
    /// A constant wire field did not hold its required value.
    WrongValue,
    /// Trailing bytes where none are expected.
    ExtraData,
    /// Routing update residue was neither 0 nor -1.
    ChecksumError,
    /// The output buffer is too small for the encoded frame.
    BufferOverflow,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingData => write!(f, "Missing data"),
            Self::FormatError => write!(f, "Format error"),
            Self::InvalidTag => write!(f, "Invalid tag"),
            Self::WrongValue => write!(f, "Wrong value"),
            Self::ExtraData => write!(f, "Extra data"),
            Self::ChecksumError => write!(f, "Checksum error"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
