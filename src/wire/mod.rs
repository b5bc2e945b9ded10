/*! Wire representation of protocol segments.

Every datagram exchanged between two sessions is a concatenation of one or
more *segments*: a fixed 24-byte little-endian header followed by zero or
more payload octets. This module provides three levels of access to that
format:

 - [Packet](struct.Packet.html), a read/write wrapper that interprets an
   untrusted byte buffer in place, without copying;
 - [Repr](struct.Repr.html), a high-level representation that can be parsed
   from and emitted into a [Packet](struct.Packet.html);
 - [peek_conv](fn.peek_conv.html), a helper that extracts the conversation
   number from a datagram prefix, for demultiplexing before a session is
   chosen.

Sequence numbers wrap around the 32-bit space; the
[SeqNumber](struct.SeqNumber.html) type encapsulates the signed-difference
comparison that makes ordering well-defined across the wrap.
*/

use core::fmt;

mod segment;

pub use self::segment::{peek_conv, Command, Packet, Repr, SeqNumber, HEADER_LEN};

pub(crate) mod field {
    pub type Field = ::core::ops::Range<usize>;
}

/// The error type for the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A buffer was too short to contain the item it was said to contain.
    Truncated,
    /// A field held a value that no well-formed segment can carry.
    Malformed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated segment"),
            Error::Malformed => write!(f, "malformed segment"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
