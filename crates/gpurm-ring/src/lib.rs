#![forbid(unsafe_code)]

//! Circular command rings.
//!
//! A [`Ring`] linearizes the command words submitted to one engine. The producer side
//! ([`Ring::write`]) is single-writer; the consumer side is advisory and only reports
//! progress through [`Ring::set_read_offset`].

mod ring;

pub use ring::{Ring, RingError, Span, MAX_RING_KIB, MIN_RING_KIB};

pub type Result<T, E = RingError> = std::result::Result<T, E>;
