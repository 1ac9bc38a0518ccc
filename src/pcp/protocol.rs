//! PCP wire format (RFC 6887).

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod opcode_data;
mod request;
mod response;

pub(crate) use opcode_data::{MapData, OpcodeData};
pub(crate) use request::Request;
pub(crate) use response::{Error, Response};

/// Port PCP servers listen on.
///
/// Shared with NAT-PMP; see
/// <https://datatracker.ietf.org/doc/html/rfc6887#section-19>.
pub(crate) const SERVER_PORT: u16 = 5351;

/// Longest lifetime this client will believe, in seconds (RFC 6887
/// section 15). Anything above is clamped.
pub(crate) const MAX_LIFETIME_SECONDS: u32 = 24 * 60 * 60;

/// PCP version, see
/// [RFC 6887 Version Negotiation](https://datatracker.ietf.org/doc/html/rfc6887#section-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Version {
    Pcp = 2,
}

/// Opcode as defined in
/// [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19).
// NOTE: PEER is not used, therefore not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Opcode {
    /// Probe for a PCP server; also used by servers to announce restarts.
    ///
    /// See [RFC 6887 ANNOUNCE Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-14.1).
    Announce = 0,
    /// Create or refresh an endpoint-independent mapping.
    ///
    /// See [RFC 6887 MAP Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-11).
    Map = 1,
}
