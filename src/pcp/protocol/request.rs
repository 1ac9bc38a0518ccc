use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{
    opcode_data::{MapData, OpcodeData},
    Version,
};
use crate::Protocol;

/// A PCP request.
///
/// See [RFC 6887 Request Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.1)
//
// NOTE: PCP options are optional and currently not used, thus not implemented.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Request {
    /// [`Version`] to use in this request.
    version: Version,
    /// Requested lifetime in seconds.
    lifetime_seconds: u32,
    /// IP address of the client.
    ///
    /// An IPv4 address is represented as an IPv4-mapped IPv6 address.
    client_addr: Ipv6Addr,
    /// Data associated to the [`super::Opcode`] in this request.
    opcode_data: OpcodeData,
}

/// Renders an address the way PCP wants it on the wire.
fn wire_addr(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(addr) => addr.to_ipv6_mapped(),
        IpAddr::V6(addr) => addr,
    }
}

impl Request {
    /// Size of the header of a [`Request`], in bytes.
    pub const MIN_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        4 + // lifetime
        16; // client ip

    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        let Request {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
        } = self;
        let mut buf = Vec::with_capacity(Self::MIN_SIZE + opcode_data.encoded_size());
        // buf[0]
        buf.push((*version).into());
        // buf[1]
        buf.push(opcode_data.opcode().into());
        // buf[2] reserved
        buf.push(0);
        // buf[3] reserved
        buf.push(0);
        // buf[4..8]
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // buf[8..24]
        buf.extend_from_slice(&client_addr.octets());
        // buf[24..]
        opcode_data.encode_into(&mut buf);

        buf
    }

    /// Create an announce request.
    pub fn announce(client_addr: IpAddr) -> Request {
        Request {
            version: Version::Pcp,
            // the announce opcode requires a zero lifetime, and the lifetime
            // in the response is ignored
            lifetime_seconds: 0,
            client_addr: wire_addr(client_addr),
            // announce requests and responses have no opcode-specific payload
            opcode_data: OpcodeData::Announce,
        }
    }

    /// Create a mapping request. A `lifetime_seconds` of 0 deletes the
    /// mapping identified by the nonce.
    pub fn mapping(
        nonce: [u8; 12],
        protocol: Protocol,
        internal_port: u16,
        internal_host: IpAddr,
        suggested_external_port: Option<u16>,
        suggested_external_address: Option<IpAddr>,
        lifetime_seconds: u32,
    ) -> Request {
        let unspecified = match internal_host {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Request {
            version: Version::Pcp,
            lifetime_seconds,
            client_addr: wire_addr(internal_host),
            opcode_data: OpcodeData::MapData(MapData {
                nonce,
                protocol: protocol.number(),
                internal_port,
                // a client without a preference must use the default: the
                // internal port and the unspecified address
                external_port: suggested_external_port.unwrap_or(internal_port),
                external_address: wire_addr(suggested_external_address.unwrap_or(unspecified)),
            }),
        }
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: super::Opcode, rng: &mut R) -> Self {
        let opcode_data = OpcodeData::random(opcode, rng);
        let addr_octets: [u8; 16] = rng.gen();
        Request {
            version: Version::Pcp,
            lifetime_seconds: rng.gen(),
            client_addr: Ipv6Addr::from(addr_octets),
            opcode_data,
        }
    }

    #[cfg(test)]
    #[track_caller]
    fn decode(buf: &[u8]) -> Self {
        let version: Version = buf[0].try_into().unwrap();
        let opcode: super::Opcode = buf[1].try_into().unwrap();
        // buf[2] reserved
        // buf[3] reserved
        let lifetime_bytes: [u8; 4] = buf[4..8].try_into().unwrap();
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

        let client_addr_bytes: [u8; 16] = buf[8..24].try_into().unwrap();
        let client_addr: Ipv6Addr = client_addr_bytes.into();

        let opcode_data = OpcodeData::decode(opcode, &buf[24..]).unwrap();
        Self {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
        }
    }
}
