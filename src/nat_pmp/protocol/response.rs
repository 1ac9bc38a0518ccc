use std::net::Ipv4Addr;

use num_enum::TryFromPrimitive;

use super::{Opcode, Version};
use crate::Protocol;

/// A decoded NAT-PMP response.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Response {
    PublicAddress {
        epoch_time: u32,
        public_ip: Ipv4Addr,
    },
    PortMap {
        protocol: Protocol,
        epoch_time: u32,
        internal_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

// 3.5.  Result Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub(crate) enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    /// Functionality is supported but not allowed: e.g. the box supports
    /// mapping, but the user has turned the feature off.
    NotAuthorizedOrRefused = 2,
    /// Network failures, e.g. the NAT box itself has not obtained a DHCP
    /// lease.
    NetworkFailure = 3,
    /// The NAT box cannot create any more mappings at this time.
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

/// Errors that can occur when decoding a [`Response`] from a server.
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub(crate) enum Error {
    /// Response is too short or is otherwise malformed.
    #[display("Response is malformed")]
    Malformed,
    /// The [`Response::INDICATOR`] is not present.
    #[display("Packet does not appear to be a response")]
    NotAResponse,
    /// The received opcode is not recognized.
    #[display("Invalid Opcode received")]
    InvalidOpcode,
    /// The received version is not recognized.
    #[display("Invalid version received")]
    InvalidVersion,
    /// The received result code is not recognized.
    #[display("Invalid result code received")]
    InvalidResultCode,
    #[display("gateway error 1: sent version is not supported")]
    UnsupportedVersion,
    #[display("gateway error 2: operation not authorized or refused")]
    NotAuthorizedOrRefused,
    #[display("gateway error 3: spurious network failure")]
    NetworkFailure,
    #[display("gateway error 4: not enough resources for this mapping")]
    OutOfResources,
    #[display("gateway error 5: opcode is not supported")]
    UnsupportedOpcode,
}

impl Response {
    /// Size of an encoded public address response.
    pub const MIN_SIZE: usize = // parts
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        4; // public ip

    /// Size of an encoded mapping response.
    pub const MAX_SIZE: usize = // parts
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // internal port
        2 + // external port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    fn check_header(buf: &[u8]) -> Result<(), Error> {
        if buf.len() < Self::MIN_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(Error::Malformed);
        }
        let _: Version = buf[0].try_into().map_err(|_| Error::InvalidVersion)?;
        if buf[1] & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::NotAResponse);
        }
        Ok(())
    }

    /// The opcode of a response-shaped datagram, used to correlate it to the
    /// request waiting at the head of the queue.
    pub fn peek_opcode(buf: &[u8]) -> Option<Opcode> {
        Self::check_header(buf).ok()?;
        (buf[1] & !Self::INDICATOR).try_into().ok()
    }

    /// The epoch field of a response-shaped datagram. Error responses carry
    /// a valid epoch too.
    pub fn peek_epoch(buf: &[u8]) -> Option<u32> {
        Self::check_header(buf).ok()?;
        let epoch_bytes = buf[4..8].try_into().expect("slice has the right len");
        Some(u32::from_be_bytes(epoch_bytes))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        Self::check_header(buf)?;
        let opcode: Opcode = (buf[1] & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode)?;

        let result_bytes =
            u16::from_be_bytes(buf[2..4].try_into().expect("slice has the right len"));
        let result_code: ResultCode = result_bytes
            .try_into()
            .map_err(|_| Error::InvalidResultCode)?;

        match result_code {
            ResultCode::Success => Ok(()),
            ResultCode::UnsupportedVersion => Err(Error::UnsupportedVersion),
            ResultCode::NotAuthorizedOrRefused => Err(Error::NotAuthorizedOrRefused),
            ResultCode::NetworkFailure => Err(Error::NetworkFailure),
            ResultCode::OutOfResources => Err(Error::OutOfResources),
            ResultCode::UnsupportedOpcode => Err(Error::UnsupportedOpcode),
        }?;

        let epoch_bytes = buf[4..8].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        let response = match opcode {
            Opcode::DetermineExternalAddress => {
                if buf.len() < Self::MIN_SIZE {
                    return Err(Error::Malformed);
                }
                let ip_bytes: [u8; 4] = buf[8..12].try_into().expect("slice has the right len");
                Response::PublicAddress {
                    epoch_time,
                    public_ip: ip_bytes.into(),
                }
            }
            opcode @ (Opcode::MapUdp | Opcode::MapTcp) => {
                if buf.len() < Self::MAX_SIZE {
                    return Err(Error::Malformed);
                }
                let protocol = if opcode == Opcode::MapUdp {
                    Protocol::Udp
                } else {
                    Protocol::Tcp
                };

                let internal_port_bytes =
                    buf[8..10].try_into().expect("slice has the right len");
                let internal_port = u16::from_be_bytes(internal_port_bytes);

                let external_port_bytes =
                    buf[10..12].try_into().expect("slice has the right len");
                let external_port = u16::from_be_bytes(external_port_bytes);

                let lifetime_bytes = buf[12..16].try_into().expect("slice has the right len");
                let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

                Response::PortMap {
                    protocol,
                    epoch_time,
                    internal_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        };

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_public_address_response() {
        let buf = [0u8, 128, 0, 0, 0, 0, 0x27, 0x10, 81, 82, 83, 84];
        assert_eq!(Response::peek_opcode(&buf), Some(Opcode::DetermineExternalAddress));
        assert_eq!(Response::peek_epoch(&buf), Some(10_000));
        assert_eq!(
            Response::decode(&buf),
            Ok(Response::PublicAddress {
                epoch_time: 10_000,
                public_ip: Ipv4Addr::new(81, 82, 83, 84),
            })
        );
    }

    #[test]
    fn test_decode_mapping_response() {
        let mut buf = vec![0u8, 130, 0, 0];
        buf.extend_from_slice(&10_000u32.to_be_bytes());
        buf.extend_from_slice(&5000u16.to_be_bytes());
        buf.extend_from_slice(&6000u16.to_be_bytes());
        buf.extend_from_slice(&7200u32.to_be_bytes());
        assert_eq!(
            Response::decode(&buf),
            Ok(Response::PortMap {
                protocol: Protocol::Tcp,
                epoch_time: 10_000,
                internal_port: 5000,
                external_port: 6000,
                lifetime_seconds: 7200,
            })
        );
    }

    #[test]
    fn test_decode_rejects_malformed_packets() {
        // too short
        assert_eq!(Response::decode(&[0, 128]), Err(Error::Malformed));
        // a request, not a response
        let buf = [0u8, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4];
        assert_eq!(Response::decode(&buf), Err(Error::NotAResponse));
        // unknown version
        let buf = [9u8, 128, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4];
        assert_eq!(Response::decode(&buf), Err(Error::InvalidVersion));
    }

    #[test]
    fn test_error_result_codes_surface() {
        let buf = [0u8, 129, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Response::decode(&buf), Err(Error::NetworkFailure));
        // the epoch is readable even on error responses
        assert_eq!(Response::peek_epoch(&buf), Some(0));
    }
}
