use super::{Opcode, Version};
use crate::Protocol;

/// A NAT-PMP request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Request {
    /// Ask the gateway for its public address.
    ExternalAddress,
    /// Create, refresh or (with a zero lifetime and external port) delete a
    /// mapping.
    Mapping {
        protocol: Protocol,
        internal_port: u16,
        /// Requested external port, 0 for "any".
        external_port: u16,
        /// Requested lifetime in seconds, 0 deletes the mapping.
        lifetime_seconds: u32,
    },
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
            Request::Mapping {
                protocol,
                internal_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = Vec::with_capacity(12);
                buf.push(Version::NatPmp.into());
                buf.push(Opcode::from(*protocol).into());
                // reserved
                buf.push(0);
                buf.push(0);
                buf.extend_from_slice(&internal_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }

    /// The opcode a response to this request will answer for.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::ExternalAddress => Opcode::DetermineExternalAddress,
            Request::Mapping { protocol, .. } => (*protocol).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_address_request_bytes() {
        assert_eq!(Request::ExternalAddress.encode(), vec![0, 0]);
    }

    #[test]
    fn test_mapping_request_bytes() {
        let request = Request::Mapping {
            protocol: Protocol::Tcp,
            internal_port: 5000,
            external_port: 6000,
            lifetime_seconds: 7200,
        };
        let encoded = request.encode();
        assert_eq!(encoded.len(), 12);
        assert_eq!(
            encoded,
            vec![0x00, 0x02, 0x00, 0x00, 0x13, 0x88, 0x17, 0x70, 0x00, 0x00, 0x1c, 0x20]
        );
        assert_eq!(request.opcode(), Opcode::MapTcp);

        let udp = Request::Mapping {
            protocol: Protocol::Udp,
            internal_port: 5000,
            external_port: 0,
            lifetime_seconds: 0,
        };
        assert_eq!(udp.encode()[1], 0x01);
        assert_eq!(udp.opcode(), Opcode::MapUdp);
    }
}
