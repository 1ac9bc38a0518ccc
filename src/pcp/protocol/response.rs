use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};

use super::{opcode_data::OpcodeData, Opcode, Version, MAX_LIFETIME_SECONDS};

/// ResultCode in a [`Response`] when it's successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub(crate) enum SuccessCode {
    /// Result code indicating a successful response.
    Success = 0,
}

/// ResultCode in a [`Response`], when said code is an error.
/// [`SuccessCode`] handles the success case.
///
/// Refer to [RFC 6887 Result Codes](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4)
// NOTE: docs for each variant are largely adapted from the RFC's description of each code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Display, thiserror::Error,
)]
#[repr(u8)]
pub(crate) enum ErrorCode {
    /// The version number at the start of the PCP Request header is not
    /// recognized by the PCP server.
    #[display("sent version is not supported")]
    UnsuppVersion = 1,
    /// The requested operation is disabled for this PCP client, or the PCP
    /// client requested an operation that cannot be fulfilled by the PCP
    /// server's security policy.
    #[display("operation not authorized")]
    NotAuthorized = 2,
    /// The request could not be successfully parsed.
    #[display("could not parse the request")]
    MalformedRequest = 3,
    /// Unsupported Opcode.
    #[display("opcode is not supported")]
    UnsuppOpcode = 4,
    /// Unsupported option. This error only occurs if the option is in the
    /// mandatory-to-process range.
    #[display("option is not supported")]
    UnsuppOption = 5,
    /// Malformed option (e.g., appears too many times, invalid length).
    #[display("option could not be parsed")]
    MalformedOption = 6,
    /// The PCP server or the device it controls is experiencing a network
    /// failure of some sort (e.g., has not yet obtained an external IP
    /// address). This is a short lifetime error.
    #[display("spurious network failure")]
    NetworkFailure = 7,
    /// Request is well-formed and valid, but the server has insufficient
    /// resources to complete the requested operation at this time. This is a
    /// short lifetime error.
    #[display("not enough resources for this request")]
    NoResources = 8,
    /// Unsupported transport protocol, e.g., SCTP in a NAT that handles only
    /// UDP and TCP. This is a long lifetime error.
    #[display("unsupported protocol")]
    UnsuppProtocol = 9,
    /// This attempt to create a new mapping would exceed this subscriber's
    /// port quota. This is a short lifetime error.
    #[display("quota exceeded")]
    UserExQuota = 10,
    /// The suggested external port and/or external address cannot be
    /// provided.
    #[display("requested external address cannot be provided")]
    CannotProvideExternal = 11,
    /// The source IP address of the request packet does not match the
    /// contents of the PCP Client's IP Address field.
    #[display("sender and declared ip do not match")]
    AddressMismatch = 12,
    /// The PCP server was not able to create the filters in this request.
    #[display("excessive remote peers in filter option")]
    ExcessiveRemotePeers = 13,
}

/// Result code of a PCP response.
#[derive(Debug)]
pub(crate) enum ResultCode {
    /// A success result code. See [`SuccessCode`].
    Success,
    /// An error code. See [`ErrorCode`].
    Error(ErrorCode),
}

impl TryFrom<u8> for ResultCode {
    type Error = TryFromPrimitiveError<ErrorCode>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<ErrorCode>> {
        if let Ok(SuccessCode::Success) = SuccessCode::try_from(value) {
            Ok(ResultCode::Success)
        } else {
            ErrorCode::try_from(value).map(ResultCode::Error)
        }
    }
}

impl From<ResultCode> for u8 {
    fn from(value: ResultCode) -> Self {
        match value {
            ResultCode::Success => SuccessCode::Success.into(),
            ResultCode::Error(e) => e.into(),
        }
    }
}

/// A PCP successful response/notification.
///
/// See [RFC 6887 Response Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.2)
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Response {
    /// Lifetime in seconds that can be assumed by this response.
    ///
    /// For map requests, this is how long to assume the mapping will last.
    /// Clamped to [`MAX_LIFETIME_SECONDS`].
    pub lifetime_seconds: u32,
    /// Epoch time of the server.
    pub epoch_time: u32,
    /// Data of the response.
    pub data: OpcodeData,
}

/// Errors that can occur when decoding a [`Response`] from a server.
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// Response is too short, too long, or not a multiple of four octets.
    #[display("Response is malformed")]
    Malformed,
    /// The [`Response::RESPONSE_INDICATOR`] is not present.
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
    /// The received opcode data could not be decoded.
    #[display("Invalid opcode data received")]
    InvalidOpcodeData,
}

/// Reasons a well-addressed datagram fails to produce a [`Response`].
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub(crate) enum Error {
    /// The datagram could not be decoded.
    #[display("{_0}")]
    DecodeError(DecodeError),
    /// The server reported an error.
    #[display("gateway error {}: {_0}", u8::from(*_0))]
    ErrorCode(ErrorCode),
}

impl Response {
    /// Max size of a PCP packet as indicated in
    /// [RFC 6887 Common Request and Response Header Format](https://datatracker.ietf.org/doc/html/rfc6887#section-7)
    pub const MAX_SIZE: usize = 1100;

    /// Minimum size of an encoded [`Response`] sent by a server to this
    /// client.
    pub const MIN_SIZE: usize = // parts
        1 + // version
        1 + // opcode ORd with [`Response::RESPONSE_INDICATOR`]
        1 + // reserved
        1 + // result code
        4 + // lifetime
        4 + // epoch time
        12; // reserved

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    fn check_header(buf: &[u8]) -> Result<(), DecodeError> {
        if buf.len() < Self::MIN_SIZE || buf.len() > Self::MAX_SIZE || buf.len() % 4 != 0 {
            return Err(DecodeError::Malformed);
        }
        let _: Version = buf[0].try_into().map_err(|_| DecodeError::InvalidVersion)?;
        if buf[1] & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(DecodeError::NotAResponse);
        }
        Ok(())
    }

    /// The opcode of a response-shaped datagram, used to correlate it to the
    /// request waiting at the head of the queue. `None` for anything that is
    /// not a valid response header.
    pub fn peek_opcode(buf: &[u8]) -> Option<Opcode> {
        Self::check_header(buf).ok()?;
        (buf[1] & !Self::RESPONSE_INDICATOR).try_into().ok()
    }

    /// The epoch field of a response-shaped datagram.
    ///
    /// Error responses carry a valid epoch too, so this is read before the
    /// result code is inspected.
    pub fn peek_epoch(buf: &[u8]) -> Option<u32> {
        Self::check_header(buf).ok()?;
        let epoch_bytes = buf[8..12].try_into().expect("slice has the right len");
        Some(u32::from_be_bytes(epoch_bytes))
    }

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        Self::check_header(buf).map_err(Error::DecodeError)?;

        let opcode: Opcode = (buf[1] & !Self::RESPONSE_INDICATOR)
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidOpcode))?;

        // buf[2] reserved

        // return early if the result code is an error
        let result_code: ResultCode = buf[3]
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidResultCode))?;
        match result_code {
            ResultCode::Success => {}
            ResultCode::Error(error_code) => return Err(Error::ErrorCode(error_code)),
        }

        let lifetime_bytes = buf[4..8].try_into().expect("slice has the right len");
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes).min(MAX_LIFETIME_SECONDS);

        let epoch_bytes = buf[8..12].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        // buf[12..24] reserved

        let data = OpcodeData::decode(opcode, &buf[24..])
            .map_err(|_| Error::DecodeError(DecodeError::InvalidOpcodeData))?;

        Ok(Response {
            lifetime_seconds,
            epoch_time,
            data,
        })
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        let data = OpcodeData::random(opcode, rng);
        Self {
            lifetime_seconds: rng.gen_range(0..MAX_LIFETIME_SECONDS),
            epoch_time: rng.gen(),
            data,
        }
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let Response {
            lifetime_seconds,
            epoch_time,
            data,
        } = self;
        let mut buf = Vec::with_capacity(Self::MIN_SIZE);
        // version
        buf.push(Version::Pcp.into());
        // response indicator and opcode
        let opcode: u8 = data.opcode().into();
        buf.push(Response::RESPONSE_INDICATOR | opcode);
        // reserved
        buf.push(0);
        // result code
        buf.push(ResultCode::Success.into());
        // lifetime
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // epoch
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        // reserved
        for _ in 12..Response::MIN_SIZE {
            buf.push(0)
        }
        data.encode_into(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn test_decode_announce_response() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let response = Response::random(Opcode::Announce, &mut gen);
        let encoded = response.encode();
        assert_eq!(Ok(response), Response::decode(&encoded));
    }

    #[test]
    fn test_decode_known_response_vector() {
        let encoded = [
            2, 129, 0, 0, 0, 0, 28, 32, 0, 2, 155, 237, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 129,
            112, 9, 24, 241, 208, 251, 45, 157, 76, 10, 188, 17, 0, 0, 0, 4, 210, 4, 210, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 255, 255, 135, 180, 175, 246,
        ];
        let response = Response::decode(&encoded).unwrap();
        assert_eq!(&response.encode(), &encoded);
        assert_eq!(Response::peek_opcode(&encoded), Some(Opcode::Map));
        assert_eq!(Response::peek_epoch(&encoded), Some(0x00029bed));
    }

    #[test]
    fn test_lifetime_is_clamped_to_a_day() {
        let mut response = Response {
            lifetime_seconds: 100_000,
            epoch_time: 10,
            data: OpcodeData::Announce,
        };
        let encoded = response.encode();
        response.lifetime_seconds = MAX_LIFETIME_SECONDS;
        assert_eq!(Response::decode(&encoded), Ok(response));
    }

    #[test]
    fn test_rejects_bad_lengths() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let encoded = Response::random(Opcode::Map, &mut gen).encode();

        // too short
        assert!(Response::decode(&encoded[..23]).is_err());
        // not a multiple of four
        let mut odd = encoded.clone();
        odd.extend_from_slice(&[0, 0]);
        assert_eq!(
            Response::decode(&odd),
            Err(Error::DecodeError(DecodeError::Malformed))
        );
        // too long
        let long = vec![0u8; Response::MAX_SIZE + 4];
        assert!(Response::decode(&long).is_err());
    }

    #[test]
    fn test_rejects_requests_and_alien_versions() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let encoded = Response::random(Opcode::Announce, &mut gen).encode();

        let mut request_bit = encoded.clone();
        request_bit[1] &= !Response::RESPONSE_INDICATOR;
        assert_eq!(
            Response::decode(&request_bit),
            Err(Error::DecodeError(DecodeError::NotAResponse))
        );
        assert_eq!(Response::peek_opcode(&request_bit), None);

        let mut bad_version = encoded.clone();
        bad_version[0] = 1;
        assert_eq!(
            Response::decode(&bad_version),
            Err(Error::DecodeError(DecodeError::InvalidVersion))
        );
    }

    #[test]
    fn test_error_codes_surface_with_their_message() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let mut encoded = Response::random(Opcode::Map, &mut gen).encode();
        encoded[3] = 2;
        assert_eq!(
            Response::decode(&encoded),
            Err(Error::ErrorCode(ErrorCode::NotAuthorized))
        );
        assert_eq!(
            ErrorCode::NotAuthorized.to_string(),
            "operation not authorized"
        );
        // the epoch is readable even on error responses
        assert!(Response::peek_epoch(&encoded).is_some());
    }
}
