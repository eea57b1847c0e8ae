//! CoAP Framing
//!
//! Wire encoding is `coap-lite`. This module adds the oneM2M binding options,
//! the response codes the client reacts to, and the packet helpers the
//! transport needs.

use bytes::Bytes;
use thiserror::Error;

pub use coap_lite::{CoapOption, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType};

/// Protocol version carried in every header
pub const VERSION: u8 = 1;

/// Decode and encode failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsupported version: {0}")]
    Version(u8),
}

pub const CREATED: MessageClass = MessageClass::Response(ResponseType::Created);
pub const CHANGED: MessageClass = MessageClass::Response(ResponseType::Changed);
pub const CONTENT: MessageClass = MessageClass::Response(ResponseType::Content);
pub const BAD_REQUEST: MessageClass = MessageClass::Response(ResponseType::BadRequest);
/// oneM2M answers a duplicate creation with 4.03
pub const FORBIDDEN: MessageClass = MessageClass::Response(ResponseType::Forbidden);
pub const NOT_FOUND: MessageClass = MessageClass::Response(ResponseType::NotFound);
pub const INTERNAL_SERVER_ERROR: MessageClass = MessageClass::Response(ResponseType::InternalServerError);

/// oneM2M CoAP binding options (TS-0008)
pub mod option {
    use coap_lite::CoapOption;

    /// Originator (`X-M2M-Origin`)
    pub const ONEM2M_FR: CoapOption = CoapOption::Unknown(256);
    /// Request identifier (`X-M2M-RI`)
    pub const ONEM2M_RQI: CoapOption = CoapOption::Unknown(257);
    /// Resource type (`ty`)
    pub const ONEM2M_TY: CoapOption = CoapOption::Unknown(267);
}

/// Code class, the `2` in `2.01`
pub fn class(code: MessageClass) -> u8 {
    u8::from(code) >> 5
}

/// `class.detail` rendering
pub fn code_string(code: MessageClass) -> String {
    let raw = u8::from(code);
    format!("{}.{:02}", raw >> 5, raw & 0x1f)
}

pub fn is_request(code: MessageClass) -> bool {
    matches!(code, MessageClass::Request(_))
}

pub fn is_response(code: MessageClass) -> bool {
    matches!(code, MessageClass::Response(_))
}

/// Bare packet with header fields set
pub fn packet(mtype: MessageType, code: MessageClass, message_id: u16) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_version(VERSION);
    packet.header.set_type(mtype);
    packet.header.code = code;
    packet.header.message_id = message_id;
    packet
}

/// Empty acknowledgement of a confirmable message
pub fn empty_ack(message_id: u16) -> Packet {
    packet(MessageType::Acknowledgement, MessageClass::Empty, message_id)
}

/// Reset, used to answer pings
pub fn reset(message_id: u16) -> Packet {
    packet(MessageType::Reset, MessageClass::Empty, message_id)
}

/// Response piggybacked on the acknowledgement of `message_id`
pub fn piggybacked(code: MessageClass, message_id: u16, token: &[u8]) -> Packet {
    let mut ack = packet(MessageType::Acknowledgement, code, message_id);
    ack.set_token(token.to_vec());
    ack
}

/// Replace the Uri-Path options with the segments of `path`
pub fn set_uri_path(packet: &mut Packet, path: &str) {
    packet.clear_option(CoapOption::UriPath);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
}

/// Reassembled Uri-Path, always rooted at `/`
pub fn uri_path(packet: &Packet) -> String {
    let mut path = String::new();
    if let Some(segments) = packet.get_option(CoapOption::UriPath) {
        for segment in segments.iter() {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Add an unsigned integer option in its shortest big-endian form
pub fn add_uint_option(packet: &mut Packet, option: CoapOption, value: u32) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    packet.add_option(option, bytes[skip..].to_vec());
}

/// First value of an unsigned integer option
pub fn uint_option(packet: &Packet, option: CoapOption) -> Option<u32> {
    let value = packet.get_option(option)?.iter().next()?;
    Some(value.iter().take(4).fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// First value of an option as raw bytes
pub fn option_bytes(packet: &Packet, option: CoapOption) -> Option<Bytes> {
    packet
        .get_option(option)?
        .iter()
        .next()
        .map(|v| Bytes::copy_from_slice(v))
}

pub fn encode(packet: &Packet) -> Result<Bytes, CodecError> {
    packet
        .to_bytes()
        .map(Bytes::from)
        .map_err(|e| CodecError::Malformed(format!("{:?}", e)))
}

pub fn decode(buf: &[u8]) -> Result<Packet, CodecError> {
    let packet = Packet::from_bytes(buf).map_err(|e| CodecError::Malformed(format!("{:?}", e)))?;
    let version = packet.header.get_version();
    if version != VERSION {
        return Err(CodecError::Version(version));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: &Packet) -> Packet {
        decode(&encode(packet).unwrap()).unwrap()
    }

    #[test]
    fn test_code_rendering() {
        assert_eq!(class(CREATED), 2);
        assert_eq!(code_string(CREATED), "2.01");
        assert_eq!(code_string(FORBIDDEN), "4.03");
        assert_eq!(code_string(INTERNAL_SERVER_ERROR), "5.00");
        assert!(is_request(MessageClass::Request(RequestType::Post)));
        assert!(!is_request(MessageClass::Empty));
        assert!(is_response(NOT_FOUND));
    }

    #[test]
    fn test_header_fields_survive_the_wire() {
        let mut msg = packet(MessageType::Confirmable, MessageClass::Request(RequestType::Post), 0x1234);
        msg.set_token(vec![0xAA, 0xBB]);

        let wire = encode(&msg).unwrap();
        assert_eq!(&wire[..], &[0x42, 0x02, 0x12, 0x34, 0xAA, 0xBB]);

        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded.header.get_type(), MessageType::Confirmable);
        assert_eq!(decoded.header.message_id, 0x1234);
        assert_eq!(decoded.get_token(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_onem2m_options_survive_the_wire() {
        let mut msg = packet(MessageType::Confirmable, MessageClass::Request(RequestType::Post), 7);
        set_uri_path(&mut msg, "/~/in-cse/in-name");
        msg.set_content_format(ContentFormat::ApplicationJSON);
        msg.add_option(option::ONEM2M_FR, b"admin:admin".to_vec());
        add_uint_option(&mut msg, option::ONEM2M_TY, 2);
        msg.payload = br#"{"m2m:ae":{}}"#.to_vec();

        let decoded = roundtrip(&msg);

        assert_eq!(uri_path(&decoded), "/~/in-cse/in-name");
        assert_eq!(uint_option(&decoded, option::ONEM2M_TY), Some(2));
        assert_eq!(uint_option(&decoded, CoapOption::ContentFormat), Some(50));
        assert_eq!(option_bytes(&decoded, option::ONEM2M_FR).as_deref(), Some(&b"admin:admin"[..]));
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_set_uri_path_replaces_previous() {
        let mut msg = packet(MessageType::Confirmable, MessageClass::Request(RequestType::Get), 1);
        set_uri_path(&mut msg, "/a/b");
        set_uri_path(&mut msg, "/c");

        assert_eq!(uri_path(&msg), "/c");
        assert_eq!(uri_path(&packet(MessageType::Reset, MessageClass::Empty, 1)), "/");
    }

    #[test]
    fn test_zero_uint_option_is_empty() {
        let mut msg = packet(MessageType::Confirmable, MessageClass::Request(RequestType::Get), 1);
        add_uint_option(&mut msg, option::ONEM2M_TY, 0);
        add_uint_option(&mut msg, CoapOption::UriPort, 5683);

        assert_eq!(option_bytes(&msg, option::ONEM2M_TY).map(|v| v.len()), Some(0));
        assert_eq!(uint_option(&msg, option::ONEM2M_TY), Some(0));
        assert_eq!(option_bytes(&msg, CoapOption::UriPort).map(|v| v.len()), Some(2));
        assert_eq!(uint_option(&msg, CoapOption::UriPort), Some(5683));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode(&[0x40, 0x01]), Err(CodecError::Malformed(_))));
        assert!(decode(&[0x80, 0x01, 0, 1]).is_err());
        assert!(decode(&[0x42, 0x01, 0, 1, 0xAA]).is_err());
    }

    #[test]
    fn test_piggybacked_ack_mirrors_request() {
        let ack = roundtrip(&piggybacked(CHANGED, 99, &[1, 2, 3]));

        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.code, CHANGED);
        assert_eq!(ack.header.message_id, 99);
        assert_eq!(ack.get_token(), &[1, 2, 3]);
    }

    #[test]
    fn test_empty_messages() {
        let ack = roundtrip(&empty_ack(5));
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.code, MessageClass::Empty);

        let rst = roundtrip(&reset(6));
        assert_eq!(rst.header.get_type(), MessageType::Reset);
        assert_eq!(rst.header.message_id, 6);
    }
}
