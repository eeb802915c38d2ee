//! NBD fixed-newstyle wire protocol: pure encode/decode functions over byte
//! buffers (§4.1). All multi-byte integers are big-endian.
//!
//! Based on the NBD protocol specification:
//! <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use std::io::Cursor;
use thiserror::Error;

pub const NBD_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454f5054; // "IHAVEOPT"
pub const NBD_OPT_REPLY_MAGIC: u64 = 0x3e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// Server handshake flags: fixed newstyle only.
pub const HANDSHAKE_FLAGS: u16 = 1 << 0;
pub const CLIENT_FLAG_FIXED_NEWSTYLE: u32 = 1 << 0;

pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_GO: u32 = 7;

pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_ERR_UNSUP: u32 = (1 << 31) | 1;
pub const NBD_REP_ERR_UNKNOWN: u32 = (1 << 31) | 6;
pub const NBD_REP_ERR_POLICY: u32 = (1 << 31) | 7;

pub const NBD_INFO_EXPORT: u16 = 0;

pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;

/// Transmission flags advertised by this server: HAS_FLAGS | SEND_FLUSH.
/// FUA is deliberately left unadvertised (see spec.md §9 Open Question).
pub const TRANSMISSION_FLAGS: u16 = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;

pub const EINVAL: u32 = libc::EINVAL as u32;
pub const EIO: u32 = libc::EIO as u32;

const MAX_OPTION_LEN: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic: expected 0x{expected:x}, got 0x{got:x}")]
    BadMagic { expected: u64, got: u64 },

    #[error("short frame: {0}")]
    ShortFrame(String),

    #[error("option length {0} exceeds 64 KiB limit")]
    OptionTooLarge(u32),

    #[error("export name is not valid UTF-8")]
    InvalidUtf8,

    #[error("client did not advertise FIXED_NEWSTYLE support")]
    NotFixedNewstyle,
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::ShortFrame(e.to_string())
    }
}

/// NBD command types consumed by the transmission phase (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Read,
    Write,
    Disc,
    Flush,
}

impl CommandType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(CommandType::Read),
            1 => Some(CommandType::Write),
            2 => Some(CommandType::Disc),
            3 => Some(CommandType::Flush),
            _ => None,
        }
    }
}

/// A decoded 28-byte command header.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub flags: u16,
    pub raw_type: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl CommandHeader {
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u16(self.raw_type)
    }
}

/// Length of the wire representation of [`CommandHeader`].
pub const COMMAND_HEADER_LEN: usize = 28;

/// Length of the wire representation of a simple reply.
pub const SIMPLE_REPLY_LEN: usize = 16;

/// Encode the handshake preface: NBDMAGIC, IHAVEOPT, handshake flags.
pub fn encode_handshake_preface() -> Vec<u8> {
    let mut buf = Vec::with_capacity(18);
    buf.write_u64::<BE>(NBD_MAGIC).unwrap();
    buf.write_u64::<BE>(NBD_OPTS_MAGIC).unwrap();
    buf.write_u16::<BE>(HANDSHAKE_FLAGS).unwrap();
    buf
}

/// Decode the 4-byte client flags field. Rejects a client that does not
/// advertise `FIXED_NEWSTYLE` support (§4.5 Option transition).
pub fn decode_client_flags(buf: &[u8; 4]) -> Result<u32, ProtocolError> {
    let flags = u32::from_be_bytes(*buf);
    if flags & CLIENT_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(ProtocolError::NotFixedNewstyle);
    }
    Ok(flags)
}

/// A decoded option header: `{magic, option, length}`.
pub struct OptionHeader {
    pub option: u32,
    pub length: u32,
}

/// Decode a 16-byte option header (8-byte magic + 4-byte option + 4-byte
/// length).
pub fn decode_option_header(buf: &[u8; 16]) -> Result<OptionHeader, ProtocolError> {
    let mut cursor = Cursor::new(&buf[..]);
    let magic = cursor.read_u64::<BE>()?;
    if magic != NBD_OPTS_MAGIC {
        return Err(ProtocolError::BadMagic {
            expected: NBD_OPTS_MAGIC,
            got: magic,
        });
    }
    let option = cursor.read_u32::<BE>()?;
    let length = cursor.read_u32::<BE>()?;
    if length > MAX_OPTION_LEN {
        return Err(ProtocolError::OptionTooLarge(length));
    }
    Ok(OptionHeader { option, length })
}

/// Decode the `NBD_OPT_GO` option payload, returning just the export name.
/// Per §4.1, only the name is required; information requests are
/// acknowledged implicitly and their bytes are simply skipped.
pub fn decode_go_export_name(data: &[u8]) -> Result<String, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::ShortFrame(
            "NBD_OPT_GO payload missing name length".to_string(),
        ));
    }
    let name_len = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
    let name_end = 4 + name_len;
    if data.len() < name_end {
        return Err(ProtocolError::ShortFrame(
            "NBD_OPT_GO payload truncated export name".to_string(),
        ));
    }
    String::from_utf8(data[4..name_end].to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Encode an option reply header followed by `payload`.
pub fn encode_option_reply(option: u32, reply_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + payload.len());
    buf.write_u64::<BE>(NBD_OPT_REPLY_MAGIC).unwrap();
    buf.write_u32::<BE>(option).unwrap();
    buf.write_u32::<BE>(reply_type).unwrap();
    buf.write_u32::<BE>(payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// Encode the `NBD_INFO_EXPORT` payload: `{u16 type=0, u64 size, u16 flags}`.
pub fn encode_info_export_payload(export_size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.write_u16::<BE>(NBD_INFO_EXPORT).unwrap();
    buf.write_u64::<BE>(export_size).unwrap();
    buf.write_u16::<BE>(TRANSMISSION_FLAGS).unwrap();
    buf
}

/// Decode a 28-byte command header.
pub fn decode_command_header(buf: &[u8; COMMAND_HEADER_LEN]) -> Result<CommandHeader, ProtocolError> {
    let mut cursor = Cursor::new(&buf[..]);
    let magic = cursor.read_u32::<BE>()?;
    if magic != NBD_REQUEST_MAGIC {
        return Err(ProtocolError::BadMagic {
            expected: NBD_REQUEST_MAGIC as u64,
            got: magic as u64,
        });
    }
    let flags = cursor.read_u16::<BE>()?;
    let raw_type = cursor.read_u16::<BE>()?;
    let handle = cursor.read_u64::<BE>()?;
    let offset = cursor.read_u64::<BE>()?;
    let length = cursor.read_u32::<BE>()?;
    Ok(CommandHeader {
        flags,
        raw_type,
        handle,
        offset,
        length,
    })
}

/// Encode a 16-byte simple reply: `{magic, error, handle}`.
pub fn encode_simple_reply(handle: u64, error: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SIMPLE_REPLY_LEN);
    buf.write_u32::<BE>(NBD_SIMPLE_REPLY_MAGIC).unwrap();
    buf.write_u32::<BE>(error).unwrap();
    buf.write_u64::<BE>(handle).unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_preface_has_expected_magics() {
        let buf = encode_handshake_preface();
        assert_eq!(buf.len(), 18);
        assert_eq!(u64::from_be_bytes(buf[0..8].try_into().unwrap()), NBD_MAGIC);
        assert_eq!(
            u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            NBD_OPTS_MAGIC
        );
        assert_eq!(u16::from_be_bytes(buf[16..18].try_into().unwrap()), HANDSHAKE_FLAGS);
    }

    #[test]
    fn client_flags_require_fixed_newstyle() {
        let bad = 0u32.to_be_bytes();
        assert!(matches!(
            decode_client_flags(&bad),
            Err(ProtocolError::NotFixedNewstyle)
        ));
        let good = CLIENT_FLAG_FIXED_NEWSTYLE.to_be_bytes();
        assert_eq!(decode_client_flags(&good).unwrap(), CLIENT_FLAG_FIXED_NEWSTYLE);
    }

    #[test]
    fn option_header_rejects_bad_magic() {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&0u64.to_be_bytes());
        assert!(matches!(
            decode_option_header(&buf),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn option_header_rejects_oversized_length() {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&NBD_OPT_GO.to_be_bytes());
        buf[12..16].copy_from_slice(&(MAX_OPTION_LEN + 1).to_be_bytes());
        assert!(matches!(
            decode_option_header(&buf),
            Err(ProtocolError::OptionTooLarge(_))
        ));
    }

    #[test]
    fn go_export_name_round_trips() {
        let name = "alpha";
        let mut data = Vec::new();
        data.extend_from_slice(&(name.len() as u32).to_be_bytes());
        data.extend_from_slice(name.as_bytes());
        data.extend_from_slice(&0u16.to_be_bytes()); // n_info = 0
        assert_eq!(decode_go_export_name(&data).unwrap(), name);
    }

    #[test]
    fn go_export_name_rejects_invalid_utf8() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            decode_go_export_name(&data),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn command_header_round_trips_read() {
        let mut buf = [0u8; COMMAND_HEADER_LEN];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[6..8].copy_from_slice(&0u16.to_be_bytes()); // READ
        buf[8..16].copy_from_slice(&42u64.to_be_bytes()); // handle
        buf[16..24].copy_from_slice(&1024u64.to_be_bytes()); // offset
        buf[24..28].copy_from_slice(&512u32.to_be_bytes()); // length
        let hdr = decode_command_header(&buf).unwrap();
        assert_eq!(hdr.command_type(), Some(CommandType::Read));
        assert_eq!(hdr.handle, 42);
        assert_eq!(hdr.offset, 1024);
        assert_eq!(hdr.length, 512);
    }

    #[test]
    fn unknown_command_type_is_none() {
        let mut buf = [0u8; COMMAND_HEADER_LEN];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[6..8].copy_from_slice(&99u16.to_be_bytes());
        let hdr = decode_command_header(&buf).unwrap();
        assert_eq!(hdr.command_type(), None);
    }

    #[test]
    fn simple_reply_encodes_sixteen_bytes() {
        let buf = encode_simple_reply(7, EINVAL);
        assert_eq!(buf.len(), SIMPLE_REPLY_LEN);
        assert_eq!(u32::from_be_bytes(buf[0..4].try_into().unwrap()), NBD_SIMPLE_REPLY_MAGIC);
        assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), EINVAL);
        assert_eq!(u64::from_be_bytes(buf[8..16].try_into().unwrap()), 7);
    }
}
