//! SAL header and extension chain coding
//!
//! A SAL packet starts with a fixed base header followed by up to
//! [`MAX_EXTENSIONS`] extensions, each a `{type, length, payload}` triple.
//! The 16-bit Internet checksum in the base header covers the base header and
//! every extension, but not the transport payload that follows. Parsing is
//! all-or-nothing: an unknown extension type, a length outside the bounds for
//! its type, a chain that over- or underruns the declared header length, or a
//! checksum mismatch rejects the whole packet.

use std::{fmt, io, net::Ipv4Addr};

use bytes::{BufMut, Bytes};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::{checksum, FlowId, Nonce, Protocol, ServiceId, NONCE_SIZE, SERVICE_ID_SIZE};

/// Size of the SAL base header in bytes
pub(crate) const BASE_HEADER_SIZE: usize = 14;
/// Hard cap on the number of extensions in one packet
pub(crate) const MAX_EXTENSIONS: usize = 5;

pub(crate) const CONTROL_EXT_SIZE: usize = 4 + 4 + 4 + NONCE_SIZE;
pub(crate) const CONNECTION_EXT_SIZE: usize = CONTROL_EXT_SIZE + SERVICE_ID_SIZE;
pub(crate) const SERVICE_EXT_SIZE: usize = CONTROL_EXT_SIZE + SERVICE_ID_SIZE;
pub(crate) const ADDRESS_EXT_SIZE: usize = 4 + 4 + 4;
pub(crate) const SOURCE_EXT_MIN_ADDRS: usize = 2;
pub(crate) const SOURCE_EXT_MAX_ADDRS: usize = 16;

const CONTROL_EXT: u8 = 1;
const CONNECTION_EXT: u8 = 2;
const SERVICE_EXT: u8 = 3;
const ADDRESS_EXT: u8 = 4;
const SOURCE_EXT: u8 = 5;

fn ext_name(ty: u8) -> &'static str {
    match ty {
        CONTROL_EXT => "CONTROL",
        CONNECTION_EXT => "CONNECTION",
        SERVICE_EXT => "SERVICE",
        ADDRESS_EXT => "ADDRESS",
        SOURCE_EXT => "SOURCE",
        _ => "UNKNOWN",
    }
}

/// Inclusive length bounds for an extension type, or `None` if unknown
fn ext_length_bounds(ty: u8) -> Option<(usize, usize)> {
    Some(match ty {
        CONTROL_EXT => (2 + CONTROL_EXT_SIZE, 2 + CONTROL_EXT_SIZE),
        CONNECTION_EXT => (2 + CONNECTION_EXT_SIZE, 2 + CONNECTION_EXT_SIZE),
        SERVICE_EXT => (2 + SERVICE_EXT_SIZE, 2 + SERVICE_EXT_SIZE),
        ADDRESS_EXT => (2 + ADDRESS_EXT_SIZE, 2 + ADDRESS_EXT_SIZE),
        SOURCE_EXT => (
            2 + 4 * SOURCE_EXT_MIN_ADDRS,
            2 + 4 * SOURCE_EXT_MAX_ADDRS,
        ),
        _ => return None,
    })
}

/// Control bits carried in a control-bearing extension
#[derive(Default, Copy, Clone, Eq, PartialEq)]
pub struct ControlFlags(pub u8);

impl ControlFlags {
    /// Connection request
    pub const SYN: Self = Self(0x01);
    /// Migration request
    pub const RSYN: Self = Self(0x02);
    /// Acknowledgement of control information
    pub const ACK: Self = Self(0x04);
    /// Negative acknowledgement
    pub const NACK: Self = Self(0x08);
    /// Abortive reset
    pub const RST: Self = Self(0x10);
    /// Orderly close
    pub const FIN: Self = Self(0x20);

    /// Whether every bit of `flag` is set in `self`
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Whether no bits are set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ControlFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ControlFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.pad("-");
        }
        let mut first = true;
        for (bit, name) in [
            (Self::SYN, "SYN"),
            (Self::RSYN, "RSYN"),
            (Self::ACK, "ACK"),
            (Self::NACK, "NACK"),
            (Self::RST, "RST"),
            (Self::FIN, "FIN"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which control-bearing extension family a packet carries
///
/// The families are mutually exclusive on the wire: a packet attaches exactly
/// one of a Connection extension (SYN and the handshake ACK), a plain Control
/// extension (RSYN/FIN/RST/ACK), or one or two Service extensions
/// (unconnected datagrams).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum CtrlExtKind {
    /// No control-bearing extension (pure data on an established flow)
    None,
    Control,
    Connection,
    Service,
}

/// Parsed view of one received packet's header and extensions
///
/// Transient: built per packet and discarded once the packet has been
/// processed.
#[derive(Debug, Clone, PartialEq)]
pub struct SalContext {
    /// Sender's flow identifier
    pub src_flowid: FlowId,
    /// Receiver's flow identifier
    pub dst_flowid: FlowId,
    /// Transport protocol of the payload
    pub protocol: Protocol,
    /// Total length of the base header plus all extensions
    pub length: u16,
    /// Union of the control bits seen in control-bearing extensions
    pub flags: ControlFlags,
    /// Version (sequence) number of control information
    pub verno: u32,
    /// Acknowledgement number of control information
    pub ackno: u32,
    /// Peer nonce from the control-bearing extension
    pub nonce: Option<Nonce>,
    pub(crate) ext_kind: CtrlExtKind,
    /// Service identifier from a Connection extension
    pub conn_srvid: Option<ServiceId>,
    /// Source service identifier (first Service extension)
    pub srv_src: Option<ServiceId>,
    /// Destination service identifier (second Service extension)
    pub srv_dst: Option<ServiceId>,
    /// Old/new address pair from an Address extension
    pub addr_ext: Option<(Ipv4Addr, Ipv4Addr)>,
    /// Forwarding path recorded by intermediate hops, oldest first
    pub source: Vec<Ipv4Addr>,
    /// Transport payload following the SAL header
    pub payload: Bytes,
}

impl SalContext {
    /// Whether this packet carries a version number
    ///
    /// Real control packets are those with sequence numbers; a packet without
    /// any control-bearing extension has none.
    pub fn has_verno(&self) -> bool {
        self.ext_kind != CtrlExtKind::None
    }

    /// Whether this is an acknowledgement carrying no other control bits
    pub fn is_pure_ack(&self) -> bool {
        self.nonce.is_some()
            && self.flags.contains(ControlFlags::ACK)
            && !self.flags.contains(ControlFlags::SYN)
            && !self.flags.contains(ControlFlags::RSYN)
            && !self.flags.contains(ControlFlags::FIN)
            && !self.flags.contains(ControlFlags::RST)
    }

    /// Whether this packet carries transport payload
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Parse a packet, validating structure and checksum
    pub fn parse(packet: Bytes) -> Result<Self, PacketDecodeError> {
        if packet.len() < BASE_HEADER_SIZE {
            return Err(PacketDecodeError::InvalidHeader("packet shorter than base header"));
        }

        let mut buf = io::Cursor::new(&packet[..]);
        let src_flowid = FlowId(buf.get()?);
        let dst_flowid = FlowId(buf.get()?);
        let length: u16 = buf.get()?;
        let _check: u16 = buf.get()?;
        let protocol = Protocol(buf.get()?);
        let _reserved: u8 = buf.get()?;

        if (length as usize) < BASE_HEADER_SIZE {
            return Err(PacketDecodeError::InvalidHeader("header length below base header size"));
        }
        if length as usize > packet.len() {
            return Err(PacketDecodeError::InvalidHeader("header length exceeds packet"));
        }
        if !checksum::verify(&packet[..length as usize]) {
            return Err(PacketDecodeError::Checksum);
        }

        let mut ctx = Self {
            src_flowid,
            dst_flowid,
            protocol,
            length,
            flags: ControlFlags::default(),
            verno: 0,
            ackno: 0,
            nonce: None,
            ext_kind: CtrlExtKind::None,
            conn_srvid: None,
            srv_src: None,
            srv_dst: None,
            addr_ext: None,
            source: Vec::new(),
            payload: Bytes::new(),
        };

        let mut remaining = length as usize - BASE_HEADER_SIZE;
        let mut count = 0;
        while remaining > 0 {
            if count == MAX_EXTENSIONS {
                return Err(PacketDecodeError::TooManyExtensions);
            }
            let ty: u8 = buf.get()?;
            let len: u8 = buf.get()?;
            let (min, max) =
                ext_length_bounds(ty).ok_or(PacketDecodeError::UnknownExtension(ty))?;
            if (len as usize) < min || (len as usize) > max || len as usize > remaining {
                return Err(PacketDecodeError::BadExtensionLength {
                    ext: ext_name(ty),
                    len,
                });
            }
            ctx.parse_ext(ty, len, &mut buf)?;
            remaining -= len as usize;
            count += 1;
        }

        ctx.payload = packet.slice(length as usize..);
        Ok(ctx)
    }

    fn parse_ext(
        &mut self,
        ty: u8,
        len: u8,
        buf: &mut io::Cursor<&[u8]>,
    ) -> Result<(), PacketDecodeError> {
        match ty {
            CONTROL_EXT => {
                self.begin_ctrl(CtrlExtKind::Control)?;
                self.parse_ctrl_fields(buf)?;
            }
            CONNECTION_EXT => {
                self.begin_ctrl(CtrlExtKind::Connection)?;
                self.parse_ctrl_fields(buf)?;
                self.conn_srvid = Some(ServiceId(buf.get_array()?));
            }
            SERVICE_EXT => {
                // A second Service extension is allowed; any other repeat or
                // mix of control-bearing extensions is not.
                match self.ext_kind {
                    CtrlExtKind::None => {
                        self.begin_ctrl(CtrlExtKind::Service)?;
                        self.parse_ctrl_fields(buf)?;
                        self.srv_src = Some(ServiceId(buf.get_array()?));
                    }
                    CtrlExtKind::Service if self.srv_dst.is_none() => {
                        // Control fields repeat; the first extension's copy wins.
                        let _flags: u8 = buf.get()?;
                        let _reserved: u8 = buf.get()?;
                        let _pad: u16 = buf.get()?;
                        let _verno: u32 = buf.get()?;
                        let _ackno: u32 = buf.get()?;
                        let _nonce: [u8; NONCE_SIZE] = buf.get_array()?;
                        self.srv_dst = Some(ServiceId(buf.get_array()?));
                    }
                    _ => {
                        return Err(PacketDecodeError::InvalidHeader(
                            "conflicting control-bearing extensions",
                        ))
                    }
                }
            }
            ADDRESS_EXT => {
                if self.addr_ext.is_some() {
                    return Err(PacketDecodeError::InvalidHeader("duplicate ADDRESS extension"));
                }
                let _reserved: u32 = buf.get()?;
                let old: Ipv4Addr = buf.get()?;
                let new: Ipv4Addr = buf.get()?;
                self.addr_ext = Some((old, new));
            }
            SOURCE_EXT => {
                if !self.source.is_empty() {
                    return Err(PacketDecodeError::InvalidHeader("duplicate SOURCE extension"));
                }
                let n = (len as usize - 2) / 4;
                if (len as usize - 2) % 4 != 0 {
                    return Err(PacketDecodeError::BadExtensionLength { ext: "SOURCE", len });
                }
                for _ in 0..n {
                    self.source.push(buf.get()?);
                }
            }
            _ => unreachable!("length bounds checked above"),
        }
        Ok(())
    }

    fn begin_ctrl(&mut self, kind: CtrlExtKind) -> Result<(), PacketDecodeError> {
        if self.ext_kind != CtrlExtKind::None {
            return Err(PacketDecodeError::InvalidHeader(
                "conflicting control-bearing extensions",
            ));
        }
        self.ext_kind = kind;
        Ok(())
    }

    fn parse_ctrl_fields(&mut self, buf: &mut io::Cursor<&[u8]>) -> Result<(), PacketDecodeError> {
        let flags: u8 = buf.get()?;
        let _reserved: u8 = buf.get()?;
        let _pad: u16 = buf.get()?;
        self.flags = ControlFlags(flags);
        self.verno = buf.get()?;
        self.ackno = buf.get()?;
        self.nonce = Some(buf.get_array()?);
        Ok(())
    }

    /// Re-encode this packet with a replacement forwarding path
    ///
    /// Used on the forwarding path, where only the Source extension changes.
    /// The checksum is recomputed; the payload is carried through untouched.
    pub(crate) fn reencode(&self, source: &[Ipv4Addr]) -> Vec<u8> {
        let builder = HeaderBuilder {
            src_flowid: self.src_flowid,
            dst_flowid: self.dst_flowid,
            protocol: self.protocol,
            flags: self.flags,
            conn_ack: self.ext_kind == CtrlExtKind::Connection
                && !self.flags.contains(ControlFlags::SYN),
            verno: self.verno,
            ackno: self.ackno,
            nonce: self.nonce.unwrap_or_default(),
            conn_srvid: self.conn_srvid,
            datagram_srvids: match (self.srv_src, self.srv_dst) {
                (Some(src), Some(dst)) => Some((src, dst)),
                _ => None,
            },
            source: source.to_vec(),
        };
        builder.encode(&self.payload)
    }
}

/// Errors that can occur when parsing a SAL packet
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum PacketDecodeError {
    /// The packet ended before a decoder expected
    #[error("unexpected end of packet")]
    UnexpectedEnd,
    /// A structural constraint on the header was violated
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    /// An extension of an unrecognized type was encountered
    #[error("unknown extension type {0}")]
    UnknownExtension(u8),
    /// An extension declared a length outside the bounds for its type
    #[error("bad {ext} extension length {len}")]
    BadExtensionLength {
        /// Name of the offending extension type
        ext: &'static str,
        /// The declared length
        len: u8,
    },
    /// The extension chain exceeded the per-packet cap
    #[error("too many extensions")]
    TooManyExtensions,
    /// The header checksum did not verify
    #[error("checksum mismatch")]
    Checksum,
}

impl From<UnexpectedEnd> for PacketDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Description of an outgoing packet's header, from which the wire bytes are
/// built
///
/// The extension to attach is chosen from the packet intent: a Connection
/// extension for SYN and the handshake ACK, a plain Control extension for
/// RSYN/FIN/RST/ACK, and a pair of Service extensions for unconnected
/// datagrams.
#[derive(Debug, Clone)]
pub(crate) struct HeaderBuilder {
    pub(crate) src_flowid: FlowId,
    pub(crate) dst_flowid: FlowId,
    pub(crate) protocol: Protocol,
    pub(crate) flags: ControlFlags,
    /// Attach a Connection extension even without the SYN bit (handshake ACK)
    pub(crate) conn_ack: bool,
    pub(crate) verno: u32,
    pub(crate) ackno: u32,
    pub(crate) nonce: Nonce,
    pub(crate) conn_srvid: Option<ServiceId>,
    /// `(source, destination)` service identifiers for unconnected datagrams
    pub(crate) datagram_srvids: Option<(ServiceId, ServiceId)>,
    pub(crate) source: Vec<Ipv4Addr>,
}

impl HeaderBuilder {
    fn write_ctrl_fields(&self, buf: &mut Vec<u8>) {
        buf.write(self.flags.0);
        buf.write(0u8);
        buf.write(0u16);
        buf.write(self.verno);
        buf.write(self.ackno);
        buf.put_slice(&self.nonce);
    }

    /// Build the full packet: header, extensions, checksum, payload
    pub(crate) fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BASE_HEADER_SIZE + 64 + payload.len());
        buf.write(self.src_flowid.0);
        buf.write(self.dst_flowid.0);
        buf.write(0u16); // length, patched below
        buf.write(0u16); // checksum, patched below
        buf.write(self.protocol.0);
        buf.write(0u8);

        if self.flags.contains(ControlFlags::SYN) || self.conn_ack {
            buf.write(CONNECTION_EXT);
            buf.write((2 + CONNECTION_EXT_SIZE) as u8);
            self.write_ctrl_fields(&mut buf);
            buf.put_slice(&self.conn_srvid.unwrap_or_default().0);
        } else if !self.flags.is_empty() {
            buf.write(CONTROL_EXT);
            buf.write((2 + CONTROL_EXT_SIZE) as u8);
            self.write_ctrl_fields(&mut buf);
        } else if let Some((src, dst)) = self.datagram_srvids {
            for srvid in [src, dst] {
                buf.write(SERVICE_EXT);
                buf.write((2 + SERVICE_EXT_SIZE) as u8);
                self.write_ctrl_fields(&mut buf);
                buf.put_slice(&srvid.0);
            }
        }

        if !self.source.is_empty() {
            debug_assert!(self.source.len() >= SOURCE_EXT_MIN_ADDRS);
            debug_assert!(self.source.len() <= SOURCE_EXT_MAX_ADDRS);
            buf.write(SOURCE_EXT);
            buf.write((2 + 4 * self.source.len()) as u8);
            for addr in &self.source {
                buf.write(*addr);
            }
        }

        let header_len = buf.len() as u16;
        buf[8..10].copy_from_slice(&header_len.to_be_bytes());
        let check = checksum::checksum(&buf);
        buf[10..12].copy_from_slice(&check.to_be_bytes());
        buf.put_slice(payload);
        buf
    }
}
