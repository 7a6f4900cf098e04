//! Wire envelope
//!
//! A packet is a bincode-encoded [`Msg`], optionally followed by a 64-byte Ed25519
//! signature over `pseudo-header || encoded Msg`. The pseudo-header binds the
//! message type and both endpoint addresses but is never transmitted.
use bincode::{Decode, Encode};
use ed25519_dalek::{Signature, SIGNATURE_LENGTH};

use crate::error::Result;
use crate::protocol_error;

/// Largest datagram we read or decode
pub const MAX_PACKET: usize = 9999;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_limit::<MAX_PACKET>()
}

pub fn encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, wire_config())?)
}

/// Decode a value from the front of `bytes`, returning it with the number of bytes
/// consumed.
pub fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<(T, usize)> {
    Ok(bincode::decode_from_slice(bytes, wire_config())?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Offer = 1,
    Response = 2,
    Data = 3,
}

impl TryFrom<u8> for MsgType {
    type Error = crate::error::FlockError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(MsgType::Offer),
            2 => Ok(MsgType::Response),
            3 => Ok(MsgType::Data),
            other => Err(protocol_error!("bogus message type {}", other)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Msg {
    pub msg_type: u8,
    pub src_addr: String,
    pub cert_der: Vec<u8>,
    pub nonce: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new(msg_type: MsgType, src_addr: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type as u8,
            src_addr: src_addr.into(),
            ..Self::default()
        }
    }
}

#[derive(Encode)]
struct PseudoHdr {
    msg_type: u8,
    src_addr: String,
    dst_addr: String,
}

/// Bytes of the pseudo-header for a message of `msg_type` from `src` to `dst`.
pub fn pseudo_header(msg_type: u8, src: &str, dst: &str) -> Result<Vec<u8>> {
    encode(&PseudoHdr {
        msg_type,
        src_addr: src.to_string(),
        dst_addr: dst.to_string(),
    })
}

/// A decoded packet, still borrowing the signed bytes
#[derive(Debug)]
pub struct Packet<'a> {
    pub msg: Msg,
    /// The encoded message, which the signature covers
    pub body: &'a [u8],
    pub signature: Option<Signature>,
}

/// Split a packet into its message and trailing signature.
pub fn split_packet(pkt: &[u8]) -> Result<Packet<'_>> {
    let (msg, used): (Msg, usize) = decode(pkt)?;
    let (body, trailer) = pkt.split_at(used);
    let signature = match trailer.len() {
        0 => None,
        SIGNATURE_LENGTH => Some(Signature::from_slice(trailer)?),
        n => return Err(protocol_error!("bad signature size {}", n)),
    };
    Ok(Packet {
        msg,
        body,
        signature,
    })
}
