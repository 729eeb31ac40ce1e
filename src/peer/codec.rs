//! The framing layer of the peer wire protocol.
//!
//! A connection starts with a fixed 68 byte handshake, after which it
//! carries length-prefixed messages: a 4 byte big endian length, a one
//! byte message id and the message payload. A zero length frame is a
//! keep-alive. [`HandshakeCodec`] and [`PeerCodec`] translate between
//! those frames and typed messages; the session decides what to do with
//! them.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Bit 0x10 of reserved byte 5 advertises extension protocol support.
pub(crate) const EXTENSION_PROTOCOL_FLAG: u8 = 0x10;

/// Within message 20, extended id 0 is the extension handshake itself.
pub(crate) const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// No legitimate frame comes close to this; a larger length prefix means
/// the peer is broken or hostile.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// The BitTorrent handshake, not length-prefixed:
/// `pstrlen(1) pstr(19) reserved(8) info_hash(20) peer_id(20)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our side of the handshake. The extension protocol is
    /// advertised only when we mean to fetch metadata.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, extensions: bool) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        if extensions {
            reserved[5] |= EXTENSION_PROTOCOL_FLAG;
        }
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(68);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.extend_from_slice(&handshake.prot);
        dst.extend_from_slice(&handshake.reserved);
        dst.extend_from_slice(&handshake.info_hash);
        dst.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }
        let prot_len = src[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::InvalidHandshake);
        }
        if src.len() < 49 + prot_len {
            return Ok(None);
        }
        src.advance(1);

        let mut prot = [0; 19];
        src.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }
        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The messages of the peer wire protocol.
///
/// `NotInterested`, `Request` and `Cancel` are only ever received (we
/// don't upload), but the codec speaks the full message set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// An extension protocol message: the extended id followed by its
    /// (bencoded) payload.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            20 => Ok(Self::Extended),
            id => Err(Error::InvalidMessageId(id)),
        }
    }
}

#[derive(Default)]
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke => put_header(dst, 1, MessageId::Choke),
            Message::Unchoke => put_header(dst, 1, MessageId::Unchoke),
            Message::Interested => put_header(dst, 1, MessageId::Interested),
            Message::NotInterested => put_header(dst, 1, MessageId::NotInterested),
            Message::Have { piece_index } => {
                put_header(dst, 5, MessageId::Have);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                put_header(dst, 1 + raw.len() as u32, MessageId::Bitfield);
                dst.extend_from_slice(raw);
            }
            Message::Request(block) => {
                put_header(dst, 13, MessageId::Request);
                put_block_info(dst, block);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                put_header(dst, 9 + data.len() as u32, MessageId::Block);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                put_header(dst, 13, MessageId::Cancel);
                put_block_info(dst, block);
            }
            Message::Extended { id, payload } => {
                put_header(dst, 2 + payload.len() as u32, MessageId::Extended);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

fn put_header(dst: &mut BytesMut, len: u32, id: MessageId) {
    dst.reserve(4 + len as usize);
    dst.put_u32(len);
    dst.put_u8(id as u8);
}

fn put_block_info(dst: &mut BytesMut, block: BlockInfo) {
    dst.put_u32(block.piece_index as u32);
    dst.put_u32(block.offset);
    dst.put_u32(block.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len as usize));
        }
        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        let len = len as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut payload = src.split_to(len);
        let id = payload.get_u8();
        let msg = match MessageId::try_from(id)? {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.remaining() != 4 {
                    return Err(Error::InvalidPayload("have"));
                }
                Message::Have {
                    piece_index: payload.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
            MessageId::Request => Message::Request(get_block_info(&mut payload, "request")?),
            MessageId::Block => {
                if payload.remaining() < 8 {
                    return Err(Error::InvalidPayload("block"));
                }
                Message::Block {
                    piece_index: payload.get_u32() as PieceIndex,
                    offset: payload.get_u32(),
                    data: payload.to_vec(),
                }
            }
            MessageId::Cancel => Message::Cancel(get_block_info(&mut payload, "cancel")?),
            MessageId::Extended => {
                if !payload.has_remaining() {
                    return Err(Error::InvalidPayload("extended"));
                }
                Message::Extended {
                    id: payload.get_u8(),
                    payload: payload.to_vec(),
                }
            }
        };
        Ok(Some(msg))
    }
}

fn get_block_info(payload: &mut BytesMut, name: &'static str) -> Result<BlockInfo> {
    if payload.remaining() != 12 {
        return Err(Error::InvalidPayload(name));
    }
    Ok(BlockInfo {
        piece_index: payload.get_u32() as PieceIndex,
        offset: payload.get_u32(),
        len: payload.get_u32(),
    })
}
