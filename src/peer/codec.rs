//! Wire codec: the length-prefixed BitTorrent peer message protocol plus
//! the one-shot BEP 3 handshake framing used before the connection switches
//! over to it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, BlockInfo, PeerId, Sha1Hash};

/// The fixed BitTorrent protocol identifier string sent in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length, in bytes, of the handshake once framed:
/// 1 (pstrlen) + 19 (pstr) + 8 (reserved) + 20 (info hash) + 20 (peer id).
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// An upper bound on a single message's declared length, generous enough
/// for a `piece` message carrying a full 16 KiB block plus its header, with
/// headroom for implementations that use larger blocks. Anything past this
/// is treated as a protocol violation rather than an allocation hazard.
pub(crate) const MAX_ALLOWED_MSG_SIZE: u32 = 13 + 1024 * 1024;

/// The decoded BEP 3 handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// One-shot codec for the handshake, used before the connection switches to
/// [`PeerCodec`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let pstr_len = buf[0] as usize;
        let total_len = 1 + pstr_len + 8 + 20 + 20;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        let mut buf = buf.split_to(total_len);
        buf.advance(1 + pstr_len + 8);

        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// A decoded peer wire protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(crate::Bitfield),
    Request(BlockInfo),
    Block { info: BlockInfo, data: Vec<u8> },
    Cancel(BlockInfo),
}

const MSG_ID_CHOKE: u8 = 0;
const MSG_ID_UNCHOKE: u8 = 1;
const MSG_ID_INTERESTED: u8 = 2;
const MSG_ID_NOT_INTERESTED: u8 = 3;
const MSG_ID_HAVE: u8 = 4;
const MSG_ID_BITFIELD: u8 = 5;
const MSG_ID_REQUEST: u8 = 6;
const MSG_ID_PIECE: u8 = 7;
const MSG_ID_CANCEL: u8 = 8;

/// Length-prefixed peer message codec.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke => encode_header_only(buf, MSG_ID_CHOKE),
            Message::Unchoke => encode_header_only(buf, MSG_ID_UNCHOKE),
            Message::Interested => encode_header_only(buf, MSG_ID_INTERESTED),
            Message::NotInterested => {
                encode_header_only(buf, MSG_ID_NOT_INTERESTED)
            }
            Message::Have(index) => {
                buf.reserve(4 + 1 + 4);
                buf.put_u32(1 + 4);
                buf.put_u8(MSG_ID_HAVE);
                buf.put_u32(index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.reserve(4 + 1 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MSG_ID_BITFIELD);
                buf.put_slice(&bytes);
            }
            Message::Request(info) => encode_block_info(
                buf,
                MSG_ID_REQUEST,
                info.piece_index as u32,
                info.offset,
                info.len,
            ),
            Message::Cancel(info) => encode_block_info(
                buf,
                MSG_ID_CANCEL,
                info.piece_index as u32,
                info.offset,
                info.len,
            ),
            Message::Block { info, data } => {
                buf.reserve(4 + 1 + 4 + 4 + data.len());
                buf.put_u32(1 + 4 + 4 + data.len() as u32);
                buf.put_u8(MSG_ID_PIECE);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

fn encode_header_only(buf: &mut BytesMut, id: u8) {
    buf.reserve(4 + 1);
    buf.put_u32(1);
    buf.put_u8(id);
}

fn encode_block_info(buf: &mut BytesMut, id: u8, index: u32, begin: u32, len: u32) {
    buf.reserve(4 + 1 + 4 + 4 + 4);
    buf.put_u32(1 + 4 + 4 + 4);
    buf.put_u8(id);
    buf.put_u32(index);
    buf.put_u32(begin);
    buf.put_u32(len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(len_buf);

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if len > MAX_ALLOWED_MSG_SIZE {
            return Err(Error::MessageTooLarge {
                len,
                max: MAX_ALLOWED_MSG_SIZE,
            });
        }

        if buf.len() < 4 + len as usize {
            buf.reserve(4 + len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = buf[0];
        let payload_len = len as usize - 1;
        let msg = match id {
            MSG_ID_CHOKE => {
                buf.advance(1);
                Message::Choke
            }
            MSG_ID_UNCHOKE => {
                buf.advance(1);
                Message::Unchoke
            }
            MSG_ID_INTERESTED => {
                buf.advance(1);
                Message::Interested
            }
            MSG_ID_NOT_INTERESTED => {
                buf.advance(1);
                Message::NotInterested
            }
            MSG_ID_HAVE => {
                buf.advance(1);
                let index = buf.get_u32();
                Message::Have(index)
            }
            MSG_ID_BITFIELD => {
                buf.advance(1);
                let bytes = buf.split_to(payload_len);
                Message::Bitfield(crate::Bitfield::from_vec(bytes.to_vec()))
            }
            MSG_ID_REQUEST => {
                buf.advance(1);
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let req_len = buf.get_u32();
                Message::Request(BlockInfo {
                    piece_index: index,
                    offset: begin,
                    len: req_len,
                })
            }
            MSG_ID_CANCEL => {
                buf.advance(1);
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let req_len = buf.get_u32();
                Message::Cancel(BlockInfo {
                    piece_index: index,
                    offset: begin,
                    len: req_len,
                })
            }
            MSG_ID_PIECE => {
                buf.advance(1);
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let data = buf.split_to(payload_len - 8).to_vec();
                Message::Block {
                    info: BlockInfo {
                        piece_index: index,
                        offset: begin,
                        len: data.len() as u32,
                    },
                    data,
                }
            }
            _ => return Err(Error::InvalidMessageId(id)),
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bitfield;

    #[test]
    fn test_handshake_roundtrip() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_keep_alive_roundtrip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
    }

    #[test]
    fn test_request_roundtrip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let info = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        codec.encode(Message::Request(info), &mut buf).unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Request(info))
        );
    }

    #[test]
    fn test_block_roundtrip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let info = BlockInfo {
            piece_index: 3,
            offset: 0,
            len: 4,
        };
        let data = vec![1, 2, 3, 4];
        codec
            .encode(
                Message::Block {
                    info,
                    data: data.clone(),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Block { info, data })
        );
    }

    #[test]
    fn test_bitfield_roundtrip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let mut bitfield: Bitfield = vec![false; 8].into_iter().collect();
        bitfield.set(0, true);
        bitfield.set(7, true);
        codec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Bitfield(bitfield))
        );
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_ALLOWED_MSG_SIZE + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(250);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_partial_message_needs_more_bytes() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MSG_ID_HAVE);
        // missing the 4-byte piece index
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
