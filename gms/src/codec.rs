use tokio_util::bytes::{Buf as _, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::config::MAX_FRAME_LENGTH;
use crate::error::GmsError;
use crate::member::{MemberIdentifier, Version};
use crate::message::{Message, MessageKind, Payload};

/// [`MessageCodec`] encodes one [`Message`] per datagram or frame.
///
/// Layout: DSFID (u16), schema version (u16), then the sender, the recipient
/// and the payload body, each a u32 length prefix followed by bincode bytes.
/// Identifiers inside the message are written in the form the target version
/// understands.
pub(crate) struct MessageCodec {
    version: Version,
}

impl MessageCodec {
    pub(crate) fn new(version: Version) -> Self {
        MessageCodec { version }
    }

    pub(crate) fn encode_to_vec(&mut self, message: Message) -> Result<Vec<u8>, GmsError> {
        let mut buffer = BytesMut::new();
        self.encode(message, &mut buffer)?;
        Ok(buffer.to_vec())
    }

    pub(crate) fn decode_slice(&mut self, data: &[u8]) -> Result<Message, GmsError> {
        let mut buffer = BytesMut::from(data);
        self.decode(&mut buffer)?
            .ok_or_else(|| GmsError::Codec("empty message".to_string()))
    }

    /// read a fixed number of bytes
    fn read_bytes(src: &mut BytesMut, size: usize) -> Result<BytesMut, GmsError> {
        if src.remaining() < size {
            return Err(GmsError::Codec(format!(
                "buffer underflow: need {} bytes, have {}",
                size,
                src.remaining()
            )));
        }
        Ok(src.split_to(size))
    }

    /// Read a u32 length, then that many bytes.
    fn read_length_prefixed(src: &mut BytesMut) -> Result<BytesMut, GmsError> {
        let len = Self::read_bytes(src, 4)?.get_u32() as usize;
        Self::read_bytes(src, len)
    }

    fn write_length_prefixed(bytes: &[u8], dst: &mut BytesMut) -> Result<(), GmsError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| GmsError::Codec(format!("field of {} bytes is too large", bytes.len())))?;
        dst.put_u32(len);
        dst.extend_from_slice(bytes);
        Ok(())
    }

    fn encode_identifier(&self, id: Option<&MemberIdentifier>, dst: &mut BytesMut) -> Result<(), GmsError> {
        let id = id.map(|id| id.for_version(self.version)).transpose()?;
        Self::write_length_prefixed(&bincode::serialize(&id)?, dst)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = GmsError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u16(item.kind.dsfid());
        dst.put_u16(self.version.ordinal());
        self.encode_identifier(item.sender.as_ref(), dst)?;
        self.encode_identifier(item.recipient.as_ref(), dst)?;

        let payload = item.payload.for_version(self.version)?;
        Self::write_length_prefixed(&payload.serialize()?, dst)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = GmsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let kind = MessageKind::from_dsfid(Self::read_bytes(src, 2)?.get_u16())?;
        let version = Version::from_ordinal(Self::read_bytes(src, 2)?.get_u16())
            .map_err(|e| GmsError::Codec(e.to_string()))?;
        if version > self.version {
            return Err(GmsError::Codec(format!(
                "message schema {} is newer than the connection's {}",
                version, self.version
            )));
        }

        let sender: Option<MemberIdentifier> = bincode::deserialize(&Self::read_length_prefixed(src)?)?;
        let recipient: Option<MemberIdentifier> = bincode::deserialize(&Self::read_length_prefixed(src)?)?;
        let payload = Payload::deserialize(kind, &Self::read_length_prefixed(src)?)?;

        Ok(Some(Message { kind, sender, recipient, payload }))
    }
}

/// Framing of the direct channel: 4-byte big-endian length, then the frame.
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}
