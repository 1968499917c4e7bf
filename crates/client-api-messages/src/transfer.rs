//! Bodies of the asset transfer messages: info lookup, ranged reads and
//! uploads.

use atp_lib::buffer::{BufReader, BufWriter, DecodeError};
use atp_lib::hash::{Hash, HASH_LEN};
use bytes::Bytes;

use crate::{AssetServerError, MessageId};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AssetGetInfoRequest {
    pub message_id: MessageId,
    pub hash: Hash,
}

impl AssetGetInfoRequest {
    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        Ok(Self {
            message_id: buf.get_u32()?,
            hash: Hash::from_slice(buf.get_slice(HASH_LEN)?),
        })
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_slice(self.hash.as_slice());
    }
}

/// Info replies echo the hash so the client can pair them without
/// tracking message ids.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AssetGetInfoReply {
    pub message_id: MessageId,
    pub hash: Hash,
    pub error: AssetServerError,
    pub size: Option<u64>,
}

impl AssetGetInfoReply {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_slice(self.hash.as_slice());
        out.put_u8(self.error as u8);
        if let Some(size) = self.size {
            out.put_u64(size);
        }
    }

    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let message_id = buf.get_u32()?;
        let hash = Hash::from_slice(buf.get_slice(HASH_LEN)?);
        let error = AssetServerError::try_from(buf.get_u8()?)?;
        let size = match error {
            AssetServerError::NoError => Some(buf.get_u64()?),
            _ => None,
        };
        Ok(Self {
            message_id,
            hash,
            error,
            size,
        })
    }
}

/// Ranged read of a blob. `start..=end` are byte offsets, both
/// inclusive; `[0, 2]` of a 3-byte asset returns all of it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AssetGetRequest {
    pub message_id: MessageId,
    pub hash: Hash,
    pub start: u64,
    pub end: u64,
}

impl AssetGetRequest {
    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        Ok(Self {
            message_id: buf.get_u32()?,
            hash: Hash::from_slice(buf.get_slice(HASH_LEN)?),
            start: buf.get_u64()?,
            end: buf.get_u64()?,
        })
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_slice(self.hash.as_slice());
        out.put_u64(self.start);
        out.put_u64(self.end);
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetGetReply {
    pub message_id: MessageId,
    pub error: AssetServerError,
    pub data: Bytes,
}

impl AssetGetReply {
    pub fn failed(message_id: MessageId, error: AssetServerError) -> Self {
        Self {
            message_id,
            error,
            data: Bytes::new(),
        }
    }

    /// The requested bytes are the whole rest of the body; the
    /// transport's framing bounds them.
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_u8(self.error as u8);
        if self.error == AssetServerError::NoError {
            out.put_slice(&self.data);
        }
    }

    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let message_id = buf.get_u32()?;
        let error = AssetServerError::try_from(buf.get_u8()?)?;
        let data = match error {
            AssetServerError::NoError => Bytes::copy_from_slice(buf.get_slice(buf.remaining())?),
            _ => Bytes::new(),
        };
        Ok(Self {
            message_id,
            error,
            data,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetUploadRequest {
    pub message_id: MessageId,
    pub data: Bytes,
}

impl AssetUploadRequest {
    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let message_id = buf.get_u32()?;
        let len = buf.get_u64()? as usize;
        let data = Bytes::copy_from_slice(buf.get_slice(len)?);
        Ok(Self { message_id, data })
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_u64(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AssetUploadReply {
    pub message_id: MessageId,
    pub error: AssetServerError,
    /// The content hash of the stored blob, present iff the upload
    /// succeeded.
    pub hash: Option<Hash>,
}

impl AssetUploadReply {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_u8(self.error as u8);
        if let Some(hash) = &self.hash {
            out.put_slice(hash.as_slice());
        }
    }

    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let message_id = buf.get_u32()?;
        let error = AssetServerError::try_from(buf.get_u8()?)?;
        let hash = match error {
            AssetServerError::NoError => Some(Hash::from_slice(buf.get_slice(HASH_LEN)?)),
            _ => None,
        };
        Ok(Self {
            message_id,
            error,
            hash,
        })
    }
}
