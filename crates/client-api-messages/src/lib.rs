//! Schemas of the messages exchanged with the ATP asset server.
//!
//! The transport frames each datagram as `(type, sender, body)`; this
//! crate defines the message type tags and the body layouts. Integers
//! are little-endian, hashes travel as 32 raw bytes, and strings are
//! u32-length-prefixed UTF-8.

use atp_lib::buffer::DecodeError;

pub mod mapping;
pub mod transfer;

/// Client-chosen identifier echoed in the reply to let the client pair
/// requests with responses.
pub type MessageId = u32;

/// The type tag of a framed message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum MessageType {
    AssetGet = 0,
    AssetGetReply,
    AssetGetInfo,
    AssetGetInfoReply,
    AssetUpload,
    AssetUploadReply,
    AssetMappingOperation,
    AssetMappingOperationReply,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, DecodeError> {
        use MessageType::*;
        Ok(match tag {
            0 => AssetGet,
            1 => AssetGetReply,
            2 => AssetGetInfo,
            3 => AssetGetInfoReply,
            4 => AssetUpload,
            5 => AssetUploadReply,
            6 => AssetMappingOperation,
            7 => AssetMappingOperationReply,
            tag => return Err(DecodeError::InvalidTag { tag, kind: "MessageType" }),
        })
    }
}

/// Status byte leading every reply body.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum AssetServerError {
    NoError = 0,
    AssetNotFound,
    InvalidByteRange,
    AssetTooLarge,
    PermissionDenied,
    MappingOperationFailed,
    FileOperationFailed,
    NoCorrespondingAsset,
}

impl TryFrom<u8> for AssetServerError {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, DecodeError> {
        use AssetServerError::*;
        Ok(match tag {
            0 => NoError,
            1 => AssetNotFound,
            2 => InvalidByteRange,
            3 => AssetTooLarge,
            4 => PermissionDenied,
            5 => MappingOperationFailed,
            6 => FileOperationFailed,
            7 => NoCorrespondingAsset,
            tag => return Err(DecodeError::InvalidTag { tag, kind: "AssetServerError" }),
        })
    }
}

/// Where an asset stands in the bake pipeline. Derived on demand for
/// GetAll replies, never stored.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum BakingStatus {
    NotBaked = 0,
    Pending,
    Baking,
    Baked,
    Error,
    Irrelevant,
}

impl TryFrom<u8> for BakingStatus {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, DecodeError> {
        use BakingStatus::*;
        Ok(match tag {
            0 => NotBaked,
            1 => Pending,
            2 => Baking,
            3 => Baked,
            4 => Error,
            5 => Irrelevant,
            tag => return Err(DecodeError::InvalidTag { tag, kind: "BakingStatus" }),
        })
    }
}
