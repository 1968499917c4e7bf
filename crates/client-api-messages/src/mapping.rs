//! Bodies of `AssetMappingOperation` messages and their replies.

use atp_lib::buffer::{BufReader, BufWriter, DecodeError};
use atp_lib::hash::{Hash, HASH_LEN};

use crate::{AssetServerError, BakingStatus, MessageId};

/// Operation selector, the byte following the message id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MappingOperationType {
    Get = 0,
    GetAll,
    Set,
    Delete,
    Rename,
    SetBakingEnabled,
}

impl TryFrom<u8> for MappingOperationType {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, DecodeError> {
        use MappingOperationType::*;
        Ok(match tag {
            0 => Get,
            1 => GetAll,
            2 => Set,
            3 => Delete,
            4 => Rename,
            5 => SetBakingEnabled,
            tag => {
                return Err(DecodeError::InvalidTag {
                    tag,
                    kind: "MappingOperationType",
                })
            }
        })
    }
}

/// A decoded mapping operation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MappingOperation {
    /// Resolve one path. The path may carry a URL query (`?skybox`).
    Get { path: String },
    /// Dump every mapping with its derived baking status.
    GetAll,
    Set { path: String, hash: Hash },
    Delete { paths: Vec<String> },
    Rename { old_path: String, new_path: String },
    SetBakingEnabled { enabled: bool, paths: Vec<String> },
}

/// Full request body: message id, op selector, op payload.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MappingOperationRequest {
    pub message_id: MessageId,
    pub op: MappingOperation,
}

impl MappingOperationRequest {
    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let message_id = buf.get_u32()?;
        let op_type = MappingOperationType::try_from(buf.get_u8()?)?;

        let op = match op_type {
            MappingOperationType::Get => MappingOperation::Get {
                path: buf.get_str()?.to_owned(),
            },
            MappingOperationType::GetAll => MappingOperation::GetAll,
            MappingOperationType::Set => {
                let path = buf.get_str()?.to_owned();
                let hash = Hash::from_slice(buf.get_slice(HASH_LEN)?);
                MappingOperation::Set { path, hash }
            }
            MappingOperationType::Delete => MappingOperation::Delete {
                paths: decode_paths(buf)?,
            },
            MappingOperationType::Rename => {
                let old_path = buf.get_str()?.to_owned();
                let new_path = buf.get_str()?.to_owned();
                MappingOperation::Rename { old_path, new_path }
            }
            MappingOperationType::SetBakingEnabled => {
                let enabled = buf.get_u8()? != 0;
                let paths = decode_paths(buf)?;
                MappingOperation::SetBakingEnabled { enabled, paths }
            }
        };

        Ok(Self { message_id, op })
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        match &self.op {
            MappingOperation::Get { path } => {
                out.put_u8(MappingOperationType::Get as u8);
                out.put_str(path);
            }
            MappingOperation::GetAll => out.put_u8(MappingOperationType::GetAll as u8),
            MappingOperation::Set { path, hash } => {
                out.put_u8(MappingOperationType::Set as u8);
                out.put_str(path);
                out.put_slice(hash.as_slice());
            }
            MappingOperation::Delete { paths } => {
                out.put_u8(MappingOperationType::Delete as u8);
                encode_paths(out, paths);
            }
            MappingOperation::Rename { old_path, new_path } => {
                out.put_u8(MappingOperationType::Rename as u8);
                out.put_str(old_path);
                out.put_str(new_path);
            }
            MappingOperation::SetBakingEnabled { enabled, paths } => {
                out.put_u8(MappingOperationType::SetBakingEnabled as u8);
                out.put_u8(*enabled as u8);
                encode_paths(out, paths);
            }
        }
    }
}

fn decode_paths<'de>(buf: &mut impl BufReader<'de>) -> Result<Vec<String>, DecodeError> {
    let count = buf.get_u32()? as usize;
    let mut paths = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        paths.push(buf.get_str()?.to_owned());
    }
    Ok(paths)
}

fn encode_paths(out: &mut impl BufWriter, paths: &[String]) {
    out.put_u32(paths.len() as u32);
    for path in paths {
        out.put_str(path);
    }
}

/// Reply to `Get`. On success carries the served hash; when the server
/// redirected to a baked variant, also the baked path so the client can
/// issue relative requests against it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GetMappingReply {
    pub message_id: MessageId,
    pub error: AssetServerError,
    pub hash: Option<Hash>,
    pub redirected_path: Option<String>,
}

impl GetMappingReply {
    pub fn not_found(message_id: MessageId) -> Self {
        Self {
            message_id,
            error: AssetServerError::AssetNotFound,
            hash: None,
            redirected_path: None,
        }
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_u8(self.error as u8);
        if let Some(hash) = &self.hash {
            out.put_slice(hash.as_slice());
            match &self.redirected_path {
                Some(path) => {
                    out.put_u8(1);
                    out.put_str(path);
                }
                None => out.put_u8(0),
            }
        }
    }

    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let message_id = buf.get_u32()?;
        let error = AssetServerError::try_from(buf.get_u8()?)?;
        let (mut hash, mut redirected_path) = (None, None);
        if error == AssetServerError::NoError {
            hash = Some(Hash::from_slice(buf.get_slice(HASH_LEN)?));
            if buf.get_u8()? != 0 {
                redirected_path = Some(buf.get_str()?.to_owned());
            }
        }
        Ok(Self {
            message_id,
            error,
            hash,
            redirected_path,
        })
    }
}

/// One entry of a `GetAll` reply.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MappingStatusEntry {
    pub path: String,
    pub hash: Hash,
    pub status: BakingStatus,
    /// Populated iff `status == BakingStatus::Error`.
    pub bake_errors: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GetAllMappingsReply {
    pub message_id: MessageId,
    pub mappings: Vec<MappingStatusEntry>,
}

impl GetAllMappingsReply {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_u8(AssetServerError::NoError as u8);
        out.put_u32(self.mappings.len() as u32);
        for entry in &self.mappings {
            out.put_str(&entry.path);
            out.put_slice(entry.hash.as_slice());
            out.put_u8(entry.status as u8);
            if entry.status == BakingStatus::Error {
                out.put_str(entry.bake_errors.as_deref().unwrap_or(""));
            }
        }
    }

    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let message_id = buf.get_u32()?;
        let _error = AssetServerError::try_from(buf.get_u8()?)?;
        let count = buf.get_u32()? as usize;
        let mut mappings = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let path = buf.get_str()?.to_owned();
            let hash = Hash::from_slice(buf.get_slice(HASH_LEN)?);
            let status = BakingStatus::try_from(buf.get_u8()?)?;
            let bake_errors = (status == BakingStatus::Error)
                .then(|| buf.get_str().map(str::to_owned))
                .transpose()?;
            mappings.push(MappingStatusEntry {
                path,
                hash,
                status,
                bake_errors,
            });
        }
        Ok(Self { message_id, mappings })
    }
}

/// Reply to `Set`, `Delete`, `Rename` and `SetBakingEnabled`: just the
/// outcome.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SimpleMappingReply {
    pub message_id: MessageId,
    pub error: AssetServerError,
}

impl SimpleMappingReply {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.message_id);
        out.put_u8(self.error as u8);
    }

    pub fn decode<'de>(buf: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        Ok(Self {
            message_id: buf.get_u32()?,
            error: AssetServerError::try_from(buf.get_u8()?)?,
        })
    }
}
