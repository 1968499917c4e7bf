//! The I/O worker pool behind `AssetGet` and `AssetUpload`.
//!
//! Transfer work never touches the mapping state: sends are pure reads
//! and reply straight to the client, while uploads store the blob and
//! then report back to the dispatch context, which owns every decision
//! about what gets published.

use std::io::{Read, Seek, SeekFrom};

use atp_client_api_messages::transfer::{AssetGetReply, AssetGetRequest, AssetUploadRequest};
use atp_client_api_messages::{AssetServerError, MessageId, MessageType};
use atp_lib::hash::Hash;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::client::{ClientConnectionSender, ReplyMessage};
use crate::db::BlobStore;

/// Posted to the dispatch context when an upload task has finished its
/// blob I/O.
#[derive(Debug)]
pub struct UploadStored {
    pub sender: ClientConnectionSender,
    pub message_id: MessageId,
    pub result: Result<Hash, AssetServerError>,
}

pub enum TransferTask {
    SendAsset {
        request: AssetGetRequest,
        sender: ClientConnectionSender,
    },
    StoreUpload {
        request: AssetUploadRequest,
        sender: ClientConnectionSender,
    },
}

/// A fixed number of workers draining one MPMC queue. Transfer work is
/// I/O bound, so the pool is sized well past the core count.
pub struct TransferPool {
    tx: flume::Sender<TransferTask>,
    rx: flume::Receiver<TransferTask>,
}

impl TransferPool {
    pub fn spawn(
        blobs: BlobStore,
        max_upload_size: u64,
        workers: usize,
        uploads: mpsc::UnboundedSender<UploadStored>,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        for _ in 0..workers.max(1) {
            tokio::spawn(run_worker(rx.clone(), blobs.clone(), uploads.clone(), max_upload_size));
        }
        Self { tx, rx }
    }

    pub fn submit(&self, task: TransferTask) {
        if self.tx.send(task).is_err() {
            log::warn!("Transfer pool is shut down; dropping transfer task");
        }
    }

    /// Drop every queued task. Tasks already picked up by a worker run
    /// to completion.
    pub fn clear(&self) {
        let dropped = self.rx.drain().count();
        if dropped > 0 {
            log::debug!("Dropped {dropped} queued transfer tasks");
        }
    }
}

async fn run_worker(
    rx: flume::Receiver<TransferTask>,
    blobs: BlobStore,
    uploads: mpsc::UnboundedSender<UploadStored>,
    max_upload_size: u64,
) {
    while let Ok(task) = rx.recv_async().await {
        match task {
            TransferTask::SendAsset { request, sender } => {
                let reply = send_asset(blobs.clone(), request).await;
                let mut out = Vec::new();
                reply.encode(&mut out);
                sender.send(ReplyMessage::new(MessageType::AssetGetReply, out));
            }
            TransferTask::StoreUpload { request, sender } => {
                let message_id = request.message_id;
                let result = store_upload(blobs.clone(), request.data, max_upload_size).await;
                if uploads.send(UploadStored {
                    sender,
                    message_id,
                    result,
                }).is_err() {
                    log::debug!("Dispatch context is gone; dropping upload result");
                }
            }
        }
    }
}

async fn send_asset(blobs: BlobStore, request: AssetGetRequest) -> AssetGetReply {
    let message_id = request.message_id;
    let read = tokio::task::spawn_blocking(move || read_range(&blobs, &request)).await;
    match read {
        Ok(Ok(data)) => AssetGetReply {
            message_id,
            error: AssetServerError::NoError,
            data,
        },
        Ok(Err(error)) => AssetGetReply::failed(message_id, error),
        Err(e) => {
            log::warn!("Asset send task panicked: {e}");
            AssetGetReply::failed(message_id, AssetServerError::FileOperationFailed)
        }
    }
}

fn read_range(blobs: &BlobStore, request: &AssetGetRequest) -> Result<Bytes, AssetServerError> {
    let size = match blobs.size(&request.hash) {
        Ok(Some(size)) => size,
        Ok(None) => return Err(AssetServerError::AssetNotFound),
        Err(e) => {
            log::warn!("Failed to stat blob {}: {e}", request.hash);
            return Err(AssetServerError::FileOperationFailed);
        }
    };

    // both offsets are inclusive
    if request.start > request.end || request.end >= size {
        return Err(AssetServerError::InvalidByteRange);
    }
    let length = request.end - request.start + 1;

    let read = || -> std::io::Result<Option<Vec<u8>>> {
        let Some(mut file) = blobs.open_blob(&request.hash).map_err(std::io::Error::other)? else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(request.start))?;
        let mut data = vec![0; length as usize];
        file.read_exact(&mut data)?;
        Ok(Some(data))
    };

    match read() {
        Ok(Some(data)) => Ok(data.into()),
        Ok(None) => Err(AssetServerError::AssetNotFound),
        Err(e) => {
            log::warn!("Failed to read blob {}: {e}", request.hash);
            Err(AssetServerError::FileOperationFailed)
        }
    }
}

async fn store_upload(blobs: BlobStore, data: Bytes, max_upload_size: u64) -> Result<Hash, AssetServerError> {
    if data.len() as u64 > max_upload_size {
        return Err(AssetServerError::AssetTooLarge);
    }

    let stored = tokio::task::spawn_blocking(move || blobs.put(&data)).await;
    match stored {
        Ok(Ok(hash)) => Ok(hash),
        Ok(Err(e)) => {
            log::warn!("Failed to store uploaded blob: {e}");
            Err(AssetServerError::FileOperationFailed)
        }
        Err(e) => {
            log::warn!("Upload task panicked: {e}");
            Err(AssetServerError::FileOperationFailed)
        }
    }
}
