//! Decoding of incoming datagrams and capability enforcement, on the
//! dispatch context.

use atp_client_api_messages::mapping::{MappingOperation, MappingOperationRequest, SimpleMappingReply};
use atp_client_api_messages::transfer::{
    AssetGetInfoReply, AssetGetInfoRequest, AssetGetRequest, AssetUploadReply, AssetUploadRequest,
};
use atp_client_api_messages::{AssetServerError, MessageType};
use atp_lib::buffer::BufReader;

use super::{ClientConnectionSender, ReceivedMessage, ReplyMessage};
use crate::db::HIDDEN_BAKED_FOLDER;
use crate::server::AssetServer;
use crate::transfer::TransferTask;

/// Route one framed message. Malformed bodies are logged and dropped;
/// the client's retry logic deals with the missing reply, exactly as it
/// would with a lost datagram.
pub(crate) fn handle_message(
    server: &mut AssetServer,
    sender: &ClientConnectionSender,
    can_write: bool,
    message: ReceivedMessage,
) {
    match message.message_type {
        MessageType::AssetMappingOperation => handle_mapping_operation(server, sender, can_write, &message.payload),
        MessageType::AssetGetInfo => handle_asset_get_info(server, sender, &message.payload),
        MessageType::AssetGet => handle_asset_get(server, sender, &message.payload),
        MessageType::AssetUpload => handle_asset_upload(server, sender, can_write, &message.payload),
        other => log::warn!("Unexpected message type {other:?} from {}", sender.id),
    }
}

fn handle_mapping_operation(
    server: &mut AssetServer,
    sender: &ClientConnectionSender,
    can_write: bool,
    payload: &[u8],
) {
    let request = match MappingOperationRequest::decode(&mut &payload[..]) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("Malformed mapping operation from {}: {e}", sender.id);
            return;
        }
    };
    let message_id = request.message_id;

    let mut out = Vec::new();
    match request.op {
        MappingOperation::Get { path } => server.get_mapping_reply(message_id, &path).encode(&mut out),
        MappingOperation::GetAll => server.get_all_mappings_reply(message_id).encode(&mut out),
        MappingOperation::Set { path, hash } => {
            let error = if !can_write {
                AssetServerError::PermissionDenied
            } else if path.starts_with(HIDDEN_BAKED_FOLDER) {
                log::debug!("Refusing to process a set mapping operation inside {HIDDEN_BAKED_FOLDER}");
                AssetServerError::PermissionDenied
            } else {
                server.set_mapping(&path, hash)
            };
            SimpleMappingReply { message_id, error }.encode(&mut out);
        }
        MappingOperation::Delete { paths } => {
            let error = if !can_write {
                AssetServerError::PermissionDenied
            } else {
                // hidden-prefix paths are silently dropped from the
                // batch rather than failing it
                let deletable: Vec<String> = paths
                    .into_iter()
                    .filter(|path| {
                        let hidden = path.starts_with(HIDDEN_BAKED_FOLDER);
                        if hidden {
                            log::debug!("Refusing to delete mapping {path} inside {HIDDEN_BAKED_FOLDER}");
                        }
                        !hidden
                    })
                    .collect();
                server.delete_mappings(&deletable)
            };
            SimpleMappingReply { message_id, error }.encode(&mut out);
        }
        MappingOperation::Rename { old_path, new_path } => {
            let error = if !can_write {
                AssetServerError::PermissionDenied
            } else if old_path.starts_with(HIDDEN_BAKED_FOLDER) || new_path.starts_with(HIDDEN_BAKED_FOLDER) {
                log::debug!("Cannot rename {old_path} to {new_path} since one is inside {HIDDEN_BAKED_FOLDER}");
                AssetServerError::PermissionDenied
            } else {
                server.rename_mapping(&old_path, &new_path)
            };
            SimpleMappingReply { message_id, error }.encode(&mut out);
        }
        MappingOperation::SetBakingEnabled { enabled, paths } => {
            let error = if !can_write {
                AssetServerError::PermissionDenied
            } else {
                server.set_baking_enabled(&paths, enabled)
            };
            SimpleMappingReply { message_id, error }.encode(&mut out);
        }
    }

    sender.send(ReplyMessage::new(MessageType::AssetMappingOperationReply, out));
}

fn handle_asset_get_info(server: &mut AssetServer, sender: &ClientConnectionSender, payload: &[u8]) {
    let request = match AssetGetInfoRequest::decode(&mut &payload[..]) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("Bad asset info request from {}: {e}", sender.id);
            return;
        }
    };

    let (error, size) = match server.blobs.size(&request.hash) {
        Ok(Some(size)) => (AssetServerError::NoError, Some(size)),
        Ok(None) => {
            log::debug!("Asset not found: {}", request.hash);
            (AssetServerError::AssetNotFound, None)
        }
        Err(e) => {
            log::warn!("Failed to stat asset {}: {e}", request.hash);
            (AssetServerError::FileOperationFailed, None)
        }
    };

    let mut out = Vec::new();
    AssetGetInfoReply {
        message_id: request.message_id,
        hash: request.hash,
        error,
        size,
    }
    .encode(&mut out);
    sender.send(ReplyMessage::new(MessageType::AssetGetInfoReply, out));
}

fn handle_asset_get(server: &mut AssetServer, sender: &ClientConnectionSender, payload: &[u8]) {
    let request = match AssetGetRequest::decode(&mut &payload[..]) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("Bad asset get request from {}: {e}", sender.id);
            return;
        }
    };

    server.transfer.submit(TransferTask::SendAsset {
        request,
        sender: sender.clone(),
    });
}

fn handle_asset_upload(server: &mut AssetServer, sender: &ClientConnectionSender, can_write: bool, payload: &[u8]) {
    if !can_write {
        // a node that may not write gets an immediate refusal rather
        // than a dropped message, so its upload UI can fail fast
        let mut buf = payload;
        let Ok(message_id) = buf.get_u32() else { return };
        let mut out = Vec::new();
        AssetUploadReply {
            message_id,
            error: AssetServerError::PermissionDenied,
            hash: None,
        }
        .encode(&mut out);
        sender.send(ReplyMessage::new(MessageType::AssetUploadReply, out));
        return;
    }

    let request = match AssetUploadRequest::decode(&mut &payload[..]) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("Bad asset upload request from {}: {e}", sender.id);
            return;
        }
    };

    log::debug!("Starting an upload task for {} bytes from {}", request.data.len(), sender.id);
    server.transfer.submit(TransferTask::StoreUpload {
        request,
        sender: sender.clone(),
    });
}
