//! The dispatch context: one actor task owning every piece of mutable
//! namespace state.
//!
//! All mapping, metadata and bake bookkeeping happens here, in arrival
//! order. The worker pools only ever communicate with this task by
//! posting events; nothing else mutates the stores.

use std::fs;
use std::sync::Arc;

use anyhow::Context;
use atp_client_api_messages::mapping::{GetAllMappingsReply, GetMappingReply, MappingStatusEntry};
use atp_client_api_messages::transfer::AssetUploadReply;
use atp_client_api_messages::{AssetServerError, BakingStatus, MessageId, MessageType};
use atp_lib::hash::Hash;
use scopeguard::ScopeGuard;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bake::baker::{Baker, CompressionSettings, TextureBaker};
use crate::bake::{BakeCoordinator, BakeEvent};
use crate::client::{message_handlers, ClientConnectionSender, ReceivedMessage, ReplyMessage};
use crate::config::AssetServerConfig;
use crate::db::meta_store::{self, AssetMeta};
use crate::db::{baked_folder_path, baked_mapping_path, BlobStore, MappingStore, HIDDEN_BAKED_FOLDER};
use crate::error::StoreError;
use crate::transfer::{TransferPool, UploadStored};

const ASSET_FILES_SUBDIR: &str = "files";

enum MsgOrExit<T> {
    Msg(T),
    Exit,
}

pub enum ServerMessage {
    Request {
        sender: ClientConnectionSender,
        can_write: bool,
        message: ReceivedMessage,
    },
}

/// Cheap-to-clone submission handle held by the transport glue.
#[derive(Clone)]
pub struct AssetServerHandle {
    tx: mpsc::UnboundedSender<MsgOrExit<ServerMessage>>,
}

impl AssetServerHandle {
    /// Post one received message for dispatch. `can_write` is the
    /// sender's write capability as derived by the transport.
    pub fn request(&self, sender: ClientConnectionSender, can_write: bool, message: ReceivedMessage) {
        let _ = self.tx.send(MsgOrExit::Msg(ServerMessage::Request {
            sender,
            can_write,
            message,
        }));
    }

    /// Begin shutdown: pending bakes are aborted and drained, queued
    /// transfers dropped. The handle is inert afterwards.
    pub fn exit(&self) {
        let _ = self.tx.send(MsgOrExit::Exit);
    }
}

/// The state owned by the dispatch context.
pub struct AssetServer {
    pub(crate) blobs: BlobStore,
    pub(crate) mappings: MappingStore,
    pub(crate) bake: BakeCoordinator,
    pub(crate) transfer: TransferPool,
}

/// Guard that puts the image library's compression toggles back, each
/// category from its own saved value, when dropped. Created the moment
/// the toggles are forced on and then handed from the starter to the
/// dispatch task, so it fires on whichever path tears the server down,
/// including a starter that is dropped without ever being started.
type CompressionRestore = ScopeGuard<(Arc<dyn TextureBaker>, CompressionSettings), RestoreFn>;

type RestoreFn = fn((Arc<dyn TextureBaker>, CompressionSettings));

fn compression_restore(texture_baker: Arc<dyn TextureBaker>, saved: CompressionSettings) -> CompressionRestore {
    fn restore((baker, saved): (Arc<dyn TextureBaker>, CompressionSettings)) {
        baker.set_compression_settings(saved);
    }
    scopeguard::guard((texture_baker, saved), restore as RestoreFn)
}

/// Everything needed to run the dispatch loop; produced by
/// [`AssetServer::open`] and consumed by [`AssetServerStarter::start`].
pub struct AssetServerStarter {
    server: AssetServer,
    rx: mpsc::UnboundedReceiver<MsgOrExit<ServerMessage>>,
    bake_events: mpsc::UnboundedReceiver<BakeEvent>,
    upload_events: mpsc::UnboundedReceiver<UploadStored>,
    restore: CompressionRestore,
}

impl AssetServerStarter {
    pub fn start(self) -> JoinHandle<()> {
        let Self {
            server,
            rx,
            bake_events,
            upload_events,
            restore,
        } = self;
        tokio::spawn(run(server, rx, bake_events, upload_events, restore))
    }
}

impl AssetServer {
    /// Build the server and run the boot sequence: directory layout,
    /// mapping load, unmapped-blob cleanup and the initial bake pass.
    /// Any failure here is fatal to the assignment.
    ///
    /// Must be called within a tokio runtime; the worker pools spawn
    /// immediately.
    pub fn open(
        config: &AssetServerConfig,
        model_baker: Arc<dyn Baker>,
        texture_baker: Arc<dyn TextureBaker>,
    ) -> anyhow::Result<(AssetServerHandle, AssetServerStarter)> {
        // Process-wide image library state: remember what was set, force
        // compression on for the lifetime of this server. The guard
        // restores the saved values if anything below fails.
        let saved_compression = texture_baker.compression_settings();
        texture_baker.set_compression_settings(CompressionSettings::all_enabled());
        let restore = compression_restore(texture_baker.clone(), saved_compression);

        Self::open_inner(config, model_baker, texture_baker, restore)
    }

    fn open_inner(
        config: &AssetServerConfig,
        model_baker: Arc<dyn Baker>,
        texture_baker: Arc<dyn TextureBaker>,
        restore: CompressionRestore,
    ) -> anyhow::Result<(AssetServerHandle, AssetServerStarter)> {
        let resources_dir = &config.assets_path;
        fs::create_dir_all(resources_dir)
            .with_context(|| format!("could not create resources directory: {}", resources_dir.display()))?;

        let files_dir = resources_dir.join(ASSET_FILES_SUBDIR);
        let blobs = BlobStore::open(&files_dir).context("unable to create the asset files directory")?;
        let mappings = MappingStore::load(resources_dir).context("mapping file could not be loaded")?;
        log::info!("Serving files from: {}", files_dir.display());

        let (tx, rx) = mpsc::unbounded_channel();
        let (bake_tx, bake_events) = mpsc::unbounded_channel();
        let (upload_tx, upload_events) = mpsc::unbounded_channel();

        let transfer = TransferPool::spawn(
            blobs.clone(),
            config.max_upload_size,
            config.transfer_pool_size,
            upload_tx,
        );
        let bake = BakeCoordinator::new(model_baker, texture_baker, bake_tx);

        let mut server = AssetServer {
            blobs,
            mappings,
            bake,
            transfer,
        };

        server.cleanup_unmapped_files();
        server.bake_assets();

        Ok((
            AssetServerHandle { tx },
            AssetServerStarter {
                server,
                rx,
                bake_events,
                upload_events,
                restore,
            },
        ))
    }

    /// Delete every hash-named blob no mapping references, along with
    /// its baked subtree.
    fn cleanup_unmapped_files(&mut self) {
        log::info!("Performing unmapped asset cleanup");

        let files = match self.blobs.hash_named_files() {
            Ok(files) => files,
            Err(e) => {
                log::warn!("Unable to enumerate asset files for cleanup: {e}");
                return;
            }
        };

        for hash in files {
            if self.mappings.is_hash_referenced(&hash) {
                continue;
            }
            if self.blobs.delete(&hash) {
                log::debug!("Deleted {hash} from asset files directory since it is unmapped");
                self.remove_baked_paths_for_deleted_asset(&hash);
            } else {
                log::debug!("Attempt to delete unmapped file {hash} failed");
            }
        }
    }

    fn bake_assets(&mut self) {
        let mapped: Vec<(String, Hash)> = self.mappings.all().map(|(path, hash)| (path.to_owned(), hash)).collect();
        for (path, hash) in mapped {
            self.bake.maybe_bake(&self.mappings, &self.blobs, &path, hash);
        }
    }

    fn remove_baked_paths_for_deleted_asset(&mut self, hash: &Hash) {
        log::debug!("Deleting baked content below {} since {hash} was deleted", baked_folder_path(hash));
        if let Err(e) = self.delete_mappings_with_cascade(&[baked_folder_path(hash)]) {
            log::warn!("Failed to delete baked content for {hash}: {e}");
        }
    }

    /// Delete mappings, then keep garbage-collecting: every hash that
    /// lost its last reference loses its blob and its whole
    /// `/.baked/<hash>/` subtree, which may in turn free more hashes.
    pub(crate) fn delete_mappings_with_cascade(&mut self, paths: &[String]) -> Result<(), StoreError> {
        let mut unreferenced = self.mappings.delete_many(paths)?;

        while let Some(hash) = unreferenced.pop() {
            if self.blobs.delete(&hash) {
                log::debug!("Deleted {hash} from asset files directory since it is now unmapped");
            }
            let more = self.mappings.delete_many(&[baked_folder_path(&hash)])?;
            unreferenced.extend(more);
        }
        Ok(())
    }

    pub(crate) fn set_mapping(&mut self, path: &str, hash: Hash) -> AssetServerError {
        match self.mappings.set(path, hash) {
            Ok(()) => {
                self.bake.maybe_bake(&self.mappings, &self.blobs, path.trim(), hash);
                AssetServerError::NoError
            }
            Err(_) => AssetServerError::MappingOperationFailed,
        }
    }

    pub(crate) fn delete_mappings(&mut self, paths: &[String]) -> AssetServerError {
        match self.delete_mappings_with_cascade(paths) {
            Ok(()) => AssetServerError::NoError,
            Err(_) => AssetServerError::MappingOperationFailed,
        }
    }

    pub(crate) fn rename_mapping(&mut self, old_path: &str, new_path: &str) -> AssetServerError {
        match self.mappings.rename(old_path, new_path) {
            Ok(()) => AssetServerError::NoError,
            Err(_) => AssetServerError::MappingOperationFailed,
        }
    }

    pub(crate) fn get_mapping_reply(&mut self, message_id: MessageId, raw_path: &str) -> GetMappingReply {
        // the path arrives URL-shaped; only the query is meaningful
        // beyond the path itself
        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (raw_path, None),
        };

        let Some(hash) = self.mappings.get(path) else {
            return GetMappingReply::not_found(message_id);
        };

        let mut reply_hash = hash;
        let mut redirected_path = None;
        let mut baking_disabled = false;

        if let Some(baked_name) = self.bake.candidate_bake_file_name(path) {
            let baked_path = baked_mapping_path(&hash, baked_name);
            match self.mappings.get(&baked_path) {
                Some(baked_hash) if baked_hash != hash => {
                    log::debug!("Found baked version for: {hash} {path}");
                    reply_hash = baked_hash;
                    redirected_path = Some(baked_path);
                }
                Some(_) => {
                    log::debug!("Did not find baked version for: {hash} {path} (disabled)");
                    baking_disabled = true;
                }
                None => log::debug!("Did not find baked version for: {hash} {path}"),
            }
        }

        if redirected_path.is_none() && query_has_flag(query, "skybox") {
            // tagging a Get with ?skybox is how a texture opts into
            // baking: publish (empty) metadata for it, then see if a
            // bake is due
            if let Err(e) = meta_store::write_meta(&mut self.mappings, &self.blobs, &hash, &AssetMeta::default()) {
                log::warn!("Failed to write metafile for {hash}: {e}");
            }
            if !baking_disabled {
                self.bake.maybe_bake(&self.mappings, &self.blobs, path, hash);
            }
        }

        GetMappingReply {
            message_id,
            error: AssetServerError::NoError,
            hash: Some(reply_hash),
            redirected_path,
        }
    }

    pub(crate) fn get_all_mappings_reply(&self, message_id: MessageId) -> GetAllMappingsReply {
        let mappings = self
            .mappings
            .all()
            .map(|(path, hash)| {
                let (status, errors) = self.get_asset_status(path, &hash);
                MappingStatusEntry {
                    path: path.to_owned(),
                    hash,
                    status,
                    bake_errors: (status == BakingStatus::Error).then_some(errors),
                }
            })
            .collect();
        GetAllMappingsReply { message_id, mappings }
    }

    /// Derive the baking status of one mapping. Always recomputed from
    /// the map, the pending set and the metadata; never cached.
    pub(crate) fn get_asset_status(&self, path: &str, hash: &Hash) -> (BakingStatus, String) {
        if let Some(pending) = self.bake.pending_bake(hash) {
            let status = if pending.running {
                BakingStatus::Baking
            } else {
                BakingStatus::Pending
            };
            return (status, String::new());
        }

        if path.starts_with(HIDDEN_BAKED_FOLDER) {
            return (BakingStatus::Baked, String::new());
        }

        let Some(baked_name) = self.bake.bake_file_name(&self.mappings, path, hash) else {
            return (BakingStatus::Irrelevant, String::new());
        };

        match self.mappings.get(&baked_mapping_path(hash, baked_name)) {
            // the self-referencing sentinel means baking was disabled
            Some(baked_hash) if baked_hash == *hash => (BakingStatus::NotBaked, String::new()),
            Some(_) => (BakingStatus::Baked, String::new()),
            None => {
                let (loaded, meta) = meta_store::read_meta(&self.mappings, &self.blobs, hash);
                if loaded && meta.failed_last_bake {
                    (BakingStatus::Error, meta.last_bake_errors)
                } else {
                    (BakingStatus::Pending, String::new())
                }
            }
        }
    }

    pub(crate) fn set_baking_enabled(&mut self, paths: &[String], enabled: bool) -> AssetServerError {
        for path in paths {
            let Some(hash) = self.mappings.get(path) else { continue };
            let Some(baked_name) = self.bake.bake_file_name(&self.mappings, path, &hash) else {
                continue;
            };

            let baked_mapping = baked_mapping_path(&hash, baked_name);
            let currently_disabled = self.mappings.get(&baked_mapping) == Some(hash);

            if enabled && currently_disabled {
                if let Err(e) = self.delete_mappings_with_cascade(&[baked_mapping]) {
                    log::warn!("Failed to remove the baking-disabled marker for {path}: {e}");
                    continue;
                }
                self.bake.maybe_bake(&self.mappings, &self.blobs, path, hash);
                log::debug!("Enabled baking for {path}");
            } else if !enabled && !currently_disabled {
                self.remove_baked_paths_for_deleted_asset(&hash);
                if let Err(e) = self.mappings.set(&baked_mapping, hash) {
                    log::warn!("Failed to set the baking-disabled marker for {path}: {e}");
                    continue;
                }
                log::debug!("Disabled baking for {path}");
            }
        }
        AssetServerError::NoError
    }

    fn finish_upload(&mut self, upload: UploadStored) {
        let UploadStored {
            sender,
            message_id,
            result,
        } = upload;

        // the pool only stored the blob; what (if anything) becomes of
        // it in the namespace is decided here. Uploads publish no
        // mapping of their own: pairing a path with the hash is a
        // separate Set operation.
        let reply = match result {
            Ok(hash) => {
                log::debug!("Stored upload from {} as {hash}", sender.id);
                AssetUploadReply {
                    message_id,
                    error: AssetServerError::NoError,
                    hash: Some(hash),
                }
            }
            Err(error) => AssetUploadReply {
                message_id,
                error,
                hash: None,
            },
        };

        let mut out = Vec::new();
        reply.encode(&mut out);
        sender.send(ReplyMessage::new(MessageType::AssetUploadReply, out));
    }
}

fn query_has_flag(query: Option<&str>, flag: &str) -> bool {
    query.is_some_and(|query| {
        query
            .split('&')
            .any(|item| item == flag || item.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')))
    })
}

async fn run(
    mut server: AssetServer,
    mut rx: mpsc::UnboundedReceiver<MsgOrExit<ServerMessage>>,
    mut bake_events: mpsc::UnboundedReceiver<BakeEvent>,
    mut upload_events: mpsc::UnboundedReceiver<UploadStored>,
    restore: CompressionRestore,
) {
    // Whatever way this task ends, dropping the guard puts the image
    // library's compression toggles back to their captured values.
    let _restore = restore;

    loop {
        tokio::select! {
            Some(message) = rx.recv() => match message {
                MsgOrExit::Msg(ServerMessage::Request { sender, can_write, message }) => {
                    message_handlers::handle_message(&mut server, &sender, can_write, message);
                }
                MsgOrExit::Exit => break,
            },
            Some(event) = bake_events.recv() => {
                server.bake.handle_event(&mut server.mappings, &server.blobs, event);
            }
            Some(upload) = upload_events.recv() => server.finish_upload(upload),
            else => break,
        }
    }

    // shutdown: drop queued transfers, abort bakes in flight and stay
    // on the queue until every pending bake has acknowledged
    server.transfer.clear();
    server.bake.cancel_all();
    while !server.bake.is_idle() {
        match bake_events.recv().await {
            Some(event) => server.bake.handle_event(&mut server.mappings, &server.blobs, event),
            None => break,
        }
    }
}
