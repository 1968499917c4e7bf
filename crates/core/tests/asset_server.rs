//! End-to-end tests driving the server through its public dispatch
//! handle, the same way the transport glue does.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atp::bake::baker::{BakeFailure, BakeResult, Baker, CompressionSettings, TextureBaker};
use atp::client::{ClientActorId, ClientConnectionSender, ReceivedMessage, ReplyMessage};
use atp::config::AssetServerConfig;
use atp::server::{AssetServer, AssetServerHandle};
use atp_client_api_messages::mapping::{
    GetAllMappingsReply, GetMappingReply, MappingOperation, MappingOperationRequest, SimpleMappingReply,
};
use atp_client_api_messages::transfer::{
    AssetGetInfoReply, AssetGetInfoRequest, AssetGetReply, AssetGetRequest, AssetUploadReply, AssetUploadRequest,
};
use atp_client_api_messages::{AssetServerError, BakingStatus, MessageType};
use atp_lib::hash::{hash_bytes, Hash};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Model baker that holds its output until the test releases it, so
/// pre-bake and post-bake states can both be observed deterministically.
struct GatedModelBaker {
    release: Arc<AtomicBool>,
}

impl Baker for GatedModelBaker {
    fn bake(&self, source: &Path, scratch_dir: &Path, cancel: &tokio_util::sync::CancellationToken) -> BakeResult {
        while !self.release.load(Ordering::SeqCst) {
            if cancel.is_cancelled() {
                return Err(BakeFailure::Aborted);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let source_bytes = fs::read(source).map_err(|e| BakeFailure::Failed(e.to_string()))?;
        let output = scratch_dir.join("out.baked.fbx");
        fs::write(&output, [b"baked:".as_slice(), &source_bytes].concat())
            .map_err(|e| BakeFailure::Failed(e.to_string()))?;
        Ok(vec![output])
    }
}

struct FailingModelBaker;

impl Baker for FailingModelBaker {
    fn bake(&self, _source: &Path, _scratch_dir: &Path, _cancel: &tokio_util::sync::CancellationToken) -> BakeResult {
        Err(BakeFailure::Failed("model geometry is degenerate".into()))
    }
}

struct TestTextureBaker {
    compression: Mutex<CompressionSettings>,
}

impl TestTextureBaker {
    fn new(initial: CompressionSettings) -> Self {
        Self {
            compression: Mutex::new(initial),
        }
    }
}

impl Baker for TestTextureBaker {
    fn bake(&self, source: &Path, scratch_dir: &Path, _cancel: &tokio_util::sync::CancellationToken) -> BakeResult {
        let source_bytes = fs::read(source).map_err(|e| BakeFailure::Failed(e.to_string()))?;
        let output = scratch_dir.join("out.ktx");
        fs::write(&output, [b"ktx:".as_slice(), &source_bytes].concat())
            .map_err(|e| BakeFailure::Failed(e.to_string()))?;
        Ok(vec![output])
    }
}

impl TextureBaker for TestTextureBaker {
    fn supported_extensions(&self) -> Vec<String> {
        vec!["png".to_owned(), "jpg".to_owned()]
    }

    fn compression_settings(&self) -> CompressionSettings {
        *self.compression.lock().unwrap()
    }

    fn set_compression_settings(&self, settings: CompressionSettings) {
        *self.compression.lock().unwrap() = settings;
    }
}

struct Harness {
    handle: AssetServerHandle,
    join: JoinHandle<()>,
    sender: ClientConnectionSender,
    replies: mpsc::UnboundedReceiver<ReplyMessage>,
    release_bakes: Arc<AtomicBool>,
    _tmp_dir: TempDir,
    assets_path: std::path::PathBuf,
}

fn start_with_model_baker(model_baker: Arc<dyn Baker>) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let tmp_dir = TempDir::with_prefix("asset_server_test").unwrap();
    let assets_path = tmp_dir.path().join("assets");
    let config = AssetServerConfig::with_assets_path(&assets_path);

    let release_bakes = Arc::new(AtomicBool::new(true));
    let texture_baker = Arc::new(TestTextureBaker::new(CompressionSettings::all_enabled()));

    let (handle, starter) = AssetServer::open(&config, model_baker, texture_baker).unwrap();
    let join = starter.start();

    let (sender, replies) = ClientConnectionSender::dummy_with_channel(ClientActorId {
        identity: Uuid::new_v4(),
        name: 1,
    });

    Harness {
        handle,
        join,
        sender,
        replies,
        release_bakes,
        _tmp_dir: tmp_dir,
        assets_path,
    }
}

fn start() -> Harness {
    let release = Arc::new(AtomicBool::new(true));
    let mut harness = start_with_model_baker(Arc::new(GatedModelBaker {
        release: release.clone(),
    }));
    harness.release_bakes = release;
    harness
}

impl Harness {
    async fn recv(&mut self, expected: MessageType) -> ReplyMessage {
        let reply = timeout(RECV_TIMEOUT, self.replies.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed");
        assert_eq!(reply.message_type, expected);
        reply
    }

    async fn mapping_op(&mut self, can_write: bool, op: MappingOperation) -> ReplyMessage {
        let mut payload = Vec::new();
        MappingOperationRequest { message_id: 1, op }.encode(&mut payload);
        self.handle.request(
            self.sender.clone(),
            can_write,
            ReceivedMessage {
                message_type: MessageType::AssetMappingOperation,
                payload: payload.into(),
            },
        );
        self.recv(MessageType::AssetMappingOperationReply).await
    }

    async fn get_mapping(&mut self, path: &str) -> GetMappingReply {
        let reply = self
            .mapping_op(false, MappingOperation::Get { path: path.to_owned() })
            .await;
        GetMappingReply::decode(&mut &reply.payload[..]).unwrap()
    }

    async fn get_all(&mut self) -> GetAllMappingsReply {
        let reply = self.mapping_op(false, MappingOperation::GetAll).await;
        GetAllMappingsReply::decode(&mut &reply.payload[..]).unwrap()
    }

    async fn simple_op(&mut self, can_write: bool, op: MappingOperation) -> AssetServerError {
        let reply = self.mapping_op(can_write, op).await;
        SimpleMappingReply::decode(&mut &reply.payload[..]).unwrap().error
    }

    async fn set_mapping(&mut self, path: &str, hash: Hash) -> AssetServerError {
        self.simple_op(
            true,
            MappingOperation::Set {
                path: path.to_owned(),
                hash,
            },
        )
        .await
    }

    async fn upload(&mut self, can_write: bool, data: &[u8]) -> AssetUploadReply {
        let mut payload = Vec::new();
        AssetUploadRequest {
            message_id: 2,
            data: data.to_vec().into(),
        }
        .encode(&mut payload);
        self.handle.request(
            self.sender.clone(),
            can_write,
            ReceivedMessage {
                message_type: MessageType::AssetUpload,
                payload: payload.into(),
            },
        );
        let reply = self.recv(MessageType::AssetUploadReply).await;
        AssetUploadReply::decode(&mut &reply.payload[..]).unwrap()
    }

    async fn get_info(&mut self, hash: Hash) -> AssetGetInfoReply {
        let mut payload = Vec::new();
        AssetGetInfoRequest { message_id: 3, hash }.encode(&mut payload);
        self.handle.request(
            self.sender.clone(),
            false,
            ReceivedMessage {
                message_type: MessageType::AssetGetInfo,
                payload: payload.into(),
            },
        );
        let reply = self.recv(MessageType::AssetGetInfoReply).await;
        AssetGetInfoReply::decode(&mut &reply.payload[..]).unwrap()
    }

    async fn get_asset(&mut self, hash: Hash, start: u64, end: u64) -> AssetGetReply {
        let mut payload = Vec::new();
        AssetGetRequest {
            message_id: 4,
            hash,
            start,
            end,
        }
        .encode(&mut payload);
        self.handle.request(
            self.sender.clone(),
            false,
            ReceivedMessage {
                message_type: MessageType::AssetGet,
                payload: payload.into(),
            },
        );
        let reply = self.recv(MessageType::AssetGetReply).await;
        AssetGetReply::decode(&mut &reply.payload[..]).unwrap()
    }

    /// Poll `path` until the server serves a baked redirect for it.
    async fn wait_for_redirect(&mut self, path: &str) -> GetMappingReply {
        for _ in 0..200 {
            let reply = self.get_mapping(path).await;
            if reply.redirected_path.is_some() {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("bake of {path} never produced a redirect");
    }

    async fn wait_for_status(&mut self, path: &str, status: BakingStatus) -> GetAllMappingsReply {
        for _ in 0..200 {
            let all = self.get_all().await;
            if all
                .mappings
                .iter()
                .any(|entry| entry.path == path && entry.status == status)
            {
                return all;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{path} never reached {status:?}");
    }

    async fn shutdown(mut self) {
        self.replies.close();
        self.handle.exit();
        timeout(RECV_TIMEOUT, self.join).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_upload_and_fetch() {
    let mut harness = start();

    let reply = harness.upload(true, b"abc").await;
    assert_eq!(reply.error, AssetServerError::NoError);
    let hash = reply.hash.unwrap();
    assert_eq!(
        hash.to_hex(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );

    let info = harness.get_info(hash).await;
    assert_eq!(info.error, AssetServerError::NoError);
    assert_eq!(info.size, Some(3));

    let data = harness.get_asset(hash, 0, 2).await;
    assert_eq!(data.error, AssetServerError::NoError);
    assert_eq!(&data.data[..], b"abc");

    let partial = harness.get_asset(hash, 1, 2).await;
    assert_eq!(&partial.data[..], b"bc");

    let bad_range = harness.get_asset(hash, 0, 3).await;
    assert_eq!(bad_range.error, AssetServerError::InvalidByteRange);

    let missing = harness.get_info(hash_bytes(b"never uploaded")).await;
    assert_eq!(missing.error, AssetServerError::AssetNotFound);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_upload_requires_write_capability() {
    let mut harness = start();

    let reply = harness.upload(false, b"abc").await;
    assert_eq!(reply.error, AssetServerError::PermissionDenied);
    assert_eq!(reply.hash, None);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_map_and_retrieve() {
    let mut harness = start();
    harness.release_bakes.store(false, Ordering::SeqCst);

    let hash = harness.upload(true, b"an fbx model").await.hash.unwrap();
    assert_eq!(harness.set_mapping("/a/b.fbx", hash).await, AssetServerError::NoError);

    let reply = harness.get_mapping("/a/b.fbx").await;
    assert_eq!(reply.error, AssetServerError::NoError);
    assert_eq!(reply.hash, Some(hash));
    assert_eq!(reply.redirected_path, None);

    let missing = harness.get_mapping("/nope.fbx").await;
    assert_eq!(missing.error, AssetServerError::AssetNotFound);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_bake_redirect_and_cascading_delete() {
    let mut harness = start();

    let source = b"an fbx model";
    let hash = harness.upload(true, source).await.hash.unwrap();
    assert_eq!(harness.set_mapping("/a/b.fbx", hash).await, AssetServerError::NoError);

    let reply = harness.wait_for_redirect("/a/b.fbx").await;
    let baked_hash = reply.hash.unwrap();
    assert_eq!(baked_hash, hash_bytes([b"baked:".as_slice(), source].concat()));
    assert_eq!(
        reply.redirected_path,
        Some(format!("/.baked/{hash}/asset.fbx"))
    );

    let all = harness.get_all().await;
    let entry = all.mappings.iter().find(|e| e.path == "/a/b.fbx").unwrap();
    assert_eq!(entry.status, BakingStatus::Baked);

    // the baked output is served like any other asset
    let info = harness.get_info(baked_hash).await;
    assert_eq!(info.error, AssetServerError::NoError);

    // deleting the source cascades: the source blob, the baked blob and
    // the whole /.baked/<hash>/ subtree all go away
    let error = harness
        .simple_op(true, MappingOperation::Delete {
            paths: vec!["/a/b.fbx".to_owned()],
        })
        .await;
    assert_eq!(error, AssetServerError::NoError);

    let gone = harness.get_mapping("/a/b.fbx").await;
    assert_eq!(gone.error, AssetServerError::AssetNotFound);
    assert_eq!(harness.get_info(hash).await.error, AssetServerError::AssetNotFound);
    assert_eq!(harness.get_info(baked_hash).await.error, AssetServerError::AssetNotFound);
    assert_eq!(harness.get_all().await.mappings.len(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_skybox_opt_in() {
    let mut harness = start();

    let source = b"png pixels";
    let hash = harness.upload(true, source).await.hash.unwrap();
    assert_eq!(harness.set_mapping("/sky.png", hash).await, AssetServerError::NoError);

    // a plain texture with no meta is not a bake candidate
    let all = harness.get_all().await;
    let entry = all.mappings.iter().find(|e| e.path == "/sky.png").unwrap();
    assert_eq!(entry.status, BakingStatus::Irrelevant);

    // tagging the Get opts it in
    let reply = harness.get_mapping("/sky.png?skybox").await;
    assert_eq!(reply.error, AssetServerError::NoError);
    assert_eq!(reply.hash, Some(hash));

    let reply = harness.wait_for_redirect("/sky.png").await;
    assert_eq!(
        reply.hash,
        Some(hash_bytes([b"ktx:".as_slice(), source].concat()))
    );
    assert_eq!(
        reply.redirected_path,
        Some(format!("/.baked/{hash}/texture.ktx"))
    );

    harness.wait_for_status("/sky.png", BakingStatus::Baked).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_bake_reports_error_status() {
    let mut harness = start_with_model_baker(Arc::new(FailingModelBaker));

    let hash = harness.upload(true, b"doomed model").await.hash.unwrap();
    assert_eq!(harness.set_mapping("/bad.fbx", hash).await, AssetServerError::NoError);

    let all = harness.wait_for_status("/bad.fbx", BakingStatus::Error).await;
    let entry = all.mappings.iter().find(|e| e.path == "/bad.fbx").unwrap();
    assert_eq!(
        entry.bake_errors.as_deref(),
        Some("model geometry is degenerate")
    );

    // the asset is still served in its original form
    let reply = harness.get_mapping("/bad.fbx").await;
    assert_eq!(reply.hash, Some(hash));
    assert_eq!(reply.redirected_path, None);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_persistence_rollback() {
    let mut harness = start();

    // wedge the map file so the next persist fails
    let map_file = harness.assets_path.join("map.json");
    let _ = fs::remove_file(&map_file);
    fs::create_dir(&map_file).unwrap();

    let error = harness.set_mapping("/x.png", hash_bytes(b"x")).await;
    assert_eq!(error, AssetServerError::MappingOperationFailed);

    let reply = harness.get_mapping("/x.png").await;
    assert_eq!(reply.error, AssetServerError::AssetNotFound);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_rename() {
    let mut harness = start();
    harness.release_bakes.store(false, Ordering::SeqCst);

    let hash = harness.upload(true, b"file").await.hash.unwrap();
    assert_eq!(harness.set_mapping("/dir/file.png", hash).await, AssetServerError::NoError);

    // folder-to-file rename fails and changes nothing
    let error = harness
        .simple_op(true, MappingOperation::Rename {
            old_path: "/dir/".to_owned(),
            new_path: "/file".to_owned(),
        })
        .await;
    assert_eq!(error, AssetServerError::MappingOperationFailed);
    assert_eq!(harness.get_mapping("/dir/file.png").await.hash, Some(hash));

    let error = harness
        .simple_op(true, MappingOperation::Rename {
            old_path: "/dir/".to_owned(),
            new_path: "/moved/".to_owned(),
        })
        .await;
    assert_eq!(error, AssetServerError::NoError);
    assert_eq!(harness.get_mapping("/dir/file.png").await.error, AssetServerError::AssetNotFound);
    assert_eq!(harness.get_mapping("/moved/file.png").await.hash, Some(hash));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_hidden_prefix_is_rejected_externally() {
    let mut harness = start();

    let hash = hash_bytes(b"whatever");
    let hidden_path = format!("/.baked/{hash}/asset.fbx");

    let error = harness
        .simple_op(true, MappingOperation::Set {
            path: hidden_path.clone(),
            hash,
        })
        .await;
    assert_eq!(error, AssetServerError::PermissionDenied);

    let error = harness
        .simple_op(true, MappingOperation::Rename {
            old_path: "/a.fbx".to_owned(),
            new_path: hidden_path,
        })
        .await;
    assert_eq!(error, AssetServerError::PermissionDenied);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_write_ops_require_capability() {
    let mut harness = start();

    let error = harness
        .simple_op(false, MappingOperation::Set {
            path: "/a.png".to_owned(),
            hash: hash_bytes(b"a"),
        })
        .await;
    assert_eq!(error, AssetServerError::PermissionDenied);

    let error = harness
        .simple_op(false, MappingOperation::Delete {
            paths: vec!["/a.png".to_owned()],
        })
        .await;
    assert_eq!(error, AssetServerError::PermissionDenied);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_set_baking_enabled() {
    let mut harness = start();

    let source = b"a model to toggle";
    let hash = harness.upload(true, source).await.hash.unwrap();
    assert_eq!(harness.set_mapping("/toggle.fbx", hash).await, AssetServerError::NoError);
    harness.wait_for_redirect("/toggle.fbx").await;

    // disabling clears the baked subtree and leaves the sentinel
    let error = harness
        .simple_op(true, MappingOperation::SetBakingEnabled {
            enabled: false,
            paths: vec!["/toggle.fbx".to_owned()],
        })
        .await;
    assert_eq!(error, AssetServerError::NoError);

    let reply = harness.get_mapping("/toggle.fbx").await;
    assert_eq!(reply.hash, Some(hash));
    assert_eq!(reply.redirected_path, None);
    harness.wait_for_status("/toggle.fbx", BakingStatus::NotBaked).await;

    // re-enabling bakes again
    let error = harness
        .simple_op(true, MappingOperation::SetBakingEnabled {
            enabled: true,
            paths: vec!["/toggle.fbx".to_owned()],
        })
        .await;
    assert_eq!(error, AssetServerError::NoError);
    harness.wait_for_redirect("/toggle.fbx").await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_dropping_unstarted_server_restores_compression() {
    let initial = CompressionSettings {
        color: false,
        grayscale: false,
        normal: true,
        cube: false,
    };

    let tmp_dir = TempDir::with_prefix("asset_server_test").unwrap();
    let config = AssetServerConfig::with_assets_path(tmp_dir.path().join("assets"));
    let texture_baker = Arc::new(TestTextureBaker::new(initial));

    let (handle, starter) = AssetServer::open(&config, Arc::new(FailingModelBaker), texture_baker.clone()).unwrap();
    assert_eq!(texture_baker.compression_settings(), CompressionSettings::all_enabled());

    // never started: dropping the starter must still put the toggles back
    drop(starter);
    assert_eq!(texture_baker.compression_settings(), initial);
    drop(handle);
}

#[tokio::test]
async fn test_shutdown_aborts_pending_bakes_and_restores_compression() {
    let initial = CompressionSettings {
        color: false,
        grayscale: true,
        normal: false,
        cube: true,
    };

    let tmp_dir = TempDir::with_prefix("asset_server_test").unwrap();
    let config = AssetServerConfig::with_assets_path(tmp_dir.path().join("assets"));
    let release = Arc::new(AtomicBool::new(false));
    let texture_baker = Arc::new(TestTextureBaker::new(initial));

    let (handle, starter) = AssetServer::open(
        &config,
        Arc::new(GatedModelBaker {
            release: release.clone(),
        }),
        texture_baker.clone(),
    )
    .unwrap();
    // while the server runs, compression is forced on
    assert_eq!(texture_baker.compression_settings(), CompressionSettings::all_enabled());
    let join = starter.start();

    let (sender, mut replies) = ClientConnectionSender::dummy_with_channel(ClientActorId {
        identity: Uuid::new_v4(),
        name: 1,
    });

    // park a bake on the (gated) baker, then shut down while it runs
    let mut payload = Vec::new();
    AssetUploadRequest {
        message_id: 1,
        data: b"stuck model".to_vec().into(),
    }
    .encode(&mut payload);
    handle.request(
        sender.clone(),
        true,
        ReceivedMessage {
            message_type: MessageType::AssetUpload,
            payload: payload.into(),
        },
    );
    let upload = timeout(RECV_TIMEOUT, replies.recv()).await.unwrap().unwrap();
    let hash = AssetUploadReply::decode(&mut &upload.payload[..]).unwrap().hash.unwrap();

    let mut payload = Vec::new();
    MappingOperationRequest {
        message_id: 2,
        op: MappingOperation::Set {
            path: "/stuck.fbx".to_owned(),
            hash,
        },
    }
    .encode(&mut payload);
    handle.request(
        sender,
        true,
        ReceivedMessage {
            message_type: MessageType::AssetMappingOperation,
            payload: payload.into(),
        },
    );
    let _ = timeout(RECV_TIMEOUT, replies.recv()).await.unwrap().unwrap();

    // never release the baker; shutdown must cancel it and return
    handle.exit();
    timeout(RECV_TIMEOUT, join).await.unwrap().unwrap();

    assert_eq!(texture_baker.compression_settings(), initial);
}
