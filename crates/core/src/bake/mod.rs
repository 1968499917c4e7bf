//! Deciding what gets baked, running at most one bake at a time, and
//! folding the results back into the namespace.

pub mod baker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use atp_lib::hash::Hash;
use atp_lib::path::path_extension;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::meta_store::{has_meta, read_meta, write_meta, AssetMeta};
use crate::db::{baked_mapping_path, BlobStore, MappingStore, HIDDEN_BAKED_FOLDER};
use crate::error::BakeError;
use self::baker::{BakeFailure, Baker, TextureBaker};

/// Recorded into an asset's metadata on a successful bake.
pub const CURRENT_BAKE_VERSION: u32 = 1;

pub const BAKEABLE_MODEL_EXTENSIONS: &[&str] = &["fbx"];

/// Canonical names for baked outputs. Using fixed names (instead of the
/// output's own file name) lets two sources with identical baked bytes
/// share a blob.
pub const BAKED_MODEL_SIMPLE_NAME: &str = "asset.fbx";
pub const BAKED_TEXTURE_SIMPLE_NAME: &str = "texture.ktx";

/// Signal from the bake pool back to the dispatch context. Workers
/// never touch the stores themselves.
#[derive(Debug)]
pub enum BakeEvent {
    Started {
        hash: Hash,
    },
    Completed {
        hash: Hash,
        path: String,
        /// Owns the scratch directory; dropped (and thus deleted) once
        /// the outputs have been copied out.
        scratch: TempDir,
        outputs: Vec<PathBuf>,
    },
    Failed {
        hash: Hash,
        path: String,
        errors: String,
    },
    Aborted {
        hash: Hash,
        path: String,
    },
}

struct BakeJob {
    hash: Hash,
    path: String,
    source_file: PathBuf,
    baker: Arc<dyn Baker>,
    cancel: CancellationToken,
}

/// The single-worker pool bakes run on. Jobs are processed strictly one
/// at a time, in submission order.
struct BakePool {
    tx: mpsc::UnboundedSender<BakeJob>,
}

impl BakePool {
    fn spawn(events: mpsc::UnboundedSender<BakeEvent>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BakeJob>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if job.cancel.is_cancelled() {
                    let _ = events.send(BakeEvent::Aborted {
                        hash: job.hash,
                        path: job.path,
                    });
                    continue;
                }

                if events.send(BakeEvent::Started { hash: job.hash }).is_err() {
                    break;
                }

                let BakeJob {
                    hash,
                    path,
                    source_file,
                    baker,
                    cancel,
                } = job;

                let baked = tokio::task::spawn_blocking(move || {
                    let scratch = TempDir::with_prefix("bake")?;
                    let outputs = baker.bake(&source_file, scratch.path(), &cancel);
                    Ok::<_, std::io::Error>((scratch, outputs))
                })
                .await;

                let event = match baked {
                    Ok(Ok((scratch, Ok(outputs)))) => BakeEvent::Completed {
                        hash,
                        path,
                        scratch,
                        outputs,
                    },
                    Ok(Ok((_scratch, Err(BakeFailure::Aborted)))) => BakeEvent::Aborted { hash, path },
                    Ok(Ok((_scratch, Err(BakeFailure::Failed(errors))))) => BakeEvent::Failed { hash, path, errors },
                    Ok(Err(e)) => BakeEvent::Failed {
                        hash,
                        path,
                        errors: format!("Failed to create bake scratch directory: {e}"),
                    },
                    Err(e) => BakeEvent::Failed {
                        hash,
                        path,
                        errors: format!("Baker panicked: {e}"),
                    },
                };

                if events.send(event).is_err() {
                    break;
                }
            }
        });

        Self { tx }
    }

    fn submit(&self, job: BakeJob) {
        if self.tx.send(job).is_err() {
            log::warn!("Bake pool is shut down; dropping bake job");
        }
    }
}

pub struct PendingBake {
    pub path: String,
    pub running: bool,
    cancel: CancellationToken,
}

/// Owns the set of in-flight and queued bakes, keyed by source hash.
/// Lives on the dispatch context; the pool only ever reports back via
/// [`BakeEvent`]s.
pub struct BakeCoordinator {
    pending: HashMap<Hash, PendingBake>,
    pool: BakePool,
    model_baker: Arc<dyn Baker>,
    texture_baker: Arc<dyn TextureBaker>,
    texture_extensions: Vec<String>,
}

impl BakeCoordinator {
    pub fn new(
        model_baker: Arc<dyn Baker>,
        texture_baker: Arc<dyn TextureBaker>,
        events: mpsc::UnboundedSender<BakeEvent>,
    ) -> Self {
        let texture_extensions = texture_baker.supported_extensions();
        log::debug!("Supported baking texture formats: {texture_extensions:?}");

        Self {
            pending: HashMap::new(),
            pool: BakePool::spawn(events),
            model_baker,
            texture_baker,
            texture_extensions,
        }
    }

    pub fn pending_bake(&self, hash: &Hash) -> Option<&PendingBake> {
        self.pending.get(hash)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// The baked file name this path's extension maps to, ignoring
    /// whether the asset has opted in. This is the variant the redirect
    /// check wants: a published baked mapping is served no matter how
    /// it came to exist.
    pub fn candidate_bake_file_name(&self, path: &str) -> Option<&'static str> {
        let ext = path_extension(path)?;
        if BAKEABLE_MODEL_EXTENSIONS.contains(&ext.as_str()) {
            Some(BAKED_MODEL_SIMPLE_NAME)
        } else if self.texture_extensions.iter().any(|e| *e == ext) {
            Some(BAKED_TEXTURE_SIMPLE_NAME)
        } else {
            None
        }
    }

    /// The baked file name for a mapping that is actually eligible for
    /// baking. Models always are; textures only once a meta mapping
    /// exists (the skybox opt-in).
    pub fn bake_file_name(&self, mappings: &MappingStore, path: &str, hash: &Hash) -> Option<&'static str> {
        let name = self.candidate_bake_file_name(path)?;
        if name == BAKED_TEXTURE_SIMPLE_NAME && !has_meta(mappings, hash) {
            return None;
        }
        Some(name)
    }

    pub fn needs_to_be_baked(&self, mappings: &MappingStore, blobs: &BlobStore, path: &str, hash: &Hash) -> bool {
        if path.starts_with(HIDDEN_BAKED_FOLDER) {
            return false;
        }

        // TODO: allow assets whose bake failed under an older
        // CURRENT_BAKE_VERSION to be retried after a baker upgrade
        let (loaded, meta) = read_meta(mappings, blobs, hash);
        if loaded && meta.failed_last_bake {
            return false;
        }

        let Some(baked_name) = self.bake_file_name(mappings, path, hash) else {
            return false;
        };
        !mappings.contains(&baked_mapping_path(hash, baked_name))
    }

    pub fn maybe_bake(&mut self, mappings: &MappingStore, blobs: &BlobStore, path: &str, hash: Hash) {
        if self.needs_to_be_baked(mappings, blobs, path, &hash) {
            log::debug!("Queuing bake of: {path}");
            self.schedule(hash, path, blobs.path_for(&hash));
        }
    }

    /// Enqueue a bake of `hash`, reading from `source_file`. A no-op if
    /// a bake for this hash is already queued or running.
    pub fn schedule(&mut self, hash: Hash, path: &str, source_file: PathBuf) {
        if self.pending.contains_key(&hash) {
            log::debug!("Bake of {hash} already in queue");
            return;
        }

        log::debug!("Starting bake for: {path} {hash}");
        let cancel = CancellationToken::new();
        let baker: Arc<dyn Baker> = match self.candidate_bake_file_name(path) {
            Some(BAKED_MODEL_SIMPLE_NAME) => self.model_baker.clone(),
            _ => self.texture_baker.clone(),
        };

        self.pending.insert(
            hash,
            PendingBake {
                path: path.to_owned(),
                running: false,
                cancel: cancel.clone(),
            },
        );
        self.pool.submit(BakeJob {
            hash,
            path: path.to_owned(),
            source_file,
            baker,
            cancel,
        });
    }

    /// Consume one signal from the pool, updating stores and the
    /// pending set. Runs on the dispatch context.
    pub fn handle_event(&mut self, mappings: &mut MappingStore, blobs: &BlobStore, event: BakeEvent) {
        match event {
            BakeEvent::Started { hash } => {
                if let Some(pending) = self.pending.get_mut(&hash) {
                    pending.running = true;
                }
            }
            BakeEvent::Completed {
                hash,
                path,
                scratch,
                outputs,
            } => {
                log::debug!("Completing bake for {hash}");
                let published = self.publish_outputs(mappings, blobs, &hash, &path, &outputs);
                drop(scratch);

                let meta = match published {
                    Ok(()) => AssetMeta {
                        bake_version: CURRENT_BAKE_VERSION,
                        failed_last_bake: false,
                        last_bake_errors: String::new(),
                    },
                    Err(e) => {
                        log::warn!("Could not complete bake for {hash}: {e}");
                        AssetMeta {
                            bake_version: CURRENT_BAKE_VERSION,
                            failed_last_bake: true,
                            last_bake_errors: e.to_string(),
                        }
                    }
                };
                if let Err(e) = write_meta(mappings, blobs, &hash, &meta) {
                    log::warn!("Failed to write metafile for {hash}: {e}");
                }
                self.pending.remove(&hash);
            }
            BakeEvent::Failed { hash, path, errors } => {
                log::warn!("Bake failed for {path} {hash}: {errors}");
                let (_, mut meta) = read_meta(mappings, blobs, &hash);
                meta.failed_last_bake = true;
                meta.last_bake_errors = errors;
                if let Err(e) = write_meta(mappings, blobs, &hash, &meta) {
                    log::warn!("Failed to write metafile for {hash}: {e}");
                }
                self.pending.remove(&hash);
            }
            BakeEvent::Aborted { hash, path } => {
                log::debug!("Bake aborted for {path} {hash}");
                self.pending.remove(&hash);
            }
        }
    }

    fn publish_outputs(
        &self,
        mappings: &mut MappingStore,
        blobs: &BlobStore,
        source_hash: &Hash,
        source_path: &str,
        outputs: &[PathBuf],
    ) -> Result<(), BakeError> {
        for output in outputs {
            let baked_hash = blobs
                .put_file(output)
                .map_err(|_| BakeError::StoreOutput(output.clone()))?;

            let file_name = output
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| BakeError::StoreOutput(output.clone()))?;

            // canonicalize the mapped name so identical baked outputs of
            // differently named sources end up sharing one mapping shape
            let relative_name = if file_name.to_ascii_lowercase().ends_with(".fbx") {
                BAKED_MODEL_SIMPLE_NAME
            } else if !source_path.to_ascii_lowercase().ends_with(".fbx") {
                BAKED_TEXTURE_SIMPLE_NAME
            } else {
                file_name
            };

            let bake_mapping = baked_mapping_path(source_hash, relative_name);
            mappings
                .set(&bake_mapping, baked_hash)
                .map_err(|_| BakeError::PublishMapping(bake_mapping.clone()))?;
            log::debug!("Added {bake_mapping} for bake file {baked_hash} from bake of {source_hash}");
        }
        Ok(())
    }

    /// Ask every pending bake to stop. The dispatch loop keeps feeding
    /// events to [`Self::handle_event`] until [`Self::is_idle`].
    pub fn cancel_all(&mut self) {
        for (hash, pending) in &self.pending {
            log::debug!("Aborting bake of {} {hash}", pending.path);
            pending.cancel.cancel();
        }
    }
}
