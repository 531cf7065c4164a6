use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{to_runtime_error, FinetuneError};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Which watermark a checkpoint tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Dev,
    Test,
}

impl CheckpointKind {
    pub fn suffix(self) -> &'static str {
        match self {
            CheckpointKind::Dev => "dev",
            CheckpointKind::Test => "test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// JSON sidecar written next to every weights file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub run_tag: String,
    pub kind: CheckpointKind,
    pub epoch: usize,
    pub score: f64,
    pub created_unix_timestamp: u64,
    pub tensors: usize,
    pub weights: FileRecord,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub weights_path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Writes `<dir>/<run_tag>_dev.safetensors` and `_test.safetensors`, overwriting in place.
#[derive(Debug)]
pub struct CheckpointWriter {
    dir: PathBuf,
    run_tag: String,
    dev_writes: usize,
    test_writes: usize,
}

impl CheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>, run_tag: impl Into<String>) -> Result<Self, FinetuneError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            FinetuneError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            run_tag: run_tag.into(),
            dev_writes: 0,
            test_writes: 0,
        })
    }

    pub fn weights_path(&self, kind: CheckpointKind) -> PathBuf {
        self.dir
            .join(format!("{}_{}.safetensors", self.run_tag, kind.suffix()))
    }

    pub fn manifest_path(&self, kind: CheckpointKind) -> PathBuf {
        manifest_path_for(&self.weights_path(kind))
    }

    pub fn writes(&self, kind: CheckpointKind) -> usize {
        match kind {
            CheckpointKind::Dev => self.dev_writes,
            CheckpointKind::Test => self.test_writes,
        }
    }

    /// Snapshots `params` and replaces the `kind` checkpoint.
    ///
    /// Weights and sidecar are each written to a temporary file and renamed
    /// into place, so readers never see a partial file.
    pub fn save(
        &mut self,
        params: &[(String, Var)],
        kind: CheckpointKind,
        epoch: usize,
        score: f64,
    ) -> Result<CheckpointDescriptor, FinetuneError> {
        let snapshot: HashMap<String, Tensor> = params
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect();

        let weights_path = self.weights_path(kind);
        let staging = staging_path(&weights_path);
        candle_core::safetensors::save(&snapshot, &staging).map_err(to_runtime_error)?;
        replace(&staging, &weights_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            run_tag: self.run_tag.clone(),
            kind,
            epoch,
            score,
            created_unix_timestamp: unix_timestamp(),
            tensors: snapshot.len(),
            weights: file_record(&weights_path)?,
        };
        let manifest_path = manifest_path_for(&weights_path);
        let staging = staging_path(&manifest_path);
        write_json(&staging, &manifest)?;
        replace(&staging, &manifest_path)?;

        match kind {
            CheckpointKind::Dev => self.dev_writes += 1,
            CheckpointKind::Test => self.test_writes += 1,
        }
        log::info!(
            "saved {} checkpoint at epoch {} (score {:.4}) to {}",
            kind.suffix(),
            epoch,
            score,
            weights_path.display()
        );

        Ok(CheckpointDescriptor {
            weights_path,
            manifest_path,
            manifest,
        })
    }
}

/// Reads the sidecar of `weights_path` and checks the weights against its digest.
pub fn verify_checkpoint(weights_path: &Path) -> Result<CheckpointManifest, FinetuneError> {
    let manifest_path = manifest_path_for(weights_path);
    if !manifest_path.is_file() {
        return Err(FinetuneError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(&manifest_path)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(FinetuneError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }
    validate_file(weights_path, &manifest.weights.sha256)?;
    Ok(manifest)
}

fn manifest_path_for(weights_path: &Path) -> PathBuf {
    weights_path.with_extension("json")
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn replace(from: &Path, to: &Path) -> Result<(), FinetuneError> {
    fs::rename(from, to).map_err(|err| {
        FinetuneError::runtime(format!(
            "failed to move {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, FinetuneError> {
    let metadata = fs::metadata(path).map_err(|err| {
        FinetuneError::runtime(format!("failed to stat {}: {err}", path.display()))
    })?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| FinetuneError::runtime(format!("invalid file name {}", path.display())))?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: metadata.len(),
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), FinetuneError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(FinetuneError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, FinetuneError> {
    let mut file = File::open(path).map_err(|err| {
        FinetuneError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            FinetuneError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FinetuneError> {
    let mut file = File::create(path).map_err(|err| {
        FinetuneError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| FinetuneError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| FinetuneError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, FinetuneError> {
    let file = File::open(path).map_err(|err| {
        FinetuneError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        FinetuneError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
