//! Checkpoint Persistence
//!
//! A checkpoint is a single little-endian binary file:
//!
//! ```text
//! "BAIKE_CKPT"                 10 bytes
//! version                      u8 (currently 2)
//! config length, config JSON   u32 + bytes (ModelConfig)
//! metadata length, JSON        u32 + bytes (CheckpointMetadata)
//! tensor count                 u32
//! per tensor:                  ndim u32, dims u32 × ndim, len u32, f32 × len
//! optimizer flag               u8 (version 2 and later)
//! if set:                      step u64, m tensors, v tensors
//! ```
//!
//! Tensors are written in the model's canonical parameter order, so a file
//! can be restored without knowing anything beyond its own header. Periodic
//! checkpoints carry the Adam moments so a run can resume where it stopped.
//!
//! [`CheckpointStore`] names files inside a save directory:
//! `{desc}-{n}.ckpt` for periodic saves and `{desc}-best.ckpt` for the best
//! validation score so far.

use crate::config::ModelConfig;
use crate::error::{Result, TrainError};
use crate::model::DualHeadModel;
use crate::optimizer::{AdamOptimizer, OptimizerState};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 10] = b"BAIKE_CKPT";
const VERSION: u8 = 2;

/// Training progress recorded alongside the weights
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub n_updates: usize,
    pub n_epochs: usize,
    /// Best validation perplexity seen so far
    pub best_score: Option<f32>,
}

/// Model weights, optional optimizer state, and training metadata
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub model: DualHeadModel,
    pub optimizer: Option<OptimizerState>,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    pub fn save(
        path: &Path,
        model: &DualHeadModel,
        optimizer: Option<&AdamOptimizer>,
        metadata: &CheckpointMetadata,
    ) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);

        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;
        write_json(&mut file, &model.config)?;
        write_json(&mut file, metadata)?;

        let params = model.parameters();
        file.write_all(&(params.len() as u32).to_le_bytes())?;
        for tensor in params {
            write_tensor(&mut file, tensor)?;
        }

        file.write_all(&[optimizer.is_some() as u8])?;
        if let Some(opt) = optimizer {
            file.write_all(&(opt.step as u64).to_le_bytes())?;
            for tensor in opt.m.iter().chain(&opt.v) {
                write_tensor(&mut file, tensor)?;
            }
        }
        file.flush()?;

        tracing::debug!(path = %path.display(), n_updates = metadata.n_updates, "checkpoint saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let (version, config, metadata) = read_header(&mut file, path)?;

        let count = read_u32(&mut file)? as usize;
        let tensors = (0..count)
            .map(|_| read_tensor(&mut file))
            .collect::<Result<Vec<_>>>()?;

        let mut flag = [0u8; 1];
        if version >= 2 {
            file.read_exact(&mut flag)?;
        }
        let optimizer = if flag[0] == 1 {
            let mut step = [0u8; 8];
            file.read_exact(&mut step)?;
            let mut moments = (0..2 * count)
                .map(|_| read_tensor(&mut file))
                .collect::<Result<Vec<_>>>()?;
            let v = moments.split_off(count);
            Some(OptimizerState {
                step: u64::from_le_bytes(step) as usize,
                m: moments,
                v,
            })
        } else {
            None
        };

        let model = DualHeadModel::from_parameters(&config, tensors)?;
        Ok(Self {
            model,
            optimizer,
            metadata,
        })
    }

    /// Read only the header, skipping the tensors
    pub fn read_metadata(path: &Path) -> Result<(ModelConfig, CheckpointMetadata)> {
        let mut file = BufReader::new(File::open(path)?);
        let (_, config, metadata) = read_header(&mut file, path)?;
        Ok((config, metadata))
    }
}

fn read_header<R: Read>(input: &mut R, path: &Path) -> Result<(u8, ModelConfig, CheckpointMetadata)> {
    let mut header = [0u8; 10];
    input.read_exact(&mut header)?;
    if &header != MAGIC {
        return Err(TrainError::Checkpoint(format!(
            "{} is not a checkpoint (bad header)",
            path.display()
        )));
    }
    let mut version = [0u8; 1];
    input.read_exact(&mut version)?;
    if version[0] == 0 || version[0] > VERSION {
        return Err(TrainError::Checkpoint(format!(
            "unsupported checkpoint version {}",
            version[0]
        )));
    }

    let config: ModelConfig = read_json(input)?;
    let metadata: CheckpointMetadata = read_json(input)?;
    Ok((version[0], config, metadata))
}

fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    out.write_all(&(bytes.len() as u32).to_le_bytes())?;
    out.write_all(&bytes)?;
    Ok(())
}

fn write_tensor<W: Write>(out: &mut W, tensor: &Tensor) -> Result<()> {
    out.write_all(&(tensor.shape.len() as u32).to_le_bytes())?;
    for &dim in &tensor.shape {
        out.write_all(&(dim as u32).to_le_bytes())?;
    }
    out.write_all(&(tensor.data.len() as u32).to_le_bytes())?;
    for &val in &tensor.data {
        out.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_json<R: Read, T: for<'de> Deserialize<'de>>(input: &mut R) -> Result<T> {
    let len = read_u32(input)? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_tensor<R: Read>(input: &mut R) -> Result<Tensor> {
    let ndim = read_u32(input)? as usize;
    let shape = (0..ndim)
        .map(|_| read_u32(input).map(|d| d as usize))
        .collect::<Result<Vec<_>>>()?;
    let len = read_u32(input)? as usize;
    if shape.iter().product::<usize>() != len {
        return Err(TrainError::Checkpoint(format!(
            "tensor of shape {:?} cannot hold {} values",
            shape, len
        )));
    }

    let mut bytes = vec![0u8; len * 4];
    input.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}

/// Names and finds checkpoints for one run
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    desc: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, desc: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            desc: desc.into(),
        }
    }

    pub fn numbered_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}-{}.ckpt", self.desc, n))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}-best.ckpt", self.desc))
    }

    /// Save a resumable checkpoint tagged with the update count
    pub fn save_numbered(
        &self,
        model: &DualHeadModel,
        optimizer: &AdamOptimizer,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.numbered_path(metadata.n_updates);
        Checkpoint::save(&path, model, Some(optimizer), metadata)?;
        Ok(path)
    }

    /// Overwrite the best-so-far checkpoint (weights only)
    pub fn save_best(&self, model: &DualHeadModel, metadata: &CheckpointMetadata) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.best_path();
        Checkpoint::save(&path, model, None, metadata)?;
        Ok(path)
    }

    /// Validation score recorded in the best checkpoint, if one exists
    pub fn best_score(&self) -> Result<Option<f32>> {
        let path = self.best_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Checkpoint::read_metadata(&path)?.1.best_score)
    }

    /// Highest-numbered periodic checkpoint, if any
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let prefix = format!("{}-", self.desc);
        let mut best: Option<usize> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let n = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".ckpt"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(n) = n {
                best = Some(best.map_or(n, |b| b.max(n)));
            }
        }
        Ok(best.map(|n| self.numbered_path(n)))
    }

    pub fn restore(&self, path: &Path) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::load(path)?;
        tracing::info!(
            path = %path.display(),
            n_updates = checkpoint.metadata.n_updates,
            "restored checkpoint"
        );
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::encoder::BatchEncoder;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("baike-gpt-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_roundtrip_preserves_outputs() {
        let dir = scratch_dir("ckpt-roundtrip");
        let config = ModelConfig::tiny(10);
        let model = DualHeadModel::new(&config, 11);
        let store = CheckpointStore::new(&dir, "small");
        let metadata = CheckpointMetadata {
            n_updates: 7,
            n_epochs: 1,
            best_score: Some(12.5),
        };
        let path = store.save_best(&model, &metadata).unwrap();

        let restored = store.restore(&path).unwrap();
        assert_eq!(restored.metadata, metadata);
        assert_eq!(restored.model.config, config);
        assert!(restored.optimizer.is_none());
        assert_eq!(store.best_score().unwrap(), Some(12.5));

        let encoder = BatchEncoder::from_config(&config).unwrap();
        let batch = encoder.encode(&[vec![1, 2]], &[vec![3]], &[vec![4, 5]]);
        let (a, _) = model.forward(&batch, None);
        let (b, _) = restored.model.forward(&batch, None);
        assert_eq!(a.clf_logits, b.clf_logits);
        assert_eq!(a.lm_losses, b.lm_losses);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_latest_picks_highest_update() {
        let dir = scratch_dir("ckpt-latest");
        let model = DualHeadModel::new(&ModelConfig::tiny(5), 1);
        let optimizer = AdamOptimizer::new(&model, &TrainingConfig::default());
        let store = CheckpointStore::new(&dir, "run");
        assert!(store.latest().unwrap().is_none());
        assert!(store.best_score().unwrap().is_none());

        for n in [3, 12, 9] {
            let metadata = CheckpointMetadata {
                n_updates: n,
                ..Default::default()
            };
            store.save_numbered(&model, &optimizer, &metadata).unwrap();
        }
        store.save_best(&model, &CheckpointMetadata::default()).unwrap();
        assert_eq!(store.latest().unwrap(), Some(store.numbered_path(12)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_numbered_checkpoint_keeps_optimizer_state() {
        let dir = scratch_dir("ckpt-optimizer");
        let config = ModelConfig::tiny(6);
        let model = DualHeadModel::new(&config, 3);
        let mut optimizer = AdamOptimizer::new(&model, &TrainingConfig::default());
        optimizer.step = 42;
        optimizer.m[0].data[1] = 0.5;
        optimizer.v[2].data[0] = 0.25;

        let store = CheckpointStore::new(&dir, "run");
        let metadata = CheckpointMetadata {
            n_updates: 42,
            n_epochs: 2,
            best_score: Some(30.0),
        };
        let path = store.save_numbered(&model, &optimizer, &metadata).unwrap();

        let restored = Checkpoint::load(&path).unwrap();
        let state = restored.optimizer.unwrap();
        assert_eq!(state.step, 42);
        assert_eq!(state.m, optimizer.m);
        assert_eq!(state.v, optimizer.v);
        assert_eq!(restored.model.parameters(), model.parameters());
        assert_eq!(Checkpoint::read_metadata(&path).unwrap(), (config, metadata));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = scratch_dir("ckpt-foreign");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("junk.ckpt");
        std::fs::write(&path, b"NOT_A_CHECKPOINT_AT_ALL").unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(TrainError::Checkpoint(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
