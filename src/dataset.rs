//! Labeled image dataset with a stable, repeatable iteration order.
//!
//! The dataset is a JSON index (`[{ "file": ..., "label": ... }, ...]`)
//! next to one `.npy` array per image, `H x W x C`, either `u8` in
//! `[0, 255]` or floating point in `[0, 1]`.
use crate::error::AttackError;
use crate::AdvFloat;
use log::debug;
use ndarray::{s, Array1, Array3, Array4};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IndexEntry {
    pub file: String,
    pub label: usize,
}

/// One batch of images in `[0, 1]`, paired 1:1 by index with labels and the
/// original filenames. The last batch of a run may be short.
#[derive(Clone, Debug)]
pub struct Batch {
    pub images: Array4<AdvFloat>,
    pub labels: Array1<usize>,
    pub filenames: Vec<String>,
}

pub struct LabeledDataset {
    data_dir: PathBuf,
    entries: Vec<IndexEntry>,
}

impl LabeledDataset {
    /// # Errors
    /// `Resource` if the index cannot be read, `Configuration` if it does
    /// not parse.
    pub fn open(index_path: &Path, data_dir: &Path) -> Result<Self, AttackError> {
        let file = File::open(index_path).map_err(|e| AttackError::resource(index_path, e))?;
        let entries: Vec<IndexEntry> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                AttackError::configuration(format!(
                    "invalid dataset index {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
        debug!("dataset index lists {} images", entries.len());
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fixed-order batching; no shuffling.
    pub fn batches(&self, batch_size: usize) -> Batches {
        assert!(batch_size > 0);
        Batches {
            dataset: self,
            cursor: 0,
            batch_size,
        }
    }

    fn load_image(&self, file: &str) -> Result<Array3<AdvFloat>, AttackError> {
        let path = self.data_dir.join(file);
        let mut bytes = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| AttackError::resource(&path, e))?;

        // Accept u8 pixel data or already-scaled floating point.
        if let Ok(raw) = Array3::<u8>::read_npy(Cursor::new(&bytes)) {
            return Ok(raw.mapv(|v| AdvFloat::from(v) / 255.));
        }
        if let Ok(raw) = Array3::<f32>::read_npy(Cursor::new(&bytes)) {
            return Ok(raw.mapv(AdvFloat::from));
        }
        Array3::<AdvFloat>::read_npy(Cursor::new(&bytes)).map_err(|e| {
            AttackError::configuration(format!("invalid image file {}: {}", path.display(), e))
        })
    }
}

pub struct Batches<'a> {
    dataset: &'a LabeledDataset,
    cursor: usize,
    batch_size: usize,
}

impl Batches<'_> {
    fn assemble(&self, entries: &[IndexEntry]) -> Result<Batch, AttackError> {
        let first = self.dataset.load_image(&entries[0].file)?;
        let (height, width, channels) = first.dim();
        let mut images = Array4::<AdvFloat>::zeros((entries.len(), channels, height, width));
        for (i, entry) in entries.iter().enumerate() {
            let hwc = if i == 0 {
                first.clone()
            } else {
                self.dataset.load_image(&entry.file)?
            };
            if hwc.dim() != (height, width, channels) {
                return Err(AttackError::shape(
                    "image batch",
                    format!("{:?}", (height, width, channels)),
                    format!("{:?}", hwc.dim()),
                ));
            }
            images
                .slice_mut(s![i, .., .., ..])
                .assign(&hwc.view().permuted_axes([2, 0, 1]));
        }
        Ok(Batch {
            images,
            labels: entries.iter().map(|e| e.label).collect(),
            filenames: entries.iter().map(|e| e.file.clone()).collect(),
        })
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch, AttackError>;

    fn next(&mut self) -> Option<Self::Item> {
        let dataset = self.dataset;
        if self.cursor >= dataset.entries.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(dataset.entries.len());
        let entries = &dataset.entries[self.cursor..end];
        self.cursor = end;
        Some(self.assemble(entries))
    }
}
