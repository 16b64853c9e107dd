//! Output boundary: 8-bit image emission under the original filenames.
use crate::error::AttackError;
use crate::AdvFloat;
use log::debug;
use ndarray::{Array3, Array4};
use ndarray_npy::write_npy;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ImageEmitter {
    dir: PathBuf,
}

impl ImageEmitter {
    /// Creates the output directory eagerly so an unwritable path fails the
    /// run before any optimization happens.
    ///
    /// # Errors
    /// `Resource` if the directory cannot be created.
    pub fn create(dir: &Path) -> Result<Self, AttackError> {
        fs::create_dir_all(dir).map_err(|e| AttackError::resource(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rounds a `[0, 1]` batch to 8-bit `H x W x C` arrays and writes one
    /// `.npy` file per image under its original filename.
    ///
    /// # Errors
    /// `Shape` if filenames and images disagree, `Resource` on any write
    /// failure (the run halts; there is no silent skip).
    pub fn emit(
        &self,
        images: &Array4<AdvFloat>,
        filenames: &[String],
    ) -> Result<(), AttackError> {
        let (batch, channels, height, width) = images.dim();
        if filenames.len() != batch {
            return Err(AttackError::shape("emission batch", batch, filenames.len()));
        }
        for (i, filename) in filenames.iter().enumerate() {
            let mut pixels = Array3::<u8>::zeros((height, width, channels));
            for y in 0..height {
                for x in 0..width {
                    for c in 0..channels {
                        let v = (images[[i, c, y, x]] * 255.).round();
                        pixels[[y, x, c]] = v.clamp(0., 255.) as u8;
                    }
                }
            }
            let path = self.dir.join(filename);
            write_npy(&path, &pixels).map_err(|e| {
                AttackError::resource(
                    &path,
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;
        }
        debug!("wrote {} images to {}", batch, self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use ndarray_npy::ReadNpyExt;
    use std::fs::File;

    #[test]
    fn test_emit_rounds_to_u8_under_original_names() {
        let dir = std::env::temp_dir().join(format!("advex-emit-{}", std::process::id()));
        let emitter = ImageEmitter::create(&dir).unwrap();

        let mut images = Array4::<AdvFloat>::zeros((2, 3, 2, 2));
        images[[0, 0, 0, 0]] = 1.;
        images[[0, 1, 0, 1]] = 0.5;
        images[[1, 2, 1, 1]] = 2.0 / 255.;
        let filenames = vec!["one.npy".to_owned(), "two.npy".to_owned()];
        emitter.emit(&images, &filenames).unwrap();

        let one = Array3::<u8>::read_npy(File::open(dir.join("one.npy")).unwrap()).unwrap();
        assert_eq!(one.dim(), (2, 2, 3));
        assert_eq!(one[[0, 0, 0]], 255);
        assert_eq!(one[[0, 1, 1]], 128);
        let two = Array3::<u8>::read_npy(File::open(dir.join("two.npy")).unwrap()).unwrap();
        assert_eq!(two[[1, 1, 2]], 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_emit_rejects_mismatched_filenames() {
        let dir = std::env::temp_dir().join(format!("advex-emit-bad-{}", std::process::id()));
        let emitter = ImageEmitter::create(&dir).unwrap();
        let images = Array4::<AdvFloat>::zeros((2, 3, 2, 2));
        let filenames = vec!["only-one.npy".to_owned()];
        assert!(matches!(
            emitter.emit(&images, &filenames),
            Err(AttackError::Shape { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
