//! Per-region chunk manifest
//!
//! Layout on disk:
//!
//! ```text
//! {chunks_dir}/{region}/manifest.json
//! {chunks_dir}/{region}/chunk_1.geojson
//! {chunks_dir}/{region}/chunk_2.geojson
//! ...
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LoadError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// File name of chunk `number` (1-based)
pub fn chunk_filename(number: u32) -> String {
    format!("chunk_{number}.geojson")
}

/// Directory holding a region's manifest and chunk files
pub fn region_dir(chunks_dir: &Path, region: &str) -> PathBuf {
    chunks_dir.join(region)
}

/// Description of one chunk file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_number: u32,
    pub filename: String,
    pub features: u64,
    pub size_bytes: u64,
    /// Hex SHA-256 of the chunk file
    pub sha256: String,
}

impl ChunkDescriptor {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub region: String,
    pub source_file: String,
    pub total_features: u64,
    pub total_chunks: u32,
    pub chunk_size: usize,
    #[serde(default)]
    pub created_in_seconds: f64,
    pub chunks: Vec<ChunkDescriptor>,
}

impl Manifest {
    pub fn path(chunks_dir: &Path, region: &str) -> PathBuf {
        region_dir(chunks_dir, region).join(MANIFEST_FILE)
    }

    pub fn exists(chunks_dir: &Path, region: &str) -> bool {
        Self::path(chunks_dir, region).is_file()
    }

    /// Read and check the manifest of `region`
    pub fn load(chunks_dir: &Path, region: &str) -> Result<Self> {
        let path = Self::path(chunks_dir, region);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::ManifestMissing {
                    region: region.to_string(),
                    path,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = serde_json::from_slice(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write the manifest into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    /// Check the structural invariants a loader relies on
    pub fn validate(&self) -> Result<()> {
        let inconsistent = |message: String| LoadError::ManifestInconsistent {
            region: self.region.clone(),
            message,
        };

        if self.chunks.len() != self.total_chunks as usize {
            return Err(inconsistent(format!(
                "total_chunks is {} but {} chunks are listed",
                self.total_chunks,
                self.chunks.len()
            )));
        }

        let sum: u64 = self.chunks.iter().map(|c| c.features).sum();
        if sum != self.total_features {
            return Err(inconsistent(format!(
                "chunk feature counts sum to {sum}, total_features is {}",
                self.total_features
            )));
        }

        for (index, chunk) in self.chunks.iter().enumerate() {
            let expected = index as u32 + 1;
            if chunk.chunk_number != expected {
                return Err(inconsistent(format!(
                    "chunk at position {expected} is numbered {}",
                    chunk.chunk_number
                )));
            }
            if chunk.features == 0 {
                return Err(inconsistent(format!("chunk {expected} is empty")));
            }
            if self.chunk_size > 0 && chunk.features > self.chunk_size as u64 {
                return Err(inconsistent(format!(
                    "chunk {expected} holds {} features, above chunk_size {}",
                    chunk.features, self.chunk_size
                )));
            }
        }
        Ok(())
    }

    pub fn chunk_path(&self, chunks_dir: &Path, chunk: &ChunkDescriptor) -> PathBuf {
        region_dir(chunks_dir, &self.region).join(&chunk.filename)
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size_bytes).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn descriptor(number: u32, features: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            chunk_number: number,
            filename: chunk_filename(number),
            features,
            size_bytes: 10,
            sha256: String::new(),
        }
    }

    fn manifest(chunks: Vec<ChunkDescriptor>) -> Manifest {
        Manifest {
            region: "Delaware".into(),
            source_file: "Delaware.geojson".into(),
            total_features: chunks.iter().map(|c| c.features).sum(),
            total_chunks: chunks.len() as u32,
            chunk_size: 50,
            created_in_seconds: 0.1,
            chunks,
        }
    }

    #[test]
    fn test_valid_manifest() {
        let m = manifest(vec![descriptor(1, 50), descriptor(2, 50), descriptor(3, 30)]);
        m.validate().unwrap();
        assert_eq!(m.total_features, 130);
        assert_eq!(m.total_size_bytes(), 30);
        assert_eq!(
            m.chunk_path(Path::new("/data/chunks"), &m.chunks[2]),
            PathBuf::from("/data/chunks/Delaware/chunk_3.geojson")
        );
    }

    #[test]
    fn test_inconsistent_manifests() {
        let mut m = manifest(vec![descriptor(1, 50), descriptor(2, 30)]);
        m.total_features = 81;
        assert!(matches!(m.validate(), Err(LoadError::ManifestInconsistent { .. })));

        let m = manifest(vec![descriptor(1, 50), descriptor(3, 30)]);
        assert!(m.validate().is_err());

        let m = manifest(vec![descriptor(1, 60)]);
        assert!(m.validate().is_err());

        let mut m = manifest(vec![descriptor(1, 10)]);
        m.total_chunks = 2;
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Manifest::load(dir.path(), "Vermont").unwrap_err();
        assert!(matches!(err, LoadError::ManifestMissing { ref region, .. } if region == "Vermont"));
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = manifest(vec![descriptor(1, 5)]);
        let region = region_dir(dir.path(), "Delaware");
        std::fs::create_dir_all(&region).unwrap();
        m.write_to(&region).unwrap();

        assert!(Manifest::exists(dir.path(), "Delaware"));
        assert_eq!(Manifest::load(dir.path(), "Delaware").unwrap(), m);
    }
}
