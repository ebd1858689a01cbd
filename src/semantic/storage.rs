//! Binary storage for skill embeddings.
//!
//! File format: skill-vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (2)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, all integers little-endian):
//! - skill_name: u32 length + UTF-8 bytes
//! - generated_at: i64 (milliseconds since epoch)
//! - text_content: u32 length + UTF-8 bytes
//! - vector: [f32; dimensions]
//! - chunk_count: u32, then per chunk:
//!   start_line: u32, end_line: u32, content (u32 length + bytes), vector: [f32; dimensions]

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::semantic::index::{IndexError, VectorIndex};
use crate::skill::{Chunk, SkillEmbedding};

/// Current file format version
const FORMAT_VERSION: u8 = 2;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Upper bound for a single stored string
const MAX_STRING_BYTES: usize = 16 * 1024 * 1024;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

/// SHA256 of a model name, stored in the header to detect model changes.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Index read from disk together with the model that produced it.
pub struct LoadedIndex {
    pub model_id: [u8; 32],
    pub index: VectorIndex,
}

/// Storage manager for skill embeddings.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the vector index from storage.
    pub fn load(&self) -> Result<LoadedIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        let dimensions = header.dimensions as usize;

        let mut index = VectorIndex::with_capacity(
            dimensions,
            (header.entry_count as usize).min(1 << 20),
        );
        for _ in 0..header.entry_count {
            let embedding = Self::read_entry(&mut reader, dimensions)?;
            index.upsert(embedding)?;
        }

        Ok(LoadedIndex {
            model_id: header.model_id,
            index,
        })
    }

    /// Save the vector index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions exceed the format limit",
                index.dimensions()
            ))
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let result = Self::write_to_file(&temp_path, index, model_id, dimensions);

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
        dimensions: u16,
    ) -> Result<(), VectorStorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
        };
        Self::write_header(&mut writer, &header)?;

        // Sorted by name so identical indexes produce identical files
        let mut names: Vec<&str> = index.iter().map(|(name, _)| name).collect();
        names.sort_unstable();
        for name in names {
            if let Some(embedding) = index.to_embedding(name) {
                Self::write_entry(&mut writer, &embedding)?;
            }
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                VectorStorageError::InvalidFormat("file shorter than header".to_string())
            }
            _ => e.into(),
        })?;

        let version = header_bytes[0];
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        // Verify checksum (computed over header without checksum field)
        let stored_checksum = u32::from_le_bytes([
            header_bytes[43],
            header_bytes[44],
            header_bytes[45],
            header_bytes[46],
        ]);
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header_bytes[35..43]);

        Ok(Header {
            version,
            model_id,
            dimensions,
            entry_count: u64::from_le_bytes(count_bytes),
        })
    }

    fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry(
        reader: &mut impl Read,
        dimensions: usize,
    ) -> Result<SkillEmbedding, VectorStorageError> {
        let skill_name = read_string(reader)?;
        let millis = i64::from_le_bytes(read_array(reader)?);
        let generated_at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            VectorStorageError::InvalidFormat(format!("invalid timestamp {}", millis))
        })?;
        let text_content = read_string(reader)?;
        let vector = read_vector(reader, dimensions)?;

        let chunk_count = u32::from_le_bytes(read_array(reader)?);
        let mut chunks = Vec::new();
        for _ in 0..chunk_count {
            let start_line = u32::from_le_bytes(read_array(reader)?) as usize;
            let end_line = u32::from_le_bytes(read_array(reader)?) as usize;
            let content = read_string(reader)?;
            let vector = read_vector(reader, dimensions)?;
            chunks.push(Chunk {
                content,
                vector,
                start_line,
                end_line,
            });
        }

        Ok(SkillEmbedding {
            skill_name,
            vector,
            text_content,
            chunks: (!chunks.is_empty()).then_some(chunks),
            generated_at,
        })
    }

    fn write_entry(
        writer: &mut impl Write,
        embedding: &SkillEmbedding,
    ) -> Result<(), VectorStorageError> {
        write_string(writer, &embedding.skill_name)?;
        writer.write_all(&embedding.generated_at.timestamp_millis().to_le_bytes())?;
        write_string(writer, &embedding.text_content)?;
        write_vector(writer, &embedding.vector)?;

        let chunks = embedding.chunks.as_deref().unwrap_or_default();
        writer.write_all(&(chunks.len() as u32).to_le_bytes())?;
        for chunk in chunks {
            writer.write_all(&(chunk.start_line as u32).to_le_bytes())?;
            writer.write_all(&(chunk.end_line as u32).to_le_bytes())?;
            write_string(writer, &chunk.content)?;
            write_vector(writer, &chunk.vector)?;
        }

        Ok(())
    }
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N], VectorStorageError> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_string(reader: &mut impl Read) -> Result<String, VectorStorageError> {
    let len = u32::from_le_bytes(read_array(reader)?) as usize;
    if len > MAX_STRING_BYTES {
        return Err(VectorStorageError::InvalidFormat(format!(
            "string of {} bytes exceeds limit",
            len
        )));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("invalid UTF-8: {}", e)))
}

fn write_string(writer: &mut impl Write, value: &str) -> Result<(), VectorStorageError> {
    writer.write_all(&(value.len() as u32).to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn read_vector(reader: &mut impl Read, dimensions: usize) -> Result<Vec<f32>, VectorStorageError> {
    let mut vector = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        vector.push(f32::from_le_bytes(read_array(reader)?));
    }
    Ok(vector)
}

fn write_vector(writer: &mut impl Write, vector: &[f32]) -> Result<(), VectorStorageError> {
    for &value in vector {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}
