//! Compress-then-encrypt pipeline and the stored object format.
//!
//! A stored object is the 4-byte magic `BKC1` followed by frames, each a
//! big-endian `u32` length and the sealed frame bytes. The integrity tag is
//! computed over everything that is stored, so it can be checked before any
//! frame is decrypted.

use super::compression::{CompressionSettings, CompressionStats, Compressor, Decompressor};
use super::encryption::{
    derive_keys, DerivedKeys, EncryptionAlgorithm, EncryptionSettings, FrameCipher, IntegrityHasher,
    SecretResolver,
};
use super::source::SourceEntry;
use super::{BackupError, BackupRecord, IntegrityTag, ManifestEntry, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

pub const MAGIC: &[u8; 4] = b"BKC1";
const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub original_size: u64,
    pub compressed_size: u64,
    pub stored_size: u64,
    pub block_count: u32,
    pub file_count: u64,
    /// SHA-256 of the plaintext payload
    pub content_checksum: String,
    pub integrity: IntegrityTag,
    pub manifest: Vec<ManifestEntry>,
}

impl PipelineSummary {
    pub fn compression_ratio(&self) -> f64 {
        CompressionStats {
            input_bytes: self.original_size,
            output_bytes: self.compressed_size,
        }
        .ratio()
    }
}

/// Encodes a plaintext payload into stored chunks, frame by frame.
pub struct PipelineWriter {
    compressor: Compressor,
    cipher: FrameCipher,
    hasher: IntegrityHasher,
    content: Sha256,
    frame_index: u64,
    plaintext_offset: u64,
    stored_size: u64,
    manifest: Vec<ManifestEntry>,
    header_written: bool,
}

impl PipelineWriter {
    pub fn new(
        compression: &CompressionSettings,
        algorithm: EncryptionAlgorithm,
        keys: &DerivedKeys,
    ) -> Result<Self> {
        Ok(Self {
            compressor: Compressor::new(compression)?,
            cipher: FrameCipher::new(algorithm, keys)?,
            hasher: IntegrityHasher::new(keys)?,
            content: Sha256::new(),
            frame_index: 0,
            plaintext_offset: 0,
            stored_size: 0,
            manifest: Vec::new(),
            header_written: false,
        })
    }

    fn header(&mut self) -> Option<Bytes> {
        if self.header_written {
            return None;
        }
        self.header_written = true;
        self.hasher.update(MAGIC);
        self.stored_size += MAGIC.len() as u64;
        Some(Bytes::from_static(MAGIC))
    }

    fn seal_frames(&mut self, compressed: Vec<Bytes>) -> Result<Vec<Bytes>> {
        let mut out: Vec<Bytes> = self.header().into_iter().collect();

        for chunk in compressed {
            let sealed = self.cipher.seal(self.frame_index, &chunk)?;
            let len = u32::try_from(sealed.len()).map_err(|_| BackupError::Compression {
                message: format!("frame of {} bytes exceeds the frame size limit", sealed.len()),
            })?;

            let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + sealed.len());
            frame.put_u32(len);
            frame.put_slice(&sealed);
            let frame = frame.freeze();

            self.hasher.update(&frame);
            self.stored_size += frame.len() as u64;
            self.frame_index += 1;
            out.push(frame);
        }

        Ok(out)
    }

    /// Appends raw plaintext that is not tracked in the manifest.
    pub async fn push_bytes(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.content.update(data);
        self.plaintext_offset += data.len() as u64;
        let compressed = self.compressor.push(data).await?;
        self.seal_frames(compressed)
    }

    /// Appends one entity and records where its bytes live in the plaintext.
    pub async fn push_entry(&mut self, entry: &SourceEntry) -> Result<Vec<Bytes>> {
        self.manifest.push(ManifestEntry {
            entity: entry.entity.clone(),
            modified_at: entry.modified_at,
            offset: self.plaintext_offset,
            length: entry.data.len() as u64,
            depends_on: entry.depends_on.clone(),
        });
        self.push_bytes(&entry.data).await
    }

    pub async fn finish(mut self) -> Result<(Vec<Bytes>, PipelineSummary)> {
        let (tail, stats) = self.compressor.finish().await?;
        let chunks = self.seal_frames(tail)?;

        let summary = PipelineSummary {
            original_size: stats.input_bytes,
            compressed_size: stats.output_bytes,
            stored_size: self.stored_size,
            block_count: self.frame_index as u32,
            file_count: self.manifest.len() as u64,
            content_checksum: hex::encode(self.content.finalize()),
            integrity: self.hasher.finalize(),
            manifest: self.manifest,
        };
        Ok((chunks, summary))
    }
}

/// Splits a stored object into its sealed frames.
pub fn split_frames(stored: &[u8]) -> Result<Vec<&[u8]>> {
    let body = stored
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| BackupError::integrity("stored object has no pipeline header"))?;

    let mut frames = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < LENGTH_PREFIX {
            return Err(BackupError::integrity("truncated frame length"));
        }
        let (prefix, tail) = rest.split_at(LENGTH_PREFIX);
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if tail.len() < len {
            return Err(BackupError::integrity("truncated frame body"));
        }
        let (frame, next) = tail.split_at(len);
        frames.push(frame);
        rest = next;
    }
    Ok(frames)
}

/// Checks the stored tag over the whole object. A record without a tag
/// passes.
pub fn verify_integrity(
    stored: &[u8],
    keys: &DerivedKeys,
    expected: Option<&IntegrityTag>,
) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let mut hasher = IntegrityHasher::new(keys)?;
    hasher.update(stored);
    hasher.verify(expected)
}

/// Inverse pipeline: open then decompress, one frame at a time.
pub struct PipelineReader {
    cipher: FrameCipher,
    decompressor: Decompressor,
}

impl PipelineReader {
    pub fn new(
        compression: &CompressionSettings,
        algorithm: EncryptionAlgorithm,
        keys: &DerivedKeys,
    ) -> Result<Self> {
        Ok(Self {
            cipher: FrameCipher::new(algorithm, keys)?,
            decompressor: Decompressor::new(compression)?,
        })
    }

    pub fn decode_frame(&mut self, index: u64, frame: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.cipher.open(index, frame)?;
        self.decompressor.push(&compressed)
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        self.decompressor.finish()
    }
}

/// Verifies and decodes a whole stored object into its plaintext payload.
pub fn decode_payload(
    stored: &[u8],
    compression: &CompressionSettings,
    algorithm: EncryptionAlgorithm,
    keys: &DerivedKeys,
    expected: Option<&IntegrityTag>,
) -> Result<Vec<u8>> {
    verify_integrity(stored, keys, expected)?;

    let mut reader = PipelineReader::new(compression, algorithm, keys)?;
    let mut plaintext = Vec::new();
    for (index, frame) in split_frames(stored)?.into_iter().enumerate() {
        plaintext.extend(reader.decode_frame(index as u64, frame)?);
    }
    plaintext.extend(reader.finish()?);
    Ok(plaintext)
}

/// Re-encodes a stored object with different compression settings, keeping
/// the same keys. The returned summary carries no manifest.
pub async fn recompress(
    stored: &[u8],
    from: &CompressionSettings,
    to: &CompressionSettings,
    algorithm: EncryptionAlgorithm,
    keys: &DerivedKeys,
    expected: Option<&IntegrityTag>,
) -> Result<(Bytes, PipelineSummary)> {
    let plaintext = decode_payload(stored, from, algorithm, keys, expected)?;

    let mut writer = PipelineWriter::new(to, algorithm, keys)?;
    let mut out = BytesMut::with_capacity(stored.len());
    for chunk in writer.push_bytes(&plaintext).await? {
        out.extend_from_slice(&chunk);
    }
    let (tail, summary) = writer.finish().await?;
    for chunk in tail {
        out.extend_from_slice(&chunk);
    }
    Ok((out.freeze(), summary))
}

/// Re-derives the keys a record was written with from its stored salt.
pub async fn record_keys(
    record: &BackupRecord,
    settings: &EncryptionSettings,
    resolver: &dyn SecretResolver,
) -> Result<DerivedKeys> {
    let salt = hex::decode(&record.key_salt).map_err(|e| BackupError::Encryption {
        message: format!("record {} has an invalid key salt: {e}", record.id),
    })?;
    let settings = EncryptionSettings {
        algorithm: record.encryption_algorithm,
        ..settings.clone()
    };
    derive_keys(&settings, resolver, &salt).await
}
