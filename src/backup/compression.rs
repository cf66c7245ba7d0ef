use super::{BackupError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

pub const MAX_LEVEL: i32 = 22;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Zstd,
}

/// Compression settings of a policy.
///
/// With `threads <= 1` the payload is compressed as one zstd stream. With more
/// threads it is cut into `block_size` blocks that are compressed
/// independently and in parallel, and every block becomes its own frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
    pub block_size: usize,
    pub threads: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: 3,
            block_size: 1024 * 1024,
            threads: 1,
        }
    }
}

impl CompressionSettings {
    pub fn effective_level(&self) -> i32 {
        self.level.clamp(1, MAX_LEVEL)
    }

    pub fn is_block_mode(&self) -> bool {
        self.algorithm == CompressionAlgorithm::Zstd && self.threads > 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_block_mode() && self.block_size == 0 {
            return Err(BackupError::config("compression block_size must be > 0"));
        }
        Ok(())
    }

    /// Same settings at the strongest level, used when retention recompresses
    pub fn strongest(&self) -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: MAX_LEVEL,
            ..self.clone()
        }
    }
}

fn compression_error(context: &str, e: impl std::fmt::Display) -> BackupError {
    BackupError::Compression {
        message: format!("{context}: {e}"),
    }
}

enum CompressorMode {
    Passthrough,
    Stream(zstd::stream::write::Encoder<'static, Vec<u8>>),
    Block {
        level: i32,
        block_size: usize,
        threads: usize,
        pending: Vec<u8>,
    },
}

/// Incremental compressor; every returned chunk is ready to be sealed as one frame.
pub struct Compressor {
    mode: CompressorMode,
    input_bytes: u64,
    output_bytes: u64,
}

impl Compressor {
    pub fn new(settings: &CompressionSettings) -> Result<Self> {
        let mode = match settings.algorithm {
            CompressionAlgorithm::None => CompressorMode::Passthrough,
            CompressionAlgorithm::Zstd if settings.is_block_mode() => CompressorMode::Block {
                level: settings.effective_level(),
                block_size: settings.block_size,
                threads: settings.threads,
                pending: Vec::new(),
            },
            CompressionAlgorithm::Zstd => {
                let encoder =
                    zstd::stream::write::Encoder::new(Vec::new(), settings.effective_level())
                        .map_err(|e| compression_error("zstd encoder init failed", e))?;
                CompressorMode::Stream(encoder)
            }
        };

        Ok(Self {
            mode,
            input_bytes: 0,
            output_bytes: 0,
        })
    }

    pub async fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.input_bytes += data.len() as u64;

        let out = match &mut self.mode {
            CompressorMode::Passthrough => {
                if data.is_empty() {
                    Vec::new()
                } else {
                    vec![Bytes::copy_from_slice(data)]
                }
            }
            CompressorMode::Stream(encoder) => {
                encoder
                    .write_all(data)
                    .map_err(|e| compression_error("zstd stream write failed", e))?;
                drain(encoder.get_mut())
            }
            CompressorMode::Block {
                level,
                block_size,
                threads,
                pending,
            } => {
                pending.extend_from_slice(data);
                let batch = *block_size * *threads;
                if pending.len() < batch {
                    Vec::new()
                } else {
                    let full = pending.len() / *block_size * *block_size;
                    let ready: Vec<u8> = pending.drain(..full).collect();
                    compress_blocks(split_blocks(&ready, *block_size), *level).await?
                }
            }
        };

        self.output_bytes += out.iter().map(|b| b.len() as u64).sum::<u64>();
        Ok(out)
    }

    pub async fn finish(&mut self) -> Result<(Vec<Bytes>, CompressionStats)> {
        let out = match std::mem::replace(&mut self.mode, CompressorMode::Passthrough) {
            CompressorMode::Passthrough => Vec::new(),
            CompressorMode::Stream(encoder) => {
                let tail = encoder
                    .finish()
                    .map_err(|e| compression_error("zstd stream finish failed", e))?;
                if tail.is_empty() {
                    Vec::new()
                } else {
                    vec![Bytes::from(tail)]
                }
            }
            CompressorMode::Block {
                level,
                block_size,
                pending,
                ..
            } => {
                if pending.is_empty() {
                    Vec::new()
                } else {
                    compress_blocks(split_blocks(&pending, block_size), level).await?
                }
            }
        };

        self.output_bytes += out.iter().map(|b| b.len() as u64).sum::<u64>();
        let stats = CompressionStats {
            input_bytes: self.input_bytes,
            output_bytes: self.output_bytes,
        };
        debug!(
            "Compression completed: original={}B, compressed={}B, ratio={:.2}:1",
            stats.input_bytes,
            stats.output_bytes,
            stats.ratio()
        );
        Ok((out, stats))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompressionStats {
    pub input_bytes: u64,
    pub output_bytes: u64,
}

impl CompressionStats {
    pub fn ratio(&self) -> f64 {
        if self.output_bytes == 0 {
            1.0
        } else {
            self.input_bytes as f64 / self.output_bytes as f64
        }
    }
}

fn drain(buffer: &mut Vec<u8>) -> Vec<Bytes> {
    if buffer.is_empty() {
        Vec::new()
    } else {
        vec![Bytes::from(std::mem::take(buffer))]
    }
}

fn split_blocks(data: &[u8], block_size: usize) -> Vec<Bytes> {
    data.chunks(block_size.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}

async fn compress_blocks(blocks: Vec<Bytes>, level: i32) -> Result<Vec<Bytes>> {
    let tasks = blocks.into_iter().map(|block| {
        tokio::task::spawn_blocking(move || {
            zstd::bulk::compress(&block, level)
                .map(Bytes::from)
                .map_err(|e| compression_error("zstd block compression failed", e))
        })
    });

    futures::future::try_join_all(tasks)
        .await
        .map_err(|e| compression_error("compression worker failed", e))?
        .into_iter()
        .collect()
}

/// Inverse of [`Compressor`], fed one decrypted frame at a time.
pub enum Decompressor {
    Passthrough,
    Stream(zstd::stream::write::Decoder<'static, Vec<u8>>),
    Block,
}

impl Decompressor {
    pub fn new(settings: &CompressionSettings) -> Result<Self> {
        Ok(match settings.algorithm {
            CompressionAlgorithm::None => Decompressor::Passthrough,
            CompressionAlgorithm::Zstd if settings.is_block_mode() => Decompressor::Block,
            CompressionAlgorithm::Zstd => Decompressor::Stream(
                zstd::stream::write::Decoder::new(Vec::new())
                    .map_err(|e| compression_error("zstd decoder init failed", e))?,
            ),
        })
    }

    pub fn push(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        match self {
            Decompressor::Passthrough => Ok(frame.to_vec()),
            Decompressor::Stream(decoder) => {
                decoder
                    .write_all(frame)
                    .map_err(|e| compression_error("zstd stream decode failed", e))?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Decompressor::Block => zstd::stream::decode_all(frame)
                .map_err(|e| compression_error("zstd block decode failed", e)),
        }
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        match self {
            Decompressor::Stream(mut decoder) => {
                decoder
                    .flush()
                    .map_err(|e| compression_error("zstd stream flush failed", e))?;
                Ok(decoder.into_inner())
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        "patient record with repeated content; "
            .repeat(2_000)
            .into_bytes()
    }

    async fn roundtrip(settings: CompressionSettings) -> (Vec<u8>, usize, CompressionStats) {
        let payload = sample_payload();
        let mut compressor = Compressor::new(&settings).unwrap();
        let mut frames = Vec::new();
        for chunk in payload.chunks(7_000) {
            frames.extend(compressor.push(chunk).await.unwrap());
        }
        let (tail, stats) = compressor.finish().await.unwrap();
        frames.extend(tail);

        let mut decompressor = Decompressor::new(&settings).unwrap();
        let mut restored = Vec::new();
        for frame in &frames {
            restored.extend(decompressor.push(frame).unwrap());
        }
        restored.extend(decompressor.finish().unwrap());
        (restored, frames.len(), stats)
    }

    #[tokio::test]
    async fn test_stream_mode_roundtrip() {
        let (restored, _, stats) = roundtrip(CompressionSettings::default()).await;
        assert_eq!(restored, sample_payload());
        assert!(stats.ratio() > 5.0);
    }

    #[tokio::test]
    async fn test_block_mode_emits_one_frame_per_block() {
        let settings = CompressionSettings {
            block_size: 16 * 1024,
            threads: 4,
            ..Default::default()
        };
        let (restored, frames, _) = roundtrip(settings).await;
        let payload_len = sample_payload().len();
        assert_eq!(restored, sample_payload());
        assert_eq!(frames, payload_len.div_ceil(16 * 1024));
    }

    #[tokio::test]
    async fn test_passthrough_keeps_bytes() {
        let settings = CompressionSettings {
            algorithm: CompressionAlgorithm::None,
            ..Default::default()
        };
        let (restored, _, stats) = roundtrip(settings).await;
        assert_eq!(restored, sample_payload());
        assert_eq!(stats.input_bytes, stats.output_bytes);
    }

    #[test]
    fn test_level_is_clamped() {
        let settings = CompressionSettings {
            level: 40,
            ..Default::default()
        };
        assert_eq!(settings.effective_level(), MAX_LEVEL);
        assert_eq!(settings.strongest().level, MAX_LEVEL);
    }
}
