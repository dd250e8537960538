//! エラー型
//!
//! サイクル単位のI/O（コントローラの read/write）はエラーを返さない。
//! ここにあるのはイメージのロード/セーブなど、ループ外の操作のエラーのみ。

use std::io;
use thiserror::Error;

/// ディスクイメージのロードエラー
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid image size ({0} bytes)")]
    BadSize(usize),
    #[error("bad image signature")]
    BadSignature,
    #[error("CRC mismatch (header ${expected:08X}, computed ${computed:08X})")]
    Crc { expected: u32, computed: u32 },
    #[error("chunk {0} is truncated")]
    TruncatedChunk(String),
    #[error("mandatory chunk {0} is missing")]
    MissingChunk(&'static str),
    #[error("track {0} data is invalid")]
    InvalidTrack(usize),
    #[error("unsupported image: {0}")]
    Unsupported(String),
}

/// ドライブ/イメージ操作のエラー
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("image has no file path")]
    NoPath,
    #[error("{0} is not supported for this image")]
    Unsupported(&'static str),
    #[error("invalid drive number {0}")]
    InvalidDrive(usize),
    #[error("invalid slot number {0} (must be 1-7)")]
    InvalidSlot(u8),
    #[error("invalid boot ROM: {0}")]
    InvalidRom(&'static str),
}
