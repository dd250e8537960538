//! A2DISK - Apple II Disk II subsystem in Rust
//!
//! Disk II インターフェースカードのエミュレーション:
//! - GCR 4-and-4 / 6-and-2 エンコード・デコード
//! - DSK/DO/PO (セクタイメージ) と WOZ 1.0/2.0 (ビットストリーム)
//! - ステッパーモーターとヘッド位置
//! - ソフトスイッチで駆動するコントローラ（Q6/Q7、モーター、ドライブ選択）
//! - スロットI/O ($C0n0-$C0nF) とブートROM ($Cn00) のデコード
//!
//! ホストはCPUサイクルカウンタを渡しながら `SlotBus::read` / `write` を呼ぶだけでよい。

pub mod bus;
pub mod config;
pub mod controller;
pub mod disk_log;
pub mod error;
pub mod gcr;
pub mod image;

pub use bus::{Disk2Card, SlotBus, SlotCard};
pub use controller::{Disk2Controller, DiskStatus, DriveStatus};
pub use error::{DiskError, LoadError};
pub use image::{DiskFormat, DiskImage};
