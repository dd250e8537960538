//! 設定ファイル管理モジュール
//!
//! ディスクサブシステムの設定をJSON形式で永続化

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::bus::{Disk2Card, SlotBus};
use crate::controller::{Disk2Controller, DEFAULT_MOTOR_OFF_DELAY, DRIVES};
use crate::disk_log::{DiskLogLevel, LogObserver};
use crate::error::DiskError;

/// 設定ファイルのデフォルトファイル名
const CONFIG_FILENAME: &str = "a2disk_config.json";

/// 実行ファイルのディレクトリを取得
pub fn get_exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 相対パスを指定されたベースディレクトリからの絶対パスに解決
pub fn resolve_path_with_base(base: &str, relative: &str) -> PathBuf {
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else if base.is_empty() {
        get_exe_dir().join(relative)
    } else {
        let base_path = Path::new(base);
        if base_path.is_absolute() {
            base_path.join(relative)
        } else {
            get_exe_dir().join(base).join(relative)
        }
    }
}

/// 設定ファイルのパスを取得
pub fn get_config_path() -> PathBuf {
    get_exe_dir().join(CONFIG_FILENAME)
}

/// ディスクサブシステム設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// 相対パスの基準ディレクトリ
    /// 空または未設定の場合は実行ファイルのディレクトリを使用
    #[serde(default)]
    pub home: String,
    /// カードを挿すスロット（1-7）
    #[serde(default = "default_slot")]
    pub slot: u8,
    /// ドライブ1のディスクイメージ
    #[serde(default)]
    pub drive1: Option<String>,
    /// ドライブ2のディスクイメージ
    #[serde(default)]
    pub drive2: Option<String>,
    /// ドライブごとのライトプロテクト
    #[serde(default)]
    pub write_protect: [bool; DRIVES],
    /// P5ブートROM (256バイト)
    #[serde(default)]
    pub boot_rom: Option<String>,
    /// motor-offディレイ（サイクル数）
    #[serde(default = "default_motor_off_delay")]
    pub motor_off_delay: u64,
    /// ログカテゴリ（"flow", "state", "switch", "nibble", "all"）
    #[serde(default = "default_log_categories")]
    pub log_categories: Vec<String>,
}

fn default_slot() -> u8 { 6 }
fn default_motor_off_delay() -> u64 { DEFAULT_MOTOR_OFF_DELAY }
fn default_log_categories() -> Vec<String> { vec!["flow".to_string()] }

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            home: String::new(),
            slot: default_slot(),
            drive1: None,
            drive2: None,
            write_protect: [false; DRIVES],
            boot_rom: None,
            motor_off_delay: default_motor_off_delay(),
            log_categories: default_log_categories(),
        }
    }
}

impl DiskConfig {
    /// 設定ファイルを読み込む（実行ファイルと同じディレクトリから）
    pub fn load() -> Self {
        Self::load_from(get_config_path())
    }

    /// 指定したパスから設定を読み込む。読めなければデフォルト
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Failed to parse config {:?}: {}, using defaults", path.as_ref(), e);
                    DiskConfig::default()
                }
            },
            Err(_) => DiskConfig::default(),
        }
    }

    /// 指定したパスに設定を保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, json)
            .map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// 相対パスをhomeからの絶対パスに解決
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        resolve_path_with_base(&self.home, relative)
    }

    pub fn drive_path(&self, drive: usize) -> Option<PathBuf> {
        let path = match drive {
            0 => self.drive1.as_deref(),
            1 => self.drive2.as_deref(),
            _ => None,
        }?;
        Some(self.resolve_path(path))
    }

    pub fn log_level(&self) -> DiskLogLevel {
        DiskLogLevel::from_names(&self.log_categories)
    }

    /// 設定どおりのカードを作る（ROM・ディスク・ライトプロテクト・ログ）
    pub fn build_card(&self) -> Result<Disk2Card, DiskError> {
        let mut controller = Disk2Controller::new();
        controller.set_motor_off_delay(self.motor_off_delay);

        let level = self.log_level();
        if !level.is_empty() {
            controller.set_observer(Box::new(LogObserver::new(level)));
        }

        for drive in 0..DRIVES {
            controller.set_write_protect(drive, self.write_protect[drive])?;
            if let Some(path) = self.drive_path(drive) {
                controller.insert_disk(drive, &path)?;
            }
        }

        let mut card = Disk2Card::with_controller(controller);
        if let Some(rom) = &self.boot_rom {
            card.load_boot_rom_file(self.resolve_path(rom))?;
        }
        Ok(card)
    }

    /// カードを設定のスロットに挿したバス
    pub fn build_bus(&self) -> Result<SlotBus<Disk2Card>, DiskError> {
        SlotBus::new(self.slot, self.build_card()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::dsk::testdisk;

    #[test]
    fn test_defaults() {
        let config = DiskConfig::default();
        assert_eq!(config.slot, 6);
        assert_eq!(config.motor_off_delay, 1_023_000);
        assert_eq!(config.log_level(), DiskLogLevel::FLOW);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DiskConfig = serde_json::from_str(r#"{ "slot": 5, "drive1": "a.dsk" }"#).unwrap();
        assert_eq!(config.slot, 5);
        assert_eq!(config.drive1.as_deref(), Some("a.dsk"));
        assert_eq!(config.write_protect, [false, false]);
        assert_eq!(config.motor_off_delay, DEFAULT_MOTOR_OFF_DELAY);
    }

    #[test]
    fn test_load_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(DiskConfig::load_from(dir.path().join("missing.json")), DiskConfig::default());

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert_eq!(DiskConfig::load_from(&broken), DiskConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = DiskConfig {
            drive2: Some("games/lode.woz".to_string()),
            write_protect: [true, false],
            log_categories: vec!["state".into(), "switch".into()],
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        let loaded = DiskConfig::load_from(&path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.log_level(), DiskLogLevel::STATE | DiskLogLevel::SWITCH);
    }

    #[test]
    fn test_resolve_relative_to_home() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskConfig {
            home: dir.path().display().to_string(),
            drive1: Some("disk.dsk".to_string()),
            ..Default::default()
        };
        assert_eq!(config.drive_path(0), Some(dir.path().join("disk.dsk")));
        assert_eq!(config.drive_path(1), None);
    }

    #[test]
    fn test_build_card() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("disk.dsk"), testdisk::dos33()).unwrap();
        let config = DiskConfig {
            home: dir.path().display().to_string(),
            drive1: Some("disk.dsk".to_string()),
            write_protect: [false, true],
            motor_off_delay: 5000,
            log_categories: vec![],
            ..Default::default()
        };

        let bus = config.build_bus().unwrap();
        assert_eq!(bus.slot(), 6);
        let controller = bus.card().controller();
        assert_eq!(controller.motor_off_delay(), 5000);
        let status = controller.status();
        assert!(status.drives[0].loaded);
        assert!(!status.drives[1].loaded);
        assert!(status.drives[1].write_protected);
        assert!(!bus.card().is_rom_loaded());
    }

    #[test]
    fn test_build_card_missing_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskConfig {
            home: dir.path().display().to_string(),
            drive1: Some("nothing.dsk".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.build_card(), Err(DiskError::Load(_))));
    }
}
