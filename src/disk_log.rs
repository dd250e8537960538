//! Disk II ログ/観測システム
//!
//! 原則:
//! 1. ログは「現象」ではなく「判断」を記録
//! 2. 状態遷移のみ記録（毎回のI/OはSWITCH/NIBBLEカテゴリでのみ記録）
//! 3. レベル分離: FLOW / STATE / SWITCH / NIBBLE
//!
//! コントローラは `DiskEvent` をオブザーバに渡すだけで、出力方法は知らない。
//! グローバル状態は持たない。

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::gcr;
use crate::image::DiskFormat;

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DiskLogLevel: u32 {
        /// L1: 何が起きているか（人間向け）
        const FLOW   = 0b0001;
        /// L2: 状態遷移（開発者向け）
        const STATE  = 0b0010;
        /// L3: ソフトスイッチアクセス
        const SWITCH = 0b0100;
        /// L3: 生データ（短時間のみ）
        const NIBBLE = 0b1000;
    }
}

impl DiskLogLevel {
    /// カテゴリ名のリストから作成（大文字小文字は区別しない）
    ///
    /// 未知の名前は警告して無視する
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(DiskLogLevel::empty(), |level, name| {
            let upper = name.as_ref().trim().to_ascii_uppercase();
            if upper == "ALL" {
                return DiskLogLevel::all();
            }
            match DiskLogLevel::from_name(&upper) {
                Some(flag) => level | flag,
                None => {
                    log::warn!("Unknown disk log category: {}", name.as_ref());
                    level
                }
            }
        })
    }
}

/// 書き込みが捨てられた理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NoDisk,
    WriteProtected,
    MotorOff,
    /// イメージ側にデータがない（WOZの空トラックなど）
    NoTrackData,
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::NoDisk => write!(f, "NO_DISK"),
            IgnoreReason::WriteProtected => write!(f, "WRITE_PROTECTED"),
            IgnoreReason::MotorOff => write!(f, "MOTOR_OFF"),
            IgnoreReason::NoTrackData => write!(f, "NO_TRACK_DATA"),
        }
    }
}

/// コントローラが発行するイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskEvent {
    /// ソフトスイッチアクセス（読み出し時のvalueは0）
    SoftSwitch { address: u16, is_write: bool, value: u8 },
    MotorOn { drive: usize },
    /// モーター停止予約（atサイクルで停止）
    MotorOffPending { drive: usize, at: u64 },
    MotorOff { drive: usize },
    DriveSelected { drive: usize },
    /// クォータートラック単位
    TrackChanged { drive: usize, from: usize, to: usize },
    NibbleRead { drive: usize, nibble: u8, track: usize, position: usize },
    NibbleWritten { drive: usize, nibble: u8, track: usize, position: usize },
    WriteIgnored { drive: usize, reason: IgnoreReason },
    DiskInserted { drive: usize, format: DiskFormat },
    DiskEjected { drive: usize },
}

impl DiskEvent {
    /// このイベントが属するカテゴリ
    pub fn category(&self) -> DiskLogLevel {
        match self {
            DiskEvent::SoftSwitch { .. } => DiskLogLevel::SWITCH,
            DiskEvent::NibbleRead { .. } | DiskEvent::NibbleWritten { .. } => DiskLogLevel::NIBBLE,
            DiskEvent::TrackChanged { .. }
            | DiskEvent::DriveSelected { .. }
            | DiskEvent::MotorOffPending { .. }
            | DiskEvent::WriteIgnored { .. } => DiskLogLevel::STATE,
            DiskEvent::MotorOn { .. }
            | DiskEvent::MotorOff { .. }
            | DiskEvent::DiskInserted { .. }
            | DiskEvent::DiskEjected { .. } => DiskLogLevel::FLOW,
        }
    }
}

/// イベントの受け手
pub trait DiskObserver {
    fn on_event(&mut self, event: &DiskEvent);
}

/// 共有したままコントローラに渡せるように
impl<T: DiskObserver> DiskObserver for Rc<RefCell<T>> {
    fn on_event(&mut self, event: &DiskEvent) {
        self.borrow_mut().on_event(event);
    }
}

/// ニブルリングバッファ（最後のN個を保持）
pub struct NibbleRing {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
}

impl NibbleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: vec![0; capacity],
            pos: 0,
            capacity,
        }
    }

    pub fn push(&mut self, nibble: u8) {
        self.buf[self.pos % self.capacity] = nibble;
        self.pos += 1;
    }

    /// 最新からN個を取得（古い順）
    pub fn last_n(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.capacity).min(self.pos);
        (0..n)
            .map(|i| self.buf[(self.pos - n + i) % self.capacity])
            .collect()
    }

    /// 16バイト/行の16進ダンプ
    pub fn dump(&self, n: usize) -> String {
        let data = self.last_n(n);
        let mut out = format!("Last {} nibbles:\n", data.len());
        for line in data.chunks(16) {
            for b in line {
                let _ = write!(out, "{:02X} ", b);
            }
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pos.min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

impl Default for NibbleRing {
    fn default() -> Self {
        Self::new(256)
    }
}

/// `log` ファサードへ出力するオブザーバ
///
/// FLOW -> info, STATE -> debug, SWITCH/NIBBLE -> trace
pub struct LogObserver {
    level: DiskLogLevel,
    ring: NibbleRing,
}

/// アドレスフィールド（プロローグ + 8ニブル）
const ADDRESS_FIELD_LEN: usize = 11;

impl LogObserver {
    pub fn new(level: DiskLogLevel) -> Self {
        LogObserver { level, ring: NibbleRing::default() }
    }

    pub fn level(&self) -> DiskLogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: DiskLogLevel) {
        self.level = level;
    }

    pub fn ring(&self) -> &NibbleRing {
        &self.ring
    }

    /// 読み出しストリームにアドレスフィールドが揃ったらヘッダを記録
    fn check_sector_header(&self, track: usize) {
        let last = self.ring.last_n(ADDRESS_FIELD_LEN);
        if last.len() < ADDRESS_FIELD_LEN || last[..3] != gcr::ADDRESS_PROLOGUE {
            return;
        }
        match gcr::read_address_field(&last, 3) {
            Ok(field) => log::info!(
                "[DISK] Sector header: T={} S={} V={}",
                field.track, field.sector, field.volume
            ),
            Err(e) => log::debug!("[DISK] Bad address field on T={}: {}", track, e),
        }
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new(DiskLogLevel::FLOW)
    }
}

impl DiskObserver for LogObserver {
    fn on_event(&mut self, event: &DiskEvent) {
        if let DiskEvent::NibbleRead { nibble, track, .. } = *event {
            if self.level.intersects(DiskLogLevel::NIBBLE | DiskLogLevel::FLOW) {
                self.ring.push(nibble);
                if self.level.contains(DiskLogLevel::FLOW) {
                    self.check_sector_header(track);
                }
            }
        }

        if !self.level.intersects(event.category()) {
            return;
        }

        match event {
            DiskEvent::SoftSwitch { address, is_write, value } => {
                if *is_write {
                    log::trace!("[SW] ${:04X} <- ${:02X}", address, value);
                } else {
                    log::trace!("[SW] ${:04X}", address);
                }
            }
            DiskEvent::MotorOn { drive } => log::info!("[DISK] Motor ON (drive {})", drive + 1),
            DiskEvent::MotorOff { drive } => log::info!("[DISK] Motor OFF (drive {})", drive + 1),
            DiskEvent::MotorOffPending { drive, at } => {
                log::debug!("[STATE] Drive {} motor off scheduled at cycle {}", drive + 1, at)
            }
            DiskEvent::DriveSelected { drive } => log::debug!("[STATE] Drive {} selected", drive + 1),
            DiskEvent::TrackChanged { drive, from, to } => log::debug!(
                "[STATE] Drive {} track {}.{:02} -> {}.{:02}",
                drive + 1, from / 4, (from % 4) * 25, to / 4, (to % 4) * 25
            ),
            DiskEvent::NibbleRead { nibble, track, position, .. } => {
                log::trace!("[NIB] R T={} pos={} ${:02X}", track, position, nibble)
            }
            DiskEvent::NibbleWritten { nibble, track, position, .. } => {
                log::trace!("[NIB] W T={} pos={} ${:02X}", track, position, nibble)
            }
            DiskEvent::WriteIgnored { drive, reason } => {
                log::debug!("[STATE] Drive {} write ignored: {}", drive + 1, reason)
            }
            DiskEvent::DiskInserted { drive, format } => {
                log::info!("[DISK] Drive {}: inserted {}", drive + 1, format.name())
            }
            DiskEvent::DiskEjected { drive } => log::info!("[DISK] Drive {}: ejected", drive + 1),
        }
    }
}

/// 全イベントを記録するオブザーバ（テスト・ツール用）
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub events: Vec<DiskEvent>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// ソフトスイッチとニブル以外のイベント
    pub fn state_events(&self) -> Vec<&DiskEvent> {
        self.events
            .iter()
            .filter(|e| !e.category().intersects(DiskLogLevel::SWITCH | DiskLogLevel::NIBBLE))
            .collect()
    }

    pub fn nibbles_read(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|e| match e {
                DiskEvent::NibbleRead { nibble, .. } => Some(*nibble),
                _ => None,
            })
            .collect()
    }
}

impl DiskObserver for RecordingObserver {
    fn on_event(&mut self, event: &DiskEvent) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_ring() {
        let mut ring = NibbleRing::new(8);
        for i in 0..10 {
            ring.push(i as u8);
        }
        let last4 = ring.last_n(4);
        assert_eq!(last4, vec![6, 7, 8, 9]);
        assert_eq!(ring.last_n(20).len(), 8);
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn test_nibble_ring_dump() {
        let mut ring = NibbleRing::new(32);
        for i in 0..18u8 {
            ring.push(0x80 | i);
        }
        let dump = ring.dump(18);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "Last 18 nibbles:");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("90 91"));
    }

    #[test]
    fn test_log_level_from_names() {
        let level = DiskLogLevel::from_names(&["flow", "State", "bogus"]);
        assert!(level.contains(DiskLogLevel::FLOW));
        assert!(level.contains(DiskLogLevel::STATE));
        assert!(!level.contains(DiskLogLevel::SWITCH));
        assert!(!level.contains(DiskLogLevel::NIBBLE));
        assert_eq!(DiskLogLevel::from_names(&["all"]), DiskLogLevel::all());
        assert_eq!(DiskLogLevel::from_names::<&str>(&[]), DiskLogLevel::empty());
    }

    #[test]
    fn test_event_categories() {
        assert_eq!(DiskEvent::MotorOn { drive: 0 }.category(), DiskLogLevel::FLOW);
        assert_eq!(DiskEvent::TrackChanged { drive: 0, from: 0, to: 2 }.category(), DiskLogLevel::STATE);
        assert_eq!(
            DiskEvent::SoftSwitch { address: 0xC0E9, is_write: false, value: 0 }.category(),
            DiskLogLevel::SWITCH
        );
    }

    #[test]
    fn test_log_observer_ring_only_when_enabled() {
        let read = |nibble| DiskEvent::NibbleRead { drive: 0, nibble, track: 0, position: 0 };

        let mut quiet = LogObserver::new(DiskLogLevel::STATE);
        quiet.on_event(&read(0xD5));
        assert!(quiet.ring().is_empty());

        let mut observer = LogObserver::new(DiskLogLevel::FLOW);
        for n in [0xFF, 0xD5, 0xAA, 0x96] {
            observer.on_event(&read(n));
        }
        assert_eq!(observer.ring().last_n(3), vec![0xD5, 0xAA, 0x96]);
    }

    #[test]
    fn test_shared_recording_observer() {
        let shared = Rc::new(RefCell::new(RecordingObserver::new()));
        let mut handle: Box<dyn DiskObserver> = Box::new(shared.clone());
        handle.on_event(&DiskEvent::MotorOn { drive: 1 });
        handle.on_event(&DiskEvent::NibbleRead { drive: 1, nibble: 0x96, track: 0, position: 3 });
        assert_eq!(shared.borrow().events.len(), 2);
        assert_eq!(shared.borrow().state_events(), vec![&DiskEvent::MotorOn { drive: 1 }]);
        assert_eq!(shared.borrow().nibbles_read(), vec![0x96]);
    }
}
