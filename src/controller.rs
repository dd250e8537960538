//! Disk II コントローラ
//!
//! ソフトスイッチ ($C0x0-$C0xF) へのアクセスでのみ状態が変わる。
//! 時間は外部から渡されるCPUサイクル数 `now` だけで決まり、
//! 同じアクセス列なら常に同じ結果になる。

use std::path::Path;

use serde::Serialize;

use crate::disk_log::{DiskEvent, DiskObserver, IgnoreReason};
use crate::error::DiskError;
use crate::image::DiskImage;

/// ドライブ数
pub const DRIVES: usize = 2;

/// motor-offディレイ（サイクル数、約1秒）
pub const DEFAULT_MOTOR_OFF_DELAY: u64 = 1_023_000;

/// モーター停止中・ディスクなしで読んだ時のラッチ値（bit7 = 0）
pub const NOT_READY: u8 = 0x00;

/// ライトプロテクトセンス（bit7）
const WRITE_PROTECT_SENSE: u8 = 0x80;

/// ドライブ1台分
#[derive(Debug, Default)]
pub struct DriveSlot {
    image: Option<DiskImage>,
    /// ユーザー指定のライトプロテクト（イメージ側の指定とOR）
    write_protect: bool,
    /// 最後にデータを読み書きしたサイクル
    last_access_cycle: u64,
    /// ディスクがない時のヘッド位置
    parked_quarter_track: usize,
}

impl DriveSlot {
    pub fn image(&self) -> Option<&DiskImage> {
        self.image.as_ref()
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protect || self.image.as_ref().is_some_and(|i| i.is_write_protected())
    }

    pub fn quarter_track(&self) -> usize {
        self.image
            .as_ref()
            .map_or(self.parked_quarter_track, |i| i.quarter_track())
    }
}

/// ドライブの状態（観測用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveStatus {
    pub loaded: bool,
    pub format: Option<String>,
    pub write_protected: bool,
    pub track: usize,
    pub quarter_track: usize,
    pub path: Option<String>,
    pub modified: bool,
}

/// コントローラの状態（観測用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskStatus {
    pub selected_drive: usize,
    pub motor_on: bool,
    pub motor_off_pending: bool,
    pub phases: u8,
    pub data_latch: u8,
    pub q6: bool,
    pub q7: bool,
    pub drives: Vec<DriveStatus>,
}

/// Disk IIコントローラ
pub struct Disk2Controller {
    drives: [DriveSlot; DRIVES],
    /// 選択されているドライブ (0 or 1)
    selected: usize,
    motor_on: bool,
    /// motor-off予約サイクル
    motor_off_at: Option<u64>,
    motor_off_delay: u64,
    /// マグネット状態（bit i = フェーズi）
    phases: u8,
    /// Q6状態（false=L: シフト, true=H: ロード）
    q6: bool,
    /// Q7状態（false=L: 読み取り, true=H: 書き込み）
    q7: bool,
    data_latch: u8,
    observer: Option<Box<dyn DiskObserver>>,
}

impl Default for Disk2Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Disk2Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk2Controller")
            .field("drives", &self.drives)
            .field("selected", &self.selected)
            .field("motor_on", &self.motor_on)
            .field("motor_off_at", &self.motor_off_at)
            .field("phases", &self.phases)
            .field("q6", &self.q6)
            .field("q7", &self.q7)
            .field("data_latch", &self.data_latch)
            .finish_non_exhaustive()
    }
}

impl Disk2Controller {
    pub fn new() -> Self {
        Disk2Controller {
            drives: [DriveSlot::default(), DriveSlot::default()],
            selected: 0,
            motor_on: false,
            motor_off_at: None,
            motor_off_delay: DEFAULT_MOTOR_OFF_DELAY,
            phases: 0,
            q6: false,
            q7: false,
            data_latch: 0,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn DiskObserver>) {
        self.observer = Some(observer);
    }

    pub fn take_observer(&mut self) -> Option<Box<dyn DiskObserver>> {
        self.observer.take()
    }

    #[inline]
    fn emit(&mut self, event: DiskEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_event(&event);
        }
    }

    pub fn set_motor_off_delay(&mut self, cycles: u64) {
        self.motor_off_delay = cycles;
    }

    pub fn motor_off_delay(&self) -> u64 {
        self.motor_off_delay
    }

    // ========================================
    // ソフトスイッチ
    // ========================================

    /// I/O読み取り ($C0x0-$C0xF)
    pub fn read(&mut self, address: u16, now: u64) -> u8 {
        self.access(address, None, now)
    }

    /// I/O書き込み ($C0x0-$C0xF)
    pub fn write(&mut self, address: u16, value: u8, now: u64) {
        self.access(address, Some(value), now);
    }

    fn access(&mut self, address: u16, value: Option<u8>, now: u64) -> u8 {
        // motor-off予約のチェック
        self.update_motor(now);

        self.emit(DiskEvent::SoftSwitch {
            address,
            is_write: value.is_some(),
            value: value.unwrap_or(0),
        });

        let reg = (address & 0x0F) as u8;
        match reg {
            // Phase 0-3 ステッパーモーター制御
            0x00..=0x07 => self.control_stepper((reg >> 1) as usize, reg & 1 != 0),
            0x08 => self.control_motor(false, now),
            0x09 => self.control_motor(true, now),
            0x0A => self.enable_drive(0, now),
            0x0B => self.enable_drive(1, now),
            // Q6L
            0x0C => {
                self.q6 = false;
                if self.q7 {
                    self.shift_write(now);
                } else {
                    self.fetch_nibble(now);
                }
            }
            // Q6H
            0x0D => {
                self.q6 = true;
                if !self.q7 {
                    self.sense_write_protect();
                }
            }
            // Q7L
            0x0E => self.q7 = false,
            // Q7H (0x0F)
            _ => self.q7 = true,
        }

        // ロード + 書き込みモードならラッチに値を設定
        if let Some(value) = value {
            if self.q6 && self.q7 {
                self.data_latch = value;
            }
        }

        if reg & 1 == 0 {
            if self.is_ready() {
                self.data_latch
            } else {
                NOT_READY
            }
        } else if reg == 0x0D && !self.q7 {
            self.data_latch
        } else {
            // 奇数アドレスはフローティングバス
            0x00
        }
    }

    /// ライトプロテクト状態をラッチのbit7へ（続く偶数アドレスの読み出しでも見える）
    fn sense_write_protect(&mut self) {
        let slot = &self.drives[self.selected];
        self.data_latch = if slot.image.is_some() && slot.is_write_protected() {
            WRITE_PROTECT_SENSE
        } else {
            0x00
        };
    }

    fn is_ready(&self) -> bool {
        self.motor_on && self.drives[self.selected].image.is_some()
    }

    /// 予約されたmotor-offの期限が来ていれば止める
    pub fn update_motor(&mut self, now: u64) {
        if let Some(at) = self.motor_off_at {
            if now >= at {
                self.motor_off_at = None;
                self.motor_on = false;
                if let Some(image) = self.drives[self.selected].image.as_mut() {
                    image.flush();
                }
                let drive = self.selected;
                self.emit(DiskEvent::MotorOff { drive });
            }
        }
    }

    /// モーター制御
    fn control_motor(&mut self, on: bool, now: u64) {
        let drive = self.selected;
        if on {
            // 予約されていたOFFをキャンセル
            self.motor_off_at = None;
            if !self.motor_on {
                self.motor_on = true;
                self.drives[drive].last_access_cycle = now;
                self.sync_head(drive);
                self.emit(DiskEvent::MotorOn { drive });
            }
        } else if self.motor_on && self.motor_off_at.is_none() {
            // 即座にOFFせず予約（フライホイールの慣性）
            let at = now.saturating_add(self.motor_off_delay);
            self.motor_off_at = Some(at);
            self.emit(DiskEvent::MotorOffPending { drive, at });
        }
    }

    /// ドライブ選択
    fn enable_drive(&mut self, drive: usize, now: u64) {
        if drive == self.selected {
            return;
        }
        if let Some(image) = self.drives[self.selected].image.as_mut() {
            image.flush();
        }
        self.selected = drive;
        self.drives[drive].last_access_cycle = now;
        if self.motor_on {
            self.sync_head(drive);
        }
        self.emit(DiskEvent::DriveSelected { drive });
    }

    /// ステッパーモーター制御
    fn control_stepper(&mut self, phase: usize, on: bool) {
        let bit = 1u8 << phase;
        if on {
            self.phases |= bit;
        } else {
            self.phases &= !bit;
        }

        if !self.motor_on {
            return;
        }
        let drive = self.selected;
        let Some(image) = self.drives[drive].image.as_mut() else {
            return;
        };
        let from = image.quarter_track();
        if image.set_phase(phase, on) != 0 {
            let to = image.quarter_track();
            self.emit(DiskEvent::TrackChanged { drive, from, to });
        }
    }

    /// モーター停止中に変わったマグネット状態をヘッドへ反映
    fn sync_head(&mut self, drive: usize) {
        let phases = self.phases;
        let Some(image) = self.drives[drive].image.as_mut() else {
            return;
        };
        let from = image.quarter_track();
        if image.apply_phases(phases) != 0 {
            let to = image.quarter_track();
            self.emit(DiskEvent::TrackChanged { drive, from, to });
        }
    }

    /// 前回のアクセスからの経過時間分ディスクを回す
    fn rotate(slot: &mut DriveSlot, now: u64) {
        let elapsed = now.saturating_sub(slot.last_access_cycle);
        slot.last_access_cycle = now;
        if let Some(image) = slot.image.as_mut() {
            image.advance_bit_position(elapsed);
        }
    }

    /// 読み取り: 次のニブルをラッチへ
    fn fetch_nibble(&mut self, now: u64) {
        if !self.is_ready() {
            return;
        }
        let drive = self.selected;
        let slot = &mut self.drives[drive];
        Self::rotate(slot, now);
        let Some(image) = slot.image.as_mut() else {
            return;
        };
        let position = image.position();
        let track = image.track();
        let nibble = image.read_nibble() | 0x80;
        self.data_latch = nibble;
        self.emit(DiskEvent::NibbleRead { drive, nibble, track, position });
    }

    /// 書き込み: ラッチの値をディスクへ
    fn shift_write(&mut self, now: u64) {
        let drive = self.selected;
        let reason = if self.drives[drive].image.is_none() {
            Some(IgnoreReason::NoDisk)
        } else if !self.motor_on {
            Some(IgnoreReason::MotorOff)
        } else if self.drives[drive].is_write_protected() {
            Some(IgnoreReason::WriteProtected)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.emit(DiskEvent::WriteIgnored { drive, reason });
            return;
        }

        let nibble = self.data_latch;
        let slot = &mut self.drives[drive];
        Self::rotate(slot, now);
        let Some(image) = slot.image.as_mut() else {
            return;
        };
        let position = image.position();
        let track = image.track();
        if image.write_nibble(nibble) {
            self.emit(DiskEvent::NibbleWritten { drive, nibble, track, position });
        } else {
            self.emit(DiskEvent::WriteIgnored { drive, reason: IgnoreReason::NoTrackData });
        }
    }

    // ========================================
    // リセット
    // ========================================

    /// ソフトリセット: 読み取りモードに戻すだけ
    pub fn soft_reset(&mut self) {
        self.q7 = false;
    }

    /// 電源再投入: ラッチ類を全てクリア（ディスクとヘッド位置は維持）
    pub fn power_cycle(&mut self) {
        for slot in &mut self.drives {
            if let Some(image) = slot.image.as_mut() {
                image.flush();
                image.release_phases();
            }
            slot.last_access_cycle = 0;
        }
        self.selected = 0;
        self.motor_on = false;
        self.motor_off_at = None;
        self.phases = 0;
        self.q6 = false;
        self.q7 = false;
        self.data_latch = 0;
    }

    // ========================================
    // ディスク操作
    // ========================================

    fn check_drive(drive: usize) -> Result<(), DiskError> {
        if drive < DRIVES {
            Ok(())
        } else {
            Err(DiskError::InvalidDrive(drive))
        }
    }

    /// ファイルからディスクを挿入。失敗時は元のディスクはそのまま
    pub fn insert_disk<P: AsRef<Path>>(&mut self, drive: usize, path: P) -> Result<(), DiskError> {
        Self::check_drive(drive)?;
        let image = DiskImage::load(path)?;
        self.insert_image(drive, image)
    }

    /// イメージを挿入（ヘッド位置は差し替え前のものを引き継ぐ）
    pub fn insert_image(&mut self, drive: usize, mut image: DiskImage) -> Result<(), DiskError> {
        Self::check_drive(drive)?;
        self.eject(drive)?;

        let slot = &mut self.drives[drive];
        image.set_quarter_track(slot.parked_quarter_track);
        let format = image.format();
        slot.image = Some(image);
        if self.motor_on && drive == self.selected {
            self.sync_head(drive);
        }
        self.emit(DiskEvent::DiskInserted { drive, format });
        Ok(())
    }

    /// ディスクを取り出す。変更があり保存先があれば保存する
    pub fn eject(&mut self, drive: usize) -> Result<Option<DiskImage>, DiskError> {
        Self::check_drive(drive)?;
        let slot = &mut self.drives[drive];
        let Some(image) = slot.image.as_mut() else {
            return Ok(None);
        };
        image.flush();
        if image.is_modified() && image.filepath().is_some() {
            image.save()?;
        }
        slot.parked_quarter_track = image.quarter_track();
        let image = slot.image.take();
        self.emit(DiskEvent::DiskEjected { drive });
        Ok(image)
    }

    /// ドライブ1と2のディスクを入れ替え（ヘッドはドライブ側に残る）
    pub fn swap_disks(&mut self) {
        let heads = [self.drives[0].quarter_track(), self.drives[1].quarter_track()];
        let [first, second] = &mut self.drives;
        std::mem::swap(&mut first.image, &mut second.image);
        for (slot, head) in self.drives.iter_mut().zip(heads) {
            slot.parked_quarter_track = head;
            if let Some(image) = slot.image.as_mut() {
                image.flush();
                image.set_quarter_track(head);
            }
        }
        log::info!("Disks swapped: Drive1 <-> Drive2");
    }

    pub fn set_write_protect(&mut self, drive: usize, on: bool) -> Result<(), DiskError> {
        Self::check_drive(drive)?;
        self.drives[drive].write_protect = on;
        Ok(())
    }

    // ========================================
    // 状態参照
    // ========================================

    pub fn drive(&self, drive: usize) -> Option<&DriveSlot> {
        self.drives.get(drive)
    }

    pub fn image(&self, drive: usize) -> Option<&DiskImage> {
        self.drives.get(drive)?.image.as_ref()
    }

    pub fn image_mut(&mut self, drive: usize) -> Option<&mut DiskImage> {
        self.drives.get_mut(drive)?.image.as_mut()
    }

    pub fn selected_drive(&self) -> usize {
        self.selected
    }

    pub fn is_motor_on(&self) -> bool {
        self.motor_on
    }

    pub fn is_motor_off_pending(&self) -> bool {
        self.motor_off_at.is_some()
    }

    pub fn phases(&self) -> u8 {
        self.phases
    }

    pub fn data_latch(&self) -> u8 {
        self.data_latch
    }

    pub fn status(&self) -> DiskStatus {
        let drives = self
            .drives
            .iter()
            .map(|slot| {
                let image = slot.image.as_ref();
                let quarter_track = slot.quarter_track();
                DriveStatus {
                    loaded: image.is_some(),
                    format: image.map(|i| i.format_name().to_string()),
                    write_protected: slot.is_write_protected(),
                    track: quarter_track / 4,
                    quarter_track,
                    path: image
                        .and_then(|i| i.filepath())
                        .map(|p| p.display().to_string()),
                    modified: image.is_some_and(|i| i.is_modified()),
                }
            })
            .collect();

        DiskStatus {
            selected_drive: self.selected,
            motor_on: self.motor_on,
            motor_off_pending: self.motor_off_at.is_some(),
            phases: self.phases,
            data_latch: self.data_latch,
            q6: self.q6,
            q7: self.q7,
            drives,
        }
    }
}

impl Drop for Disk2Controller {
    fn drop(&mut self) {
        for (drive, slot) in self.drives.iter_mut().enumerate() {
            let Some(image) = slot.image.as_mut() else {
                continue;
            };
            image.flush();
            if image.is_modified() && image.filepath().is_some() {
                if let Err(e) = image.save() {
                    log::error!("Drive {}: failed to save disk image: {}", drive + 1, e);
                }
            }
        }
    }
}
