//! ディスクイメージ
//!
//! DSK/DO/PO（セクタイメージ）とWOZ1/WOZ2（ビットストリーム）を
//! 1つの `DiskImage` にまとめ、ヘッド位置・回転位置・ニブル読み書きを提供する。
//!
//! 回転位置の単位はフォーマットによって異なる:
//! - DSK: トラック内のニブル位置
//! - WOZ: トラック内のビット位置

pub mod dsk;
pub mod stepper;
pub mod woz;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{DiskError, LoadError};
use crate::gcr;
use dsk::{DskImage, SectorOrder, DSK_SIZE, NIB_TRACK_SIZE, TRACKS};
use stepper::Stepper;
use woz::{WozImage, WozInfo, WOZ_TRACKS};

/// 100ニブルあたりのCPUサイクル数（1ニブル = 30.74サイクル）
pub const CYCLES_PER_100_NIBBLES: u64 = 3074;

/// ディスクイメージ形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskFormat {
    /// DOS 3.3順のセクタイメージ (.dsk/.do)
    Dsk,
    /// ProDOS順のセクタイメージ (.po)
    Po,
    Woz1,
    Woz2,
}

impl DiskFormat {
    pub fn name(self) -> &'static str {
        match self {
            DiskFormat::Dsk => "DSK (DOS order)",
            DiskFormat::Po => "PO (ProDOS order)",
            DiskFormat::Woz1 => "WOZ 1.0",
            DiskFormat::Woz2 => "WOZ 2.0",
        }
    }
}

/// フォーマットごとの実体
#[derive(Debug, Clone)]
pub enum ImageKind {
    Dsk(DskImage),
    Woz(WozImage),
}

/// ドライブに挿入されたディスク
#[derive(Debug, Clone)]
pub struct DiskImage {
    kind: ImageKind,
    path: Option<PathBuf>,
    head: Stepper,
    /// 回転位置（DSK: ニブル, WOZ: ビット）
    cursor: usize,
    /// DSKをビット単位で読む時のニブル内ビット位置
    bit_offset: u8,
    /// 1ユニットに満たない回転の端数（1/3074ユニット単位）
    spin_phase: u64,
    /// 回転より先に読み書きで進めたユニット数（最大1周）
    spin_ahead: usize,
    write_protected: bool,
    /// 最後に保存してから書き込みがあったか
    modified: bool,
}

impl DiskImage {
    /// ファイルからロード
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let mut image = Self::from_bytes(&data, name.as_deref())?;

        // 読み込み専用ファイルはライトプロテクト扱い
        if fs::metadata(path).map(|m| m.permissions().readonly()).unwrap_or(false) {
            image.write_protected = true;
        }
        image.path = Some(path.to_path_buf());
        log::info!("Loaded {} ({})", path.display(), image.format_name());
        Ok(image)
    }

    /// メモリ上のデータから作成（ファイル名は拡張子の判定にのみ使う）
    pub fn from_bytes(data: &[u8], name_hint: Option<&str>) -> Result<Self, LoadError> {
        if data.starts_with(b"WOZ") {
            let woz = WozImage::from_bytes(data)?;
            let write_protected = woz.info().write_protected;
            return Ok(Self::with_kind(ImageKind::Woz(woz), WOZ_TRACKS, write_protected));
        }

        if data.len() != DSK_SIZE {
            return Err(LoadError::BadSize(data.len()));
        }
        let extension = name_hint
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str());
        let order = dsk::sniff_sector_order(data, extension);
        let image = DskImage::from_bytes(data, order)?;
        Ok(Self::with_kind(ImageKind::Dsk(image), TRACKS, false))
    }

    fn with_kind(kind: ImageKind, tracks: usize, write_protected: bool) -> Self {
        DiskImage {
            kind,
            path: None,
            head: Stepper::new(tracks),
            cursor: 0,
            bit_offset: 0,
            spin_phase: 0,
            spin_ahead: 0,
            write_protected,
            modified: false,
        }
    }

    pub fn kind(&self) -> &ImageKind {
        &self.kind
    }

    pub fn is_loaded(&self) -> bool {
        match &self.kind {
            ImageKind::Dsk(_) => true,
            ImageKind::Woz(woz) => (0..woz::TMAP_SIZE).any(|qt| woz.has_quarter_track(qt)),
        }
    }

    pub fn filepath(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> DiskFormat {
        match &self.kind {
            ImageKind::Dsk(dsk) => match dsk.order() {
                SectorOrder::Dos => DiskFormat::Dsk,
                SectorOrder::Prodos => DiskFormat::Po,
            },
            ImageKind::Woz(woz) if woz.version() == 1 => DiskFormat::Woz1,
            ImageKind::Woz(_) => DiskFormat::Woz2,
        }
    }

    pub fn format_name(&self) -> &'static str {
        self.format().name()
    }

    pub fn sector_order(&self) -> Option<SectorOrder> {
        match &self.kind {
            ImageKind::Dsk(dsk) => Some(dsk.order()),
            ImageKind::Woz(_) => None,
        }
    }

    pub fn woz_info(&self) -> Option<&WozInfo> {
        match &self.kind {
            ImageKind::Woz(woz) => Some(woz.info()),
            ImageKind::Dsk(_) => None,
        }
    }

    pub fn woz_meta(&self) -> &[(String, String)] {
        match &self.kind {
            ImageKind::Woz(woz) => woz.meta(),
            ImageKind::Dsk(_) => &[],
        }
    }

    // ========================================
    // ヘッド位置
    // ========================================

    /// フェーズのON/OFF。移動量（クォータートラック）を返す
    pub fn set_phase(&mut self, phase: usize, on: bool) -> i32 {
        let before = self.head.quarter_track();
        let moved = self.head.set_phase(phase, on);
        if moved != 0 {
            self.rescale_cursor(before);
        }
        moved
    }

    /// フェーズマスク全体を反映（モーター始動時など）
    pub fn apply_phases(&mut self, mask: u8) -> i32 {
        let current = self.head.phases();
        (0..4)
            .filter(|&i| (current >> i) & 1 != (mask >> i) & 1)
            .map(|i| self.set_phase(i, (mask >> i) & 1 != 0))
            .sum()
    }

    /// 全マグネットを一度に切る（ヘッドは動かない）
    pub fn release_phases(&mut self) {
        self.head.release_all();
    }

    pub fn phases(&self) -> u8 {
        self.head.phases()
    }

    /// トラック長が異なるWOZトラックへ移った時は同じ角度位置を保つ
    fn rescale_cursor(&mut self, previous_quarter_track: usize) {
        self.bit_offset = 0;
        self.spin_ahead = self.spin_ahead.min(self.track_length());
        if let ImageKind::Woz(woz) = &self.kind {
            let old = woz.bit_count(previous_quarter_track);
            let new = woz.bit_count(self.head.quarter_track());
            if old > 0 && new > 0 && old != new {
                self.cursor = self.cursor * new / old;
            }
        }
    }

    #[inline]
    pub fn quarter_track(&self) -> usize {
        self.head.quarter_track()
    }

    #[inline]
    pub fn track(&self) -> usize {
        self.head.track()
    }

    /// ヘッドを直接配置（差し替え前のディスクの位置を引き継ぐ）
    pub fn set_quarter_track(&mut self, quarter_track: usize) {
        let before = self.head.quarter_track();
        self.head.set_quarter_track(quarter_track);
        self.rescale_cursor(before);
    }

    pub fn track_count(&self) -> usize {
        match &self.kind {
            ImageKind::Dsk(_) => TRACKS,
            ImageKind::Woz(_) => WOZ_TRACKS,
        }
    }

    pub fn has_quarter_track(&self, quarter_track: usize) -> bool {
        match &self.kind {
            ImageKind::Dsk(_) => quarter_track < TRACKS * 4,
            ImageKind::Woz(woz) => woz.has_quarter_track(quarter_track),
        }
    }

    /// WOZトラックのビット数（DSKとデータなしは0）
    pub fn track_bit_count(&self, quarter_track: usize) -> usize {
        match &self.kind {
            ImageKind::Dsk(_) => 0,
            ImageKind::Woz(woz) => woz.bit_count(quarter_track),
        }
    }

    /// 現在のトラックの長さ（回転位置の単位で）
    fn track_length(&self) -> usize {
        match &self.kind {
            ImageKind::Dsk(_) => NIB_TRACK_SIZE,
            ImageKind::Woz(woz) => woz.bit_count(self.head.quarter_track()),
        }
    }

    // ========================================
    // 回転とニブル入出力
    // ========================================

    /// 回転位置
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// 経過サイクル分だけディスクを回す
    ///
    /// 端数は次の呼び出しへ持ち越す。読み書きで先に進めた分は回転から差し引く
    pub fn advance_bit_position(&mut self, elapsed_cycles: u64) {
        let length = self.track_length();
        if length == 0 {
            return;
        }
        let units_per_100 = match self.kind {
            ImageKind::Dsk(_) => 100,
            ImageKind::Woz(_) => 800,
        };
        let total = self.spin_phase + elapsed_cycles.saturating_mul(units_per_100);
        self.spin_phase = total % CYCLES_PER_100_NIBBLES;
        let units = total / CYCLES_PER_100_NIBBLES;

        let repaid = units.min(self.spin_ahead as u64);
        self.spin_ahead -= repaid as usize;
        let units = (units - repaid) % length as u64;
        if units > 0 {
            self.bit_offset = 0;
        }
        self.cursor = ((self.cursor as u64 + units) % length as u64) as usize;
    }

    /// 読み書きでカーソルが進んだ分を記録
    fn consume_from(&mut self, before: usize) {
        let length = self.track_length();
        if length == 0 {
            return;
        }
        let used = (self.cursor + length - before % length) % length;
        self.spin_ahead = (self.spin_ahead + used).min(length);
    }

    /// カーソル位置から次のニブルを読む
    pub fn read_nibble(&mut self) -> u8 {
        let track = self.head.track();
        let quarter_track = self.head.quarter_track();
        let before = self.cursor;
        self.bit_offset = 0;
        let nibble = match &mut self.kind {
            ImageKind::Dsk(dsk) => {
                let nibble = dsk.read_nibble(track, self.cursor);
                self.cursor = (self.cursor + 1) % NIB_TRACK_SIZE;
                nibble
            }
            ImageKind::Woz(woz) => woz.read_nibble(quarter_track, &mut self.cursor),
        };
        self.consume_from(before);
        nibble
    }

    /// カーソル位置から1ビット読む
    pub fn read_bit(&mut self) -> u8 {
        let track = self.head.track();
        let quarter_track = self.head.quarter_track();
        let before = self.cursor;
        let bit = match &mut self.kind {
            ImageKind::Dsk(dsk) => {
                let nibble = dsk.read_nibble(track, self.cursor);
                let bit = (nibble >> (7 - self.bit_offset)) & 1;
                self.bit_offset += 1;
                if self.bit_offset == 8 {
                    self.bit_offset = 0;
                    self.cursor = (self.cursor + 1) % NIB_TRACK_SIZE;
                }
                bit
            }
            ImageKind::Woz(woz) => woz.read_bit(quarter_track, &mut self.cursor),
        };
        self.consume_from(before);
        bit
    }

    /// カーソル位置にニブルを書く。ライトプロテクト中やデータなしならfalse
    pub fn write_nibble(&mut self, nibble: u8) -> bool {
        if self.write_protected {
            return false;
        }
        let track = self.head.track();
        let quarter_track = self.head.quarter_track();
        let before = self.cursor;
        self.bit_offset = 0;
        let written = match &mut self.kind {
            ImageKind::Dsk(dsk) => {
                dsk.write_nibble(track, self.cursor, nibble);
                self.cursor = (self.cursor + 1) % NIB_TRACK_SIZE;
                true
            }
            ImageKind::Woz(woz) => woz.write_nibble(quarter_track, &mut self.cursor, nibble),
        };
        self.consume_from(before);
        self.modified |= written;
        written
    }

    /// 1周分のニブル列（DSKは合成したトラック、WOZはビット列から組み立て）
    pub fn track_nibbles(&mut self, track: usize) -> Vec<u8> {
        match &mut self.kind {
            ImageKind::Dsk(dsk) => dsk.track_nibbles(track).to_vec(),
            ImageKind::Woz(woz) => {
                let quarter_track = track * 4;
                let bits = woz.bit_count(quarter_track);
                let mut cursor = 0;
                let mut nibbles = Vec::with_capacity(bits / 8);
                let mut consumed = 0;
                while consumed < bits {
                    let before = cursor;
                    nibbles.push(woz.read_nibble(quarter_track, &mut cursor));
                    consumed += (cursor + bits - before) % bits;
                    if cursor == before {
                        break;
                    }
                }
                nibbles
            }
        }
    }

    /// トラック上でデコードできたセクタ
    pub fn decode_track(&mut self, track: usize) -> Vec<gcr::DecodedSector> {
        gcr::decode_track(&self.track_nibbles(track))
    }

    // ========================================
    // 保存
    // ========================================

    /// ダーティトラックをセクタデータへ反映
    pub fn flush(&mut self) -> usize {
        match &mut self.kind {
            ImageKind::Dsk(dsk) => dsk.flush(),
            ImageKind::Woz(_) => 0,
        }
    }

    pub fn save(&mut self) -> Result<(), DiskError> {
        let path = self.path.clone().ok_or(DiskError::NoPath)?;
        self.save_as(path)
    }

    /// 指定パスへ保存。拡張子が .po/.do/.dsk ならそのセクタ順で書き出す
    pub fn save_as<P: AsRef<Path>>(&mut self, path: P) -> Result<(), DiskError> {
        let path = path.as_ref();
        let ImageKind::Dsk(dsk) = &mut self.kind else {
            return Err(DiskError::Unsupported("saving WOZ images"));
        };
        dsk.flush();
        let order = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(SectorOrder::from_extension)
            .unwrap_or(dsk.order());
        fs::write(path, dsk.to_order(order))?;
        log::info!("Saved {} ({:?} order)", path.display(), order);

        self.path = Some(path.to_path_buf());
        self.modified = false;
        Ok(())
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    // ========================================
    // セクタ直接アクセス（DSKのみ）
    // ========================================

    /// ファイル順のセクタ番号で読む
    pub fn read_sector(&mut self, track: usize, sector: usize) -> Option<Vec<u8>> {
        match &mut self.kind {
            ImageKind::Dsk(dsk) => {
                if dsk.is_dirty() {
                    dsk.flush();
                }
                dsk.read_sector(track, sector).map(<[u8]>::to_vec)
            }
            ImageKind::Woz(_) => None,
        }
    }

    pub fn write_sector(&mut self, track: usize, sector: usize, data: &[u8]) -> bool {
        if self.write_protected {
            return false;
        }
        let written = match &mut self.kind {
            ImageKind::Dsk(dsk) => dsk.write_sector(track, sector, data),
            ImageKind::Woz(_) => false,
        };
        self.modified |= written;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsk::testdisk;
    use woz::testwoz;

    fn dos_image() -> DiskImage {
        DiskImage::from_bytes(&testdisk::dos33(), Some("test.dsk")).unwrap()
    }

    fn woz_image(tracks: &[Vec<u8>]) -> DiskImage {
        DiskImage::from_bytes(&testwoz::woz2(tracks, false, None), Some("test.woz")).unwrap()
    }

    #[test]
    fn test_from_bytes_formats() {
        assert_eq!(dos_image().format(), DiskFormat::Dsk);
        let po = dsk::reorder_sectors(&testdisk::dos33(), SectorOrder::Dos, SectorOrder::Prodos);
        assert_eq!(DiskImage::from_bytes(&po, Some("x.dsk")).unwrap().format(), DiskFormat::Po);
        assert_eq!(woz_image(&[vec![0xFF; 100]]).format(), DiskFormat::Woz2);
        assert!(matches!(DiskImage::from_bytes(&[0; 512], None), Err(LoadError::BadSize(512))));
    }

    #[test]
    fn test_advance_bit_position_dsk() {
        let mut image = dos_image();
        image.advance_bit_position(30);
        assert_eq!(image.position(), 0);
        image.advance_bit_position(3074);
        assert_eq!(image.position(), 100);
        // ちょうど100周
        image.advance_bit_position(3074 * 6656);
        assert_eq!(image.position(), 100);
    }

    #[test]
    fn test_advance_bit_position_woz() {
        let mut image = woz_image(&[vec![0xFF; 1000]]);
        image.advance_bit_position(3074);
        assert_eq!(image.position(), 800);
        image.advance_bit_position(3074 * 10);
        assert_eq!(image.position(), (800 + 8000) % 8000);
    }

    #[test]
    fn test_rotation_carries_remainder() {
        let mut image = dos_image();
        // 1回では1ニブルに満たない間隔でも合計時間どおりに回る
        for _ in 0..3074 {
            image.advance_bit_position(10);
        }
        assert_eq!(image.position(), 1000);

        let mut woz = woz_image(&[vec![0xFF; 1000]]);
        for _ in 0..3074 {
            woz.advance_bit_position(1);
        }
        assert_eq!(woz.position(), 800);
    }

    #[test]
    fn test_reads_count_against_rotation() {
        let mut image = dos_image();
        image.read_nibble();
        image.read_nibble();
        assert_eq!(image.position(), 2);
        // 93サイクル = 3ニブル。先に読んだ2ニブル分は差し引く
        image.advance_bit_position(93);
        assert_eq!(image.position(), 3);
        image.advance_bit_position(93);
        assert_eq!(image.position(), 6);
    }

    #[test]
    fn test_release_phases_keeps_head() {
        let mut image = dos_image();
        image.apply_phases(0b0011);
        assert_eq!(image.quarter_track(), 1);
        image.release_phases();
        assert_eq!(image.phases(), 0);
        assert_eq!(image.quarter_track(), 1);
    }

    #[test]
    fn test_read_nibble_sequence() {
        let mut image = dos_image();
        let track = image.track_nibbles(0);
        let read: Vec<u8> = (0..track.len()).map(|_| image.read_nibble()).collect();
        assert_eq!(read, track);
        assert_eq!(image.position(), 0);
    }

    #[test]
    fn test_read_bit_dsk_msb_first() {
        let mut image = dos_image();
        // トラック先頭はギャップ(0xFF)
        let bits: Vec<u8> = (0..8).map(|_| image.read_bit()).collect();
        assert_eq!(bits, vec![1; 8]);
        assert_eq!(image.position(), 1);
    }

    #[test]
    fn test_woz_unmapped_reads_zero() {
        let mut image = woz_image(&[vec![0xD5; 100]]);
        for _ in 0..8 {
            image.set_phase(1, true);
            image.set_phase(1, false);
        }
        // qt 2 はTMAPで空
        assert_eq!(image.quarter_track(), 2);
        assert!(!image.has_quarter_track(2));
        assert_eq!(image.read_nibble(), 0x00);
        assert_eq!(image.track_bit_count(2), 0);
        assert_eq!(image.track_bit_count(0), 800);
    }

    #[test]
    fn test_woz_cursor_rescaled_between_tracks() {
        let mut image = woz_image(&[vec![0xFF; 1000], vec![0xFF; 500]]);
        image.advance_bit_position(3074 * 5);
        assert_eq!(image.position(), 4000);
        image.set_quarter_track(4);
        assert_eq!(image.position(), 2000);
    }

    #[test]
    fn test_write_protected_drops_writes() {
        let mut image = dos_image();
        image.set_write_protected(true);
        assert!(!image.write_nibble(0xD5));
        assert!(!image.write_sector(0, 0, &[0; 256]));
        assert!(!image.is_modified());
        assert_eq!(image.position(), 0);
    }

    #[test]
    fn test_woz_write_protect_from_info() {
        let image = DiskImage::from_bytes(&testwoz::woz2(&[vec![0xFF; 10]], true, None), None).unwrap();
        assert!(image.is_write_protected());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dsk");
        fs::write(&path, testdisk::dos33()).unwrap();

        let mut image = DiskImage::load(&path).unwrap();
        assert_eq!(image.filepath(), Some(path.as_path()));
        assert!(image.write_sector(3, 4, &[0x77; 256]));
        assert!(image.is_modified());
        image.save().unwrap();
        assert!(!image.is_modified());

        let mut reloaded = DiskImage::load(&path).unwrap();
        assert_eq!(reloaded.read_sector(3, 4).unwrap(), vec![0x77; 256]);
    }

    #[test]
    fn test_save_as_po_reorders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.po");
        let mut image = dos_image();
        image.save_as(&path).unwrap();
        let saved = fs::read(&path).unwrap();
        assert_eq!(saved, dsk::reorder_sectors(&testdisk::dos33(), SectorOrder::Dos, SectorOrder::Prodos));
        assert_eq!(DiskImage::load(&path).unwrap().format(), DiskFormat::Po);
    }

    #[test]
    fn test_save_without_path() {
        assert!(matches!(dos_image().save(), Err(DiskError::NoPath)));
    }

    #[test]
    fn test_woz_save_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = woz_image(&[vec![0xFF; 10]]);
        assert!(matches!(image.save_as(dir.path().join("x.woz")), Err(DiskError::Unsupported(_))));
    }

    #[test]
    fn test_nibble_writes_flushed_on_read_sector() {
        let mut image = dos_image();
        let mut track = image.track_nibbles(0);
        let sector = gcr::decode_track(&track).into_iter().find(|s| s.address.sector == 0).unwrap();
        let replacement = gcr::build_sector(dsk::DEFAULT_VOLUME, 0, 0, &[0x99; 256], 48);
        track[sector.offset - 48..sector.offset - 48 + replacement.len()].copy_from_slice(&replacement);
        for &n in &track {
            assert!(image.write_nibble(n));
        }
        assert_eq!(image.read_sector(0, 0).unwrap(), vec![0x99; 256]);
    }

    #[test]
    fn test_woz_track_nibbles() {
        let source = DskImage::from_bytes(&testdisk::dos33(), SectorOrder::Dos).unwrap().nibblize_track(0);
        let mut image = woz_image(&[source.clone()]);
        assert_eq!(image.track_nibbles(0), source);
        assert_eq!(image.decode_track(0).len(), 16);
    }
}
