//! DSK/DO/PO セクタイメージ
//!
//! 143,360バイトのフラットなセクタイメージを保持し、ヘッドが読むトラックを
//! 必要になった時点でニブル化してキャッシュする。書き込まれたトラックは
//! ダーティフラグを立て、flush時にデニブル化してセクタデータへ戻す。

use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::gcr::{self, SECTOR_SIZE};

/// ディスクの定数
pub const TRACKS: usize = 35;
pub const SECTORS_PER_TRACK: usize = 16;
pub const BYTES_PER_SECTOR: usize = SECTOR_SIZE;
pub const BYTES_PER_TRACK: usize = SECTORS_PER_TRACK * BYTES_PER_SECTOR;
pub const DSK_SIZE: usize = TRACKS * BYTES_PER_TRACK; // 143360 bytes

/// 1トラックのニブル数（300RPMで1周）
pub const NIB_TRACK_SIZE: usize = 6656;

/// ニブル化時のボリューム番号
pub const DEFAULT_VOLUME: u8 = 254;

/// トラック先頭の同期バイト数
const GAP1_LEN: usize = 48;
/// セクタ間の同期バイト数
const GAP3_LEN: usize = 27;

/// DOS 3.3セクターインターリーブ（物理セクタ -> ファイル上のセクタ）
pub const DOS_SECTOR_ORDER: [usize; 16] = [0, 7, 14, 6, 13, 5, 12, 4, 11, 3, 10, 2, 9, 1, 8, 15];

/// ProDOSセクターオーダー（物理セクタ -> ファイル上のセクタ）
pub const PRODOS_SECTOR_ORDER: [usize; 16] = [0, 8, 1, 9, 2, 10, 3, 11, 4, 12, 5, 13, 6, 14, 7, 15];

/// ファイル上のセクタ並び
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectorOrder {
    /// DOS 3.3 論理順 (.dsk / .do)
    Dos,
    /// ProDOS 順 (.po)
    Prodos,
}

impl SectorOrder {
    #[inline]
    pub fn table(self) -> &'static [usize; 16] {
        match self {
            SectorOrder::Dos => &DOS_SECTOR_ORDER,
            SectorOrder::Prodos => &PRODOS_SECTOR_ORDER,
        }
    }

    /// 拡張子からの推定（内容で判定できない場合のみ使う）
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "po" => Some(SectorOrder::Prodos),
            "dsk" | "do" => Some(SectorOrder::Dos),
            _ => None,
        }
    }
}

/// このファイル順で、DOS論理セクタが何番目に格納されているか
fn file_sector_for_dos(logical: usize, order: SectorOrder) -> usize {
    let physical = DOS_SECTOR_ORDER.iter().position(|&s| s == logical).unwrap_or(0);
    order.table()[physical]
}

/// このファイル順で、ProDOSセクタが何番目に格納されているか
fn file_sector_for_prodos(sector: usize, order: SectorOrder) -> usize {
    let physical = PRODOS_SECTOR_ORDER.iter().position(|&s| s == sector).unwrap_or(0);
    order.table()[physical]
}

#[inline]
fn sector_offset(track: usize, file_sector: usize) -> usize {
    track * BYTES_PER_TRACK + file_sector * BYTES_PER_SECTOR
}

/// ProDOSボリュームディレクトリのヘッダ（ブロック2）があるか
fn has_prodos_header(data: &[u8], order: SectorOrder) -> bool {
    let offset = sector_offset(0, file_sector_for_prodos(4, order));
    let block = &data[offset..offset + BYTES_PER_SECTOR];
    // 前ブロック=0、次ブロック=3、ストレージタイプ=$F、名前長>0
    block[0] == 0 && block[1] == 0 && block[2] == 3 && block[3] == 0
        && block[4] & 0xF0 == 0xF0
        && block[4] & 0x0F != 0
}

/// VTOCからカタログのリンクをたどれるか
fn has_dos_catalog(data: &[u8], order: SectorOrder) -> bool {
    const VTOC_TRACK: usize = 17;
    let read = |track: usize, logical: usize, index: usize| {
        data[sector_offset(track, file_sector_for_dos(logical, order)) + index]
    };

    let mut track = read(VTOC_TRACK, 0, 1) as usize;
    let mut sector = read(VTOC_TRACK, 0, 2) as usize;
    if track == 0 || track >= TRACKS || sector == 0 || sector >= SECTORS_PER_TRACK {
        return false;
    }

    // 連続する2つのリンクが同じトラックの1つ前のセクタを指していること
    let mut hops = 0;
    while hops < 2 && sector > 1 {
        let next_track = read(track, sector, 1) as usize;
        let next_sector = read(track, sector, 2) as usize;
        if next_track != track || next_sector + 1 != sector {
            return false;
        }
        track = next_track;
        sector = next_sector;
        hops += 1;
    }
    hops > 0
}

/// 内容からセクタ順を判定（ファイル拡張子を鵜呑みにしない）
pub fn sniff_sector_order(data: &[u8], extension: Option<&str>) -> SectorOrder {
    if data.len() != DSK_SIZE {
        return SectorOrder::Dos;
    }
    if has_prodos_header(data, SectorOrder::Prodos) {
        return SectorOrder::Prodos;
    }
    if has_prodos_header(data, SectorOrder::Dos) {
        return SectorOrder::Dos;
    }
    if has_dos_catalog(data, SectorOrder::Dos) {
        return SectorOrder::Dos;
    }
    if has_dos_catalog(data, SectorOrder::Prodos) {
        return SectorOrder::Prodos;
    }
    extension
        .and_then(SectorOrder::from_extension)
        .unwrap_or(SectorOrder::Dos)
}

/// セクタ順を変換
pub fn reorder_sectors(data: &[u8], from: SectorOrder, to: SectorOrder) -> Vec<u8> {
    if from == to {
        return data.to_vec();
    }
    let mut result = vec![0u8; DSK_SIZE];
    for track in 0..TRACKS {
        for physical in 0..SECTORS_PER_TRACK {
            let src = sector_offset(track, from.table()[physical]);
            let dst = sector_offset(track, to.table()[physical]);
            result[dst..dst + BYTES_PER_SECTOR].copy_from_slice(&data[src..src + BYTES_PER_SECTOR]);
        }
    }
    result
}

/// ニブル化済みトラック
#[derive(Debug, Clone)]
struct TrackBuffer {
    nibbles: Vec<u8>,
    dirty: bool,
}

/// セクタイメージ
#[derive(Debug, Clone)]
pub struct DskImage {
    /// ファイル順のセクタデータ
    data: Vec<u8>,
    order: SectorOrder,
    volume: u8,
    /// 遅延生成されるトラックキャッシュ
    tracks: Vec<Option<TrackBuffer>>,
}

impl DskImage {
    pub fn from_bytes(data: &[u8], order: SectorOrder) -> Result<Self, LoadError> {
        if data.len() != DSK_SIZE {
            return Err(LoadError::BadSize(data.len()));
        }
        Ok(DskImage {
            data: data.to_vec(),
            order,
            volume: DEFAULT_VOLUME,
            tracks: vec![None; TRACKS],
        })
    }

    pub fn order(&self) -> SectorOrder {
        self.order
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// セクタデータからトラックのニブル列を生成
    ///
    /// 物理セクタ0..15の順にギャップ・アドレス・データを並べ、
    /// 末尾を同期バイトで埋めて `NIB_TRACK_SIZE` にそろえる
    pub fn nibblize_track(&self, track: usize) -> Vec<u8> {
        let mut nibbles = Vec::with_capacity(NIB_TRACK_SIZE);
        let table = self.order.table();
        let mut sector = [0u8; BYTES_PER_SECTOR];

        for physical in 0..SECTORS_PER_TRACK {
            let offset = sector_offset(track, table[physical]);
            sector.copy_from_slice(&self.data[offset..offset + BYTES_PER_SECTOR]);
            let gap = if physical == 0 { GAP1_LEN } else { GAP3_LEN };
            nibbles.extend(gcr::build_sector(self.volume, track as u8, physical as u8, &sector, gap));
        }

        nibbles.resize(NIB_TRACK_SIZE, gcr::SYNC);
        nibbles
    }

    fn track_buffer(&mut self, track: usize) -> &mut TrackBuffer {
        let track = track.min(TRACKS - 1);
        if self.tracks[track].is_none() {
            let nibbles = self.nibblize_track(track);
            self.tracks[track] = Some(TrackBuffer { nibbles, dirty: false });
        }
        // 直前で生成済み
        self.tracks[track].get_or_insert_with(|| TrackBuffer { nibbles: Vec::new(), dirty: false })
    }

    /// トラックのニブル列（キャッシュ）
    pub fn track_nibbles(&mut self, track: usize) -> &[u8] {
        &self.track_buffer(track).nibbles
    }

    #[inline]
    pub fn read_nibble(&mut self, track: usize, position: usize) -> u8 {
        let buffer = self.track_buffer(track);
        buffer.nibbles[position % NIB_TRACK_SIZE]
    }

    pub fn write_nibble(&mut self, track: usize, position: usize, nibble: u8) {
        let buffer = self.track_buffer(track);
        buffer.nibbles[position % NIB_TRACK_SIZE] = nibble;
        buffer.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.tracks.iter().flatten().any(|t| t.dirty)
    }

    /// ダーティなトラックを全てデニブル化してセクタデータへ反映
    ///
    /// 戻り値は書き戻したセクタ数
    pub fn flush(&mut self) -> usize {
        let mut written = 0;
        for track in 0..TRACKS {
            let dirty = self.tracks[track].as_ref().is_some_and(|t| t.dirty);
            if dirty {
                written += self.denibblize_track(track);
            }
        }
        written
    }

    /// 1トラック分をデニブル化
    ///
    /// チェックサム不一致やトラック番号違いのセクタは捨て、元の内容を残す
    pub fn denibblize_track(&mut self, track: usize) -> usize {
        let Some(buffer) = self.tracks[track].as_mut() else {
            return 0;
        };
        buffer.dirty = false;

        let table = self.order.table();
        let mut seen = [false; SECTORS_PER_TRACK];
        for decoded in gcr::decode_track(&buffer.nibbles) {
            let physical = decoded.address.sector as usize;
            if decoded.address.track as usize != track {
                log::debug!(
                    "T{}: rejected sector with track number {}",
                    track, decoded.address.track
                );
                continue;
            }
            if physical >= SECTORS_PER_TRACK || seen[physical] {
                continue;
            }
            seen[physical] = true;
            let offset = sector_offset(track, table[physical]);
            self.data[offset..offset + BYTES_PER_SECTOR].copy_from_slice(&decoded.data);
        }

        let written = seen.iter().filter(|&&s| s).count();
        if written < SECTORS_PER_TRACK {
            log::warn!("T{}: only {} of {} sectors could be decoded", track, written, SECTORS_PER_TRACK);
        }
        written
    }

    /// ファイル順のセクタデータ
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// 指定順に並べ替えたセクタデータ
    pub fn to_order(&self, order: SectorOrder) -> Vec<u8> {
        reorder_sectors(&self.data, self.order, order)
    }

    /// 論理セクタを直接読む（セクタ番号はファイル順）
    pub fn read_sector(&self, track: usize, sector: usize) -> Option<&[u8]> {
        if track >= TRACKS || sector >= SECTORS_PER_TRACK {
            return None;
        }
        let offset = sector_offset(track, sector);
        Some(&self.data[offset..offset + BYTES_PER_SECTOR])
    }

    /// 論理セクタを直接書く。キャッシュ済みのトラックは作り直す
    pub fn write_sector(&mut self, track: usize, sector: usize, data: &[u8]) -> bool {
        if track >= TRACKS || sector >= SECTORS_PER_TRACK || data.len() != BYTES_PER_SECTOR {
            return false;
        }
        if self.tracks[track].as_ref().is_some_and(|t| t.dirty) {
            self.denibblize_track(track);
        }
        let offset = sector_offset(track, sector);
        self.data[offset..offset + BYTES_PER_SECTOR].copy_from_slice(data);
        self.tracks[track] = None;
        true
    }
}
