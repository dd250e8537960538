//! WOZ1/WOZ2 ビットストリームイメージ
//!
//! ヘッダ検証（署名とCRC32）、チャンク（INFO/TMAP/TRKS/META）の解析、
//! クォータートラック単位のビット読み書きを行う。
//! トラックのビット列はロード時に全て展開してメモリに保持する。

use serde::Serialize;

use crate::error::LoadError;

pub const WOZ1_SIGNATURE: &[u8; 4] = b"WOZ1";
pub const WOZ2_SIGNATURE: &[u8; 4] = b"WOZ2";
/// 署名直後の改行チェック用バイト列
const HEADER_TAIL: [u8; 4] = [0xFF, 0x0A, 0x0D, 0x0A];
const HEADER_SIZE: usize = 12;

const INFO_ID: &[u8; 4] = b"INFO";
const TMAP_ID: &[u8; 4] = b"TMAP";
const TRKS_ID: &[u8; 4] = b"TRKS";
const META_ID: &[u8; 4] = b"META";

/// TMAPのエントリ数（40トラック x 4）
pub const TMAP_SIZE: usize = 160;
pub const WOZ_TRACKS: usize = TMAP_SIZE / 4;
/// トラックデータなし
pub const TMAP_EMPTY: u8 = 0xFF;

/// WOZ1 TRKSのトラックレコード
const WOZ1_TRACK_SIZE: usize = 6656;
const WOZ1_BITS_SIZE: usize = 6646;
const WOZ1_BIT_COUNT_OFFSET: usize = 6648;

/// WOZ2 TRKSのエントリ
const WOZ2_TRK_ENTRY_SIZE: usize = 8;
const WOZ2_BLOCK_SIZE: usize = 512;

/// 1ニブル組み立てに使う最大ビット数（壊れたトラック対策）
pub const MAX_NIBBLE_BITS: usize = 64;

/// INFOのdisk_type（1 = 5.25インチ）
const DISK_TYPE_525: u8 = 1;

/// CRC32テーブル (多項式 0xEDB88320)
const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { 0xEDB8_8320 ^ (crc >> 1) } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn crc32(buf: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in buf {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// INFOチャンクの内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WozInfo {
    /// INFOチャンクのバージョン
    pub version: u8,
    pub disk_type: u8,
    pub write_protected: bool,
    pub synchronized: bool,
    pub cleaned: bool,
    pub creator: String,
    // 以下はINFOバージョン2以降
    pub disk_sides: u8,
    pub boot_sector_format: u8,
    /// 1ビットあたりの時間（125ns単位、標準は32 = 4us）
    pub optimal_bit_timing: u8,
    pub compatible_hardware: u16,
    pub required_ram: u16,
    pub largest_track: u16,
}

impl WozInfo {
    fn parse(chunk: &[u8]) -> Result<Self, LoadError> {
        if chunk.len() < 37 {
            return Err(LoadError::TruncatedChunk("INFO".into()));
        }
        let creator = String::from_utf8_lossy(&chunk[5..37]).trim_end().to_string();
        let mut info = WozInfo {
            version: chunk[0],
            disk_type: chunk[1],
            write_protected: chunk[2] == 1,
            synchronized: chunk[3] == 1,
            cleaned: chunk[4] == 1,
            creator,
            optimal_bit_timing: 32,
            ..Default::default()
        };
        if info.version >= 2 && chunk.len() >= 46 {
            info.disk_sides = chunk[37];
            info.boot_sector_format = chunk[38];
            info.optimal_bit_timing = chunk[39];
            info.compatible_hardware = read_u16(chunk, 40);
            info.required_ram = read_u16(chunk, 42);
            info.largest_track = read_u16(chunk, 44);
        }
        Ok(info)
    }

    pub fn boot_sector_format_name(&self) -> &'static str {
        match self.boot_sector_format {
            1 => "16-sector",
            2 => "13-sector",
            3 => "16/13-sector",
            _ => "unknown",
        }
    }
}

/// 1トラック分のビット列
#[derive(Debug, Clone, Default)]
pub struct WozTrack {
    /// MSBファーストのビット列
    bits: Vec<u8>,
    bit_count: usize,
}

impl WozTrack {
    pub fn new(bits: Vec<u8>, bit_count: usize) -> Self {
        let bit_count = bit_count.min(bits.len() * 8);
        WozTrack { bits, bit_count }
    }

    #[inline]
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    #[inline]
    fn bit(&self, index: usize) -> u8 {
        (self.bits[index >> 3] >> (7 - (index & 7))) & 1
    }

    #[inline]
    fn set_bit(&mut self, index: usize, value: u8) {
        let mask = 0x80u8 >> (index & 7);
        if value != 0 {
            self.bits[index >> 3] |= mask;
        } else {
            self.bits[index >> 3] &= !mask;
        }
    }
}

/// WOZイメージ
#[derive(Debug, Clone)]
pub struct WozImage {
    /// 1 または 2
    version: u8,
    info: WozInfo,
    tmap: [u8; TMAP_SIZE],
    tracks: Vec<WozTrack>,
    meta: Vec<(String, String)>,
    modified: bool,
}

impl WozImage {
    /// WOZファイルを解析
    pub fn from_bytes(data: &[u8]) -> Result<Self, LoadError> {
        if data.len() < HEADER_SIZE {
            return Err(LoadError::BadSignature);
        }
        let version = match &data[0..4] {
            s if s == WOZ1_SIGNATURE => 1,
            s if s == WOZ2_SIGNATURE => 2,
            _ => return Err(LoadError::BadSignature),
        };
        if data[4..8] != HEADER_TAIL {
            return Err(LoadError::BadSignature);
        }

        let expected = read_u32(data, 8);
        if expected != 0 {
            let computed = crc32(&data[HEADER_SIZE..]);
            if computed != expected {
                return Err(LoadError::Crc { expected, computed });
            }
        }

        let mut info = None;
        let mut tmap = None;
        let mut trks = None;
        let mut meta = Vec::new();

        let mut pos = HEADER_SIZE;
        while pos + 8 <= data.len() {
            let id = &data[pos..pos + 4];
            let size = read_u32(data, pos + 4) as usize;
            let start = pos + 8;
            let end = start.checked_add(size).filter(|&end| end <= data.len());
            let Some(end) = end else {
                return Err(LoadError::TruncatedChunk(String::from_utf8_lossy(id).into_owned()));
            };
            let chunk = &data[start..end];

            match id {
                id if id == INFO_ID => info = Some(WozInfo::parse(chunk)?),
                id if id == TMAP_ID => {
                    if chunk.len() < TMAP_SIZE {
                        return Err(LoadError::TruncatedChunk("TMAP".into()));
                    }
                    let mut map = [TMAP_EMPTY; TMAP_SIZE];
                    map.copy_from_slice(&chunk[..TMAP_SIZE]);
                    tmap = Some(map);
                }
                id if id == TRKS_ID => trks = Some(chunk),
                id if id == META_ID => meta = parse_meta(chunk),
                _ => log::debug!("WOZ: skipping chunk {}", String::from_utf8_lossy(id)),
            }
            pos = end;
        }

        let info = info.ok_or(LoadError::MissingChunk("INFO"))?;
        let tmap = tmap.ok_or(LoadError::MissingChunk("TMAP"))?;
        let trks = trks.ok_or(LoadError::MissingChunk("TRKS"))?;

        if info.disk_type != DISK_TYPE_525 {
            return Err(LoadError::Unsupported(format!("disk type {}", info.disk_type)));
        }

        let tracks = if version == 1 {
            parse_woz1_tracks(trks)?
        } else {
            parse_woz2_tracks(data, trks)?
        };

        // TMAPが存在しないトラックを指していないか
        for &index in tmap.iter().filter(|&&i| i != TMAP_EMPTY) {
            if index as usize >= tracks.len() {
                return Err(LoadError::InvalidTrack(index as usize));
            }
        }

        log::info!(
            "WOZ{}: {} tracks, creator \"{}\", write protected: {}",
            version, tracks.len(), info.creator, info.write_protected
        );

        Ok(WozImage { version, info, tmap, tracks, meta, modified: false })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn info(&self) -> &WozInfo {
        &self.info
    }

    /// METAチャンクのキーと値
    pub fn meta(&self) -> &[(String, String)] {
        &self.meta
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    fn track(&self, quarter_track: usize) -> Option<&WozTrack> {
        let index = *self.tmap.get(quarter_track)?;
        if index == TMAP_EMPTY {
            return None;
        }
        self.tracks.get(index as usize).filter(|t| t.bit_count > 0)
    }

    fn track_mut(&mut self, quarter_track: usize) -> Option<&mut WozTrack> {
        let index = *self.tmap.get(quarter_track)?;
        if index == TMAP_EMPTY {
            return None;
        }
        self.tracks.get_mut(index as usize).filter(|t| t.bit_count > 0)
    }

    pub fn has_quarter_track(&self, quarter_track: usize) -> bool {
        self.track(quarter_track).is_some()
    }

    /// トラックのビット数（データなしは0）
    pub fn bit_count(&self, quarter_track: usize) -> usize {
        self.track(quarter_track).map_or(0, |t| t.bit_count)
    }

    /// カーソル位置の1ビットを読み、カーソルを進める
    pub fn read_bit(&self, quarter_track: usize, cursor: &mut usize) -> u8 {
        let Some(track) = self.track(quarter_track) else {
            return 0;
        };
        let position = *cursor % track.bit_count;
        *cursor = (position + 1) % track.bit_count;
        track.bit(position)
    }

    /// ビットを順に読み、bit7が立つまでシフトしてニブルを組み立てる
    pub fn read_nibble(&self, quarter_track: usize, cursor: &mut usize) -> u8 {
        let Some(track) = self.track(quarter_track) else {
            return 0x00;
        };
        let mut position = *cursor % track.bit_count;
        let mut value = 0u8;
        for _ in 0..MAX_NIBBLE_BITS {
            value = (value << 1) | track.bit(position);
            position = (position + 1) % track.bit_count;
            if value & 0x80 != 0 {
                break;
            }
        }
        *cursor = position;
        value
    }

    /// カーソル位置からニブルの8ビットを上書き
    pub fn write_nibble(&mut self, quarter_track: usize, cursor: &mut usize, nibble: u8) -> bool {
        let Some(track) = self.track_mut(quarter_track) else {
            return false;
        };
        let mut position = *cursor % track.bit_count;
        for i in (0..8).rev() {
            track.set_bit(position, (nibble >> i) & 1);
            position = (position + 1) % track.bit_count;
        }
        *cursor = position;
        self.modified = true;
        true
    }
}

/// METAチャンク: タブ区切りの "key\tvalue" 行
fn parse_meta(chunk: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(chunk)
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('\t')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_woz1_tracks(chunk: &[u8]) -> Result<Vec<WozTrack>, LoadError> {
    let count = chunk.len() / WOZ1_TRACK_SIZE;
    (0..count)
        .map(|index| {
            let record = &chunk[index * WOZ1_TRACK_SIZE..(index + 1) * WOZ1_TRACK_SIZE];
            let bit_count = read_u16(record, WOZ1_BIT_COUNT_OFFSET) as usize;
            if bit_count > WOZ1_BITS_SIZE * 8 {
                return Err(LoadError::InvalidTrack(index));
            }
            Ok(WozTrack::new(record[..WOZ1_BITS_SIZE].to_vec(), bit_count))
        })
        .collect()
}

fn parse_woz2_tracks(file: &[u8], chunk: &[u8]) -> Result<Vec<WozTrack>, LoadError> {
    if chunk.len() < TMAP_SIZE * WOZ2_TRK_ENTRY_SIZE {
        return Err(LoadError::TruncatedChunk("TRKS".into()));
    }
    (0..TMAP_SIZE)
        .map(|index| {
            let entry = &chunk[index * WOZ2_TRK_ENTRY_SIZE..(index + 1) * WOZ2_TRK_ENTRY_SIZE];
            let start_block = read_u16(entry, 0) as usize;
            let block_count = read_u16(entry, 2) as usize;
            let bit_count = read_u32(entry, 4) as usize;
            if start_block == 0 || block_count == 0 {
                return Ok(WozTrack::default());
            }

            let start = start_block * WOZ2_BLOCK_SIZE;
            let end = start + block_count * WOZ2_BLOCK_SIZE;
            if end > file.len() || bit_count > block_count * WOZ2_BLOCK_SIZE * 8 {
                return Err(LoadError::InvalidTrack(index));
            }
            Ok(WozTrack::new(file[start..end].to_vec(), bit_count))
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::dsk::{testdisk, DskImage, SectorOrder};

    fn sample_tracks() -> Vec<Vec<u8>> {
        let image = DskImage::from_bytes(&testdisk::dos33(), SectorOrder::Dos).unwrap();
        (0..3).map(|t| image.nibblize_track(t)).collect()
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_load_woz2() {
        let file = testwoz::woz2(&sample_tracks(), true, Some("title\tTest Disk\npublisher\tNobody\n"));
        let woz = WozImage::from_bytes(&file).unwrap();
        assert_eq!(woz.version(), 2);
        assert!(woz.info().write_protected);
        assert_eq!(woz.info().creator, "a2disk test");
        assert_eq!(woz.info().boot_sector_format_name(), "16-sector");
        assert_eq!(woz.meta_value("title"), Some("Test Disk"));
        assert_eq!(woz.meta().len(), 2);
        assert_eq!(woz.bit_count(0), 6656 * 8);
        assert_eq!(woz.bit_count(5), 6656 * 8);
        assert!(!woz.has_quarter_track(2 * 4 + 2));
        assert!(!woz.has_quarter_track(20));
    }

    #[test]
    fn test_load_woz1() {
        let woz = WozImage::from_bytes(&testwoz::woz1(&sample_tracks())).unwrap();
        assert_eq!(woz.version(), 1);
        assert_eq!(woz.bit_count(4), WOZ1_BITS_SIZE * 8);
        assert_eq!(woz.info().optimal_bit_timing, 32);
    }

    #[test]
    fn test_short_trks_fails() {
        let result = WozImage::from_bytes(&testwoz::woz2_short_trks());
        assert!(matches!(result, Err(LoadError::TruncatedChunk(ref id)) if id == "TRKS"));
    }

    #[test]
    fn test_crc_mismatch() {
        let mut file = testwoz::woz2(&sample_tracks(), false, None);
        let last = file.len() - 1;
        file[last] ^= 0xFF;
        assert!(matches!(WozImage::from_bytes(&file), Err(LoadError::Crc { .. })));
    }

    #[test]
    fn test_zero_crc_is_not_checked() {
        let mut file = testwoz::woz2(&sample_tracks(), false, None);
        file[8..12].copy_from_slice(&[0; 4]);
        let last = file.len() - 1;
        file[last] ^= 0xFF;
        assert!(WozImage::from_bytes(&file).is_ok());
    }

    #[test]
    fn test_bad_signature() {
        let mut file = testwoz::woz1(&sample_tracks());
        file[3] = b'3';
        assert!(matches!(WozImage::from_bytes(&file), Err(LoadError::BadSignature)));
        assert!(matches!(WozImage::from_bytes(b"WOZ2"), Err(LoadError::BadSignature)));
    }

    #[test]
    fn test_truncated_chunk() {
        let file = testwoz::woz1(&sample_tracks());
        let cut = &file[..file.len() - 100];
        assert!(matches!(WozImage::from_bytes(cut), Err(LoadError::TruncatedChunk(_))));
    }

    #[test]
    fn test_missing_chunk() {
        // INFOとTMAPだけ残す
        let file = testwoz::woz1(&sample_tracks());
        let without_trks = &file[..HEADER_SIZE + 8 + 60 + 8 + TMAP_SIZE];
        assert!(matches!(WozImage::from_bytes(without_trks), Err(LoadError::MissingChunk("TRKS"))));
    }

    #[test]
    fn test_read_nibbles_match_source() {
        let tracks = sample_tracks();
        let woz = WozImage::from_bytes(&testwoz::woz2(&tracks, false, None)).unwrap();
        let mut cursor = 0;
        let read: Vec<u8> = (0..tracks[1].len()).map(|_| woz.read_nibble(4, &mut cursor)).collect();
        assert_eq!(read, tracks[1]);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_read_nibble_resyncs_after_zero_bits() {
        let tracks = vec![vec![0x00, 0x00, 0xD5, 0xAA]];
        let woz = WozImage::from_bytes(&testwoz::woz2(&tracks, false, None)).unwrap();
        let mut cursor = 0;
        assert_eq!(woz.read_nibble(0, &mut cursor), 0xD5);
        assert_eq!(woz.read_nibble(0, &mut cursor), 0xAA);
    }

    #[test]
    fn test_read_nibble_terminates_on_blank_track() {
        let tracks = vec![vec![0x00; 16]];
        let woz = WozImage::from_bytes(&testwoz::woz2(&tracks, false, None)).unwrap();
        let mut cursor = 0;
        assert_eq!(woz.read_nibble(0, &mut cursor), 0x00);
        assert_eq!(cursor, MAX_NIBBLE_BITS % (16 * 8));
    }

    #[test]
    fn test_unmapped_track_reads_zero() {
        let woz = WozImage::from_bytes(&testwoz::woz2(&sample_tracks(), false, None)).unwrap();
        let mut cursor = 7;
        assert_eq!(woz.read_nibble(100, &mut cursor), 0x00);
        assert_eq!(woz.read_bit(100, &mut cursor), 0);
        assert_eq!(cursor, 7);
    }

    #[test]
    fn test_write_nibble() {
        let mut woz = WozImage::from_bytes(&testwoz::woz2(&sample_tracks(), false, None)).unwrap();
        let mut cursor = 16;
        assert!(woz.write_nibble(0, &mut cursor, 0xD5));
        assert_eq!(cursor, 24);
        assert!(woz.is_modified());
        let mut cursor = 16;
        assert_eq!(woz.read_nibble(0, &mut cursor), 0xD5);
        assert!(!woz.write_nibble(100, &mut cursor, 0xD5));
    }
}
