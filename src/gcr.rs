//! GCR (Group Coded Recording) コーデック
//!
//! 4-and-4 (アドレスフィールド) と 6-and-2 (データフィールド) のエンコード/デコード。
//! "Beneath Apple DOS" のフォーマットに準拠。全て状態を持たない純粋関数。

use thiserror::Error;

/// セクタのバイト数
pub const SECTOR_SIZE: usize = 256;
/// 6-and-2 補助バッファのサイズ
pub const AUX_SIZE: usize = 86;
/// 6-and-2 エンコード後のニブル数（チェックサム込み）
pub const ENCODED_SECTOR_SIZE: usize = AUX_SIZE + SECTOR_SIZE + 1;

/// アドレスフィールドのプロローグ
pub const ADDRESS_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0x96];
/// データフィールドのプロローグ
pub const DATA_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0xAD];
/// エピローグ（アドレス/データ共通）
pub const EPILOGUE: [u8; 3] = [0xDE, 0xAA, 0xEB];

/// 同期バイト
pub const SYNC: u8 = 0xFF;
/// セクタ前のギャップの許容範囲
pub const MIN_GAP: usize = 14;
pub const MAX_GAP: usize = 48;
/// アドレスフィールドとデータフィールドの間のギャップ
pub const GAP2_LEN: usize = 6;

/// アドレスフィールド後にデータプロローグを探す範囲
const DATA_SEARCH_WINDOW: usize = 64;

/// 6-and-2エンコーディングテーブル
pub const WRITE_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6,
    0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC,
    0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE,
    0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6,
    0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// 逆引きテーブル（0xFF = 不正ニブル）
const READ_TABLE: [u8; 256] = build_read_table();

const fn build_read_table() -> [u8; 256] {
    let mut table = [0xFFu8; 256];
    let mut i = 0;
    while i < WRITE_TABLE.len() {
        table[WRITE_TABLE[i] as usize] = i as u8;
        i += 1;
    }
    table
}

/// デコードエラー
///
/// 呼び出し側は「ここは目的のセクタではない」とみなしてスキャンを続行する
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GcrError {
    #[error("invalid GCR nibble ${0:02X}")]
    InvalidNibble(u8),
    #[error("checksum mismatch (expected ${expected:02X}, found ${found:02X})")]
    Checksum { expected: u8, found: u8 },
    #[error("field truncated")]
    Truncated,
}

/// 4-and-4 エンコード
///
/// 奇数ビット (D7,D5,D3,D1) と偶数ビット (D6,D4,D2,D0) を 0xAA と合成する
#[inline]
pub fn encode_4and4(value: u8) -> (u8, u8) {
    (0xAA | ((value >> 1) & 0x55), 0xAA | (value & 0x55))
}

/// 4-and-4 デコード（不正入力は検出しない。チェックサムで検証すること）
#[inline]
pub fn decode_4and4(odd: u8, even: u8) -> u8 {
    ((odd << 1) | 1) & even
}

/// 補助バッファ用の2ビットフィールド
///
/// P5 ROMは LSR/ROL を2回繰り返して復元するので D1 と D0 が入れ替わる
#[inline]
fn swap_low_bits(value: u8) -> u8 {
    ((value & 0x01) << 1) | ((value & 0x02) >> 1)
}

/// 6-and-2 エンコード（256バイト -> 343ニブル）
pub fn encode_6and2(data: &[u8; SECTOR_SIZE]) -> [u8; ENCODED_SECTOR_SIZE] {
    let mut values = [0u8; AUX_SIZE + SECTOR_SIZE];

    // 補助バッファ: ストリーム上のk番目が data[k], data[k+86], data[k+172] の下位2ビットを持つ
    for k in 0..AUX_SIZE {
        let mut aux = swap_low_bits(data[k]);
        aux |= swap_low_bits(data[k + AUX_SIZE]) << 2;
        if k + 2 * AUX_SIZE < SECTOR_SIZE {
            aux |= swap_low_bits(data[k + 2 * AUX_SIZE]) << 4;
        }
        values[k] = aux;
    }

    // メインデータ（上位6ビット）
    for (i, &byte) in data.iter().enumerate() {
        values[AUX_SIZE + i] = byte >> 2;
    }

    // XORチェーンとテーブル変換
    let mut out = [0u8; ENCODED_SECTOR_SIZE];
    let mut prev = 0u8;
    for (i, &value) in values.iter().enumerate() {
        out[i] = WRITE_TABLE[((value ^ prev) & 0x3F) as usize];
        prev = value;
    }
    out[ENCODED_SECTOR_SIZE - 1] = WRITE_TABLE[(prev & 0x3F) as usize];
    out
}

/// 6-and-2 デコード（343ニブル -> 256バイト）
pub fn decode_6and2(encoded: &[u8]) -> Result<[u8; SECTOR_SIZE], GcrError> {
    if encoded.len() < ENCODED_SECTOR_SIZE {
        return Err(GcrError::Truncated);
    }

    let mut values = [0u8; AUX_SIZE + SECTOR_SIZE];
    let mut prev = 0u8;
    for (i, value) in values.iter_mut().enumerate() {
        let code = lookup(encoded[i])?;
        *value = code ^ prev;
        prev = *value;
    }

    let checksum = lookup(encoded[ENCODED_SECTOR_SIZE - 1])?;
    if checksum != prev {
        return Err(GcrError::Checksum { expected: prev, found: checksum });
    }

    let (aux, main) = values.split_at(AUX_SIZE);
    let mut data = [0u8; SECTOR_SIZE];
    for (i, byte) in data.iter_mut().enumerate() {
        let bits = (aux[i % AUX_SIZE] >> ((i / AUX_SIZE) * 2)) & 0x03;
        *byte = (main[i] << 2) | swap_low_bits(bits);
    }
    Ok(data)
}

#[inline]
fn lookup(nibble: u8) -> Result<u8, GcrError> {
    match READ_TABLE[nibble as usize] {
        0xFF => Err(GcrError::InvalidNibble(nibble)),
        code => Ok(code),
    }
}

/// セクタ1つ分のニブル列を構築
///
/// 同期ギャップ + アドレスフィールド + ギャップ + データフィールド
pub fn build_sector(volume: u8, track: u8, sector: u8, data: &[u8; SECTOR_SIZE], gap: usize) -> Vec<u8> {
    let gap = gap.clamp(MIN_GAP, MAX_GAP);
    let mut out = Vec::with_capacity(gap + 14 + GAP2_LEN + 3 + ENCODED_SECTOR_SIZE + 3);

    out.resize(gap, SYNC);

    // アドレスフィールド
    out.extend_from_slice(&ADDRESS_PROLOGUE);
    for value in [volume, track, sector, volume ^ track ^ sector] {
        let (odd, even) = encode_4and4(value);
        out.push(odd);
        out.push(even);
    }
    out.extend_from_slice(&EPILOGUE);

    out.extend(std::iter::repeat(SYNC).take(GAP2_LEN));

    // データフィールド
    out.extend_from_slice(&DATA_PROLOGUE);
    out.extend_from_slice(&encode_6and2(data));
    out.extend_from_slice(&EPILOGUE);
    out
}

/// アドレスフィールドの内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressField {
    pub volume: u8,
    pub track: u8,
    pub sector: u8,
    pub checksum: u8,
}

impl AddressField {
    pub fn is_valid(&self) -> bool {
        self.volume ^ self.track ^ self.sector == self.checksum
    }
}

/// 循環トラック上のニブル
#[inline]
fn nibble_at(track: &[u8], index: usize) -> u8 {
    track[index % track.len()]
}

fn matches_at(track: &[u8], index: usize, pattern: &[u8; 3]) -> bool {
    pattern
        .iter()
        .enumerate()
        .all(|(i, &b)| nibble_at(track, index + i) == b)
}

/// プロローグ直後の位置からアドレスフィールドを読む（チェックサム検証付き）
pub fn read_address_field(track: &[u8], at: usize) -> Result<AddressField, GcrError> {
    if track.is_empty() {
        return Err(GcrError::Truncated);
    }
    let pair = |n: usize| decode_4and4(nibble_at(track, at + n * 2), nibble_at(track, at + n * 2 + 1));
    let field = AddressField {
        volume: pair(0),
        track: pair(1),
        sector: pair(2),
        checksum: pair(3),
    };
    if field.is_valid() {
        Ok(field)
    } else {
        Err(GcrError::Checksum {
            expected: field.volume ^ field.track ^ field.sector,
            found: field.checksum,
        })
    }
}

/// `from` 以降で最初の有効なアドレスフィールドを探す（非循環）
///
/// 戻り値はプロローグの位置とフィールド
pub fn find_address_field(nibbles: &[u8], from: usize) -> Option<(usize, AddressField)> {
    let end = nibbles.len().checked_sub(ADDRESS_PROLOGUE.len() + 8)?;
    (from..=end).find_map(|pos| {
        if nibbles[pos..pos + 3] != ADDRESS_PROLOGUE {
            return None;
        }
        read_address_field(&nibbles[..pos + 11], pos + 3).ok().map(|field| (pos, field))
    })
}

/// トラックから読み出したセクタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSector {
    pub address: AddressField,
    /// アドレスプロローグの位置
    pub offset: usize,
    pub data: [u8; SECTOR_SIZE],
}

/// 循環トラックを1周スキャンし、デコードできたセクタを全て返す
///
/// 壊れたフィールドは読み飛ばす
pub fn decode_track(track: &[u8]) -> Vec<DecodedSector> {
    let mut sectors = Vec::new();
    if track.len() < ENCODED_SECTOR_SIZE {
        return sectors;
    }

    let mut encoded = [0u8; ENCODED_SECTOR_SIZE];
    for pos in 0..track.len() {
        if !matches_at(track, pos, &ADDRESS_PROLOGUE) {
            continue;
        }
        let address = match read_address_field(track, pos + 3) {
            Ok(address) => address,
            Err(_) => continue,
        };

        // アドレスフィールド末尾からデータプロローグを探す
        let search_from = pos + 3 + 8;
        let data_pos = (search_from..search_from + DATA_SEARCH_WINDOW)
            .find(|&p| matches_at(track, p, &DATA_PROLOGUE));
        let Some(data_pos) = data_pos else {
            continue;
        };

        for (i, slot) in encoded.iter_mut().enumerate() {
            *slot = nibble_at(track, data_pos + 3 + i);
        }
        if let Ok(data) = decode_6and2(&encoded) {
            sectors.push(DecodedSector { address, offset: pos, data });
        }
    }
    sectors
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn random_sector(rng: &mut StdRng) -> [u8; SECTOR_SIZE] {
        let mut data = [0u8; SECTOR_SIZE];
        rng.fill(&mut data[..]);
        data
    }

    #[test]
    fn test_4and4_all_bytes() {
        for v in 0..=255u8 {
            let (odd, even) = encode_4and4(v);
            assert!(odd & 0x80 != 0 && even & 0x80 != 0);
            // 隣接する0ビットがないこと
            assert!((0..7).all(|i| (odd >> i) & 0b11 != 0));
            assert!((0..7).all(|i| (even >> i) & 0b11 != 0));
            assert_eq!(decode_4and4(odd, even), v);
        }
    }

    #[test]
    fn test_write_table_is_legal() {
        for &n in WRITE_TABLE.iter() {
            assert!(n & 0x80 != 0);
            assert_eq!(READ_TABLE[n as usize] as usize, WRITE_TABLE.iter().position(|&x| x == n).unwrap());
        }
    }

    #[test]
    fn test_6and2_roundtrip_random() {
        let mut rng = StdRng::seed_from_u64(0x6502);
        for _ in 0..200 {
            let data = random_sector(&mut rng);
            let encoded = encode_6and2(&data);
            assert!(encoded.iter().all(|n| READ_TABLE[*n as usize] != 0xFF));
            assert_eq!(decode_6and2(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn test_6and2_roundtrip_patterns() {
        for fill in [0x00u8, 0xFF, 0xA5, 0x03] {
            let data = [fill; SECTOR_SIZE];
            assert_eq!(decode_6and2(&encode_6and2(&data)).unwrap(), data);
        }
        let mut ramp = [0u8; SECTOR_SIZE];
        for (i, b) in ramp.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(decode_6and2(&encode_6and2(&ramp)).unwrap(), ramp);
    }

    #[test]
    fn test_6and2_low_bits_layout() {
        // data[0] = 0x01 -> 最初の補助ニブルの値は 0b10（ビット入れ替え）
        let mut data = [0u8; SECTOR_SIZE];
        data[0] = 0x01;
        let encoded = encode_6and2(&data);
        assert_eq!(encoded[0], WRITE_TABLE[0b10]);
    }

    #[test]
    fn test_6and2_invalid_nibble() {
        let mut encoded = encode_6and2(&[0x42; SECTOR_SIZE]);
        encoded[100] = 0xD5;
        assert_eq!(decode_6and2(&encoded), Err(GcrError::InvalidNibble(0xD5)));
    }

    #[test]
    fn test_6and2_checksum_mismatch() {
        let mut encoded = encode_6and2(&[0x42; SECTOR_SIZE]);
        let last = ENCODED_SECTOR_SIZE - 1;
        encoded[last] = if encoded[last] == 0x96 { 0x97 } else { 0x96 };
        assert!(matches!(decode_6and2(&encoded), Err(GcrError::Checksum { .. })));
    }

    #[test]
    fn test_6and2_truncated() {
        assert_eq!(decode_6and2(&[0x96; 100]), Err(GcrError::Truncated));
    }

    #[test]
    fn test_build_sector_address_field() {
        let data = [0x5Au8; SECTOR_SIZE];
        let nibbles = build_sector(254, 17, 9, &data, 20);
        let (pos, field) = find_address_field(&nibbles, 0).unwrap();
        assert_eq!(pos, 20);
        assert_eq!(field, AddressField { volume: 254, track: 17, sector: 9, checksum: 254 ^ 17 ^ 9 });
        assert_eq!(&nibbles[pos + 11..pos + 14], &EPILOGUE);
    }

    #[test]
    fn test_build_sector_gap_clamped() {
        let data = [0u8; SECTOR_SIZE];
        assert_eq!(find_address_field(&build_sector(1, 0, 0, &data, 0), 0).unwrap().0, MIN_GAP);
        assert_eq!(find_address_field(&build_sector(1, 0, 0, &data, 500), 0).unwrap().0, MAX_GAP);
    }

    #[test]
    fn test_decode_track_skips_corrupt_sector() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_sector(&mut rng);
        let b = random_sector(&mut rng);
        let mut track = build_sector(254, 3, 0, &a, 48);
        let second = track.len();
        track.extend(build_sector(254, 3, 1, &b, 27));
        // セクタ0のデータを破壊
        track[48 + 14 + GAP2_LEN + 3 + 10] = 0x00;

        let sectors = decode_track(&track);
        assert_eq!(sectors.len(), 1);
        assert_eq!(sectors[0].address.sector, 1);
        assert_eq!(sectors[0].offset, second + 27);
        assert_eq!(sectors[0].data, b);
    }

    #[test]
    fn test_decode_track_wraps_around() {
        let data = [0x11u8; SECTOR_SIZE];
        let mut track = build_sector(254, 0, 5, &data, 14);
        // トラック末尾をまたぐように回転
        track.rotate_left(200);
        let sectors = decode_track(&track);
        assert_eq!(sectors.len(), 1);
        assert_eq!(sectors[0].data, data);
    }
}
