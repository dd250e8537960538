//! ステッパーモーターによるヘッド位置モデル
//!
//! 4つのマグネット（フェーズ）の励磁パターンからローター位置（8方向）を求め、
//! 現在位置からの移動量をクォータートラック単位で算出する。
//! 不正な組み合わせや反対側のフェーズへのジャンプは「動かない」として扱う。

/// 励磁パターン -> ローター位置（-1 = 不正/安定点なし）
#[rustfmt::skip]
const MAGNET_TO_POSITION: [i32; 16] = [
//   0000 0001 0010 0011 0100 0101 0110 0111 1000 1001 1010 1011 1100 1101 1110 1111
       -1,   0,   2,   1,   4,  -1,   3,  -1,   6,   7,  -1,  -1,   5,  -1,  -1,  -1,
];

/// 現在位置 -> 目標位置 の移動量
#[rustfmt::skip]
const POSITION_TO_DIRECTION: [[i32; 8]; 8] = [
//     N  NE   E  SE   S  SW   W  NW
    [  0,  1,  2,  3,  0, -3, -2, -1 ], // 0 N
    [ -1,  0,  1,  2,  3,  0, -3, -2 ], // 1 NE
    [ -2, -1,  0,  1,  2,  3,  0, -3 ], // 2 E
    [ -3, -2, -1,  0,  1,  2,  3,  0 ], // 3 SE
    [  0, -3, -2, -1,  0,  1,  2,  3 ], // 4 S
    [  3,  0, -3, -2, -1,  0,  1,  2 ], // 5 SW
    [  2,  3,  0, -3, -2, -1,  0,  1 ], // 6 W
    [  1,  2,  3,  0, -3, -2, -1,  0 ], // 7 NW
];

/// ヘッド位置とマグネット状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stepper {
    /// 励磁中のフェーズ（bit i = フェーズi）
    phases: u8,
    quarter_track: usize,
    max_quarter_track: usize,
}

impl Stepper {
    pub fn new(tracks: usize) -> Self {
        Stepper {
            phases: 0,
            quarter_track: 0,
            max_quarter_track: (tracks * 4).saturating_sub(1),
        }
    }

    /// フェーズのON/OFF。移動したクォータートラック数（符号付き）を返す
    pub fn set_phase(&mut self, phase: usize, on: bool) -> i32 {
        let bit = 1u8 << (phase & 3);
        if on {
            self.phases |= bit;
        } else {
            self.phases &= !bit;
        }

        let position = MAGNET_TO_POSITION[self.phases as usize];
        if position < 0 {
            return 0;
        }

        let last = self.quarter_track & 7;
        let direction = POSITION_TO_DIRECTION[last][position as usize];
        let target = (self.quarter_track as i32 + direction).clamp(0, self.max_quarter_track as i32) as usize;
        let moved = target as i32 - self.quarter_track as i32;
        self.quarter_track = target;
        moved
    }

    #[inline]
    pub fn quarter_track(&self) -> usize {
        self.quarter_track
    }

    #[inline]
    pub fn track(&self) -> usize {
        self.quarter_track / 4
    }

    #[inline]
    pub fn phases(&self) -> u8 {
        self.phases
    }

    pub fn max_quarter_track(&self) -> usize {
        self.max_quarter_track
    }

    /// 全フェーズをOFF。1本ずつ切った時のような引き込みは起きない
    pub fn release_all(&mut self) {
        self.phases = 0;
    }

    /// ヘッドを直接配置（ディスク差し替え時の位置引き継ぎ用）
    pub fn set_quarter_track(&mut self, quarter_track: usize) {
        self.quarter_track = quarter_track.min(self.max_quarter_track);
    }
}
