//! スロットI/Oのデコード
//!
//! ホストのメモリバスから見たカードの窓口。
//! - I/O: $C080 + slot*16 .. +$0F （スロット6なら $C0E0-$C0EF）
//! - ROM: $Cn00-$CnFF （スロット6なら $C600-$C6FF）

use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use crate::controller::Disk2Controller;
use crate::error::DiskError;

/// 周辺カード
pub trait SlotCard {
    /// I/O読み取り（addressはフルアドレス）
    fn io_read(&mut self, address: u16, now: u64) -> u8;
    fn io_write(&mut self, address: u16, value: u8, now: u64);
    /// スロットROM ($Cn00 + offset)
    fn rom_read(&self, offset: u8) -> u8;
}

/// CPUサイクルカウンタ
pub trait CycleClock {
    fn cycles(&self) -> u64;
}

impl<F: Fn() -> u64> CycleClock for F {
    fn cycles(&self) -> u64 {
        self()
    }
}

/// Disk IIのブートROMサイズ
pub const BOOT_ROM_SIZE: usize = 256;

/// Disk IIインターフェースカード（コントローラ + P5ブートROM）
#[derive(Debug, Default)]
pub struct Disk2Card {
    controller: Disk2Controller,
    boot_rom: Option<Box<[u8; BOOT_ROM_SIZE]>>,
}

impl Disk2Card {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_controller(controller: Disk2Controller) -> Self {
        Disk2Card { controller, boot_rom: None }
    }

    pub fn controller(&self) -> &Disk2Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Disk2Controller {
        &mut self.controller
    }

    /// ブートROMをロード
    pub fn load_boot_rom(&mut self, data: &[u8]) -> Result<(), DiskError> {
        let rom: [u8; BOOT_ROM_SIZE] = data
            .try_into()
            .map_err(|_| DiskError::InvalidRom("boot ROM must be exactly 256 bytes"))?;
        // Disk II ROMは 0xA2 0x20 で始まる (LDX #$20)
        if rom[0] != 0xA2 || rom[1] != 0x20 {
            return Err(DiskError::InvalidRom("invalid Disk II ROM signature"));
        }
        self.boot_rom = Some(Box::new(rom));
        Ok(())
    }

    pub fn load_boot_rom_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), DiskError> {
        let data = fs::read(path.as_ref())?;
        self.load_boot_rom(&data)?;
        log::info!("Loaded Disk II boot ROM from {}", path.as_ref().display());
        Ok(())
    }

    pub fn is_rom_loaded(&self) -> bool {
        self.boot_rom.is_some()
    }
}

impl SlotCard for Disk2Card {
    #[inline]
    fn io_read(&mut self, address: u16, now: u64) -> u8 {
        self.controller.read(address, now)
    }

    #[inline]
    fn io_write(&mut self, address: u16, value: u8, now: u64) {
        self.controller.write(address, value, now);
    }

    /// 未ロードなら0を返す
    fn rom_read(&self, offset: u8) -> u8 {
        self.boot_rom.as_ref().map_or(0, |rom| rom[offset as usize])
    }
}

/// スロットに挿したカードとアドレスデコーダ
pub struct SlotBus<C: SlotCard> {
    slot: u8,
    card: C,
    /// サイクル源（未設定なら set_cycle_count で渡された値を使う）
    clock: Option<Box<dyn CycleClock>>,
    cycles: u64,
}

impl<C: SlotCard> SlotBus<C> {
    pub fn new(slot: u8, card: C) -> Result<Self, DiskError> {
        if !(1..=7).contains(&slot) {
            return Err(DiskError::InvalidSlot(slot));
        }
        Ok(SlotBus { slot, card, clock: None, cycles: 0 })
    }

    pub fn with_clock<K: CycleClock + 'static>(mut self, clock: K) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// 次のアクセスの時刻をホストから渡す
    pub fn set_cycle_count(&mut self, cycles: u64) {
        self.cycles = cycles;
    }

    pub fn now(&self) -> u64 {
        self.clock.as_ref().map_or(self.cycles, |c| c.cycles())
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn io_range(&self) -> RangeInclusive<u16> {
        let base = 0xC080 + self.slot as u16 * 0x10;
        base..=base + 0x0F
    }

    pub fn rom_range(&self) -> RangeInclusive<u16> {
        let base = 0xC000 + self.slot as u16 * 0x100;
        base..=base + 0xFF
    }

    /// このスロットのアドレスならSome
    pub fn read(&mut self, address: u16) -> Option<u8> {
        if self.io_range().contains(&address) {
            let now = self.now();
            Some(self.card.io_read(address, now))
        } else if self.rom_range().contains(&address) {
            Some(self.card.rom_read((address & 0xFF) as u8))
        } else {
            None
        }
    }

    /// このスロットのI/Oアドレスならtrue（ROMへの書き込みは無視）
    pub fn write(&mut self, address: u16, value: u8) -> bool {
        if self.io_range().contains(&address) {
            let now = self.now();
            self.card.io_write(address, value, now);
            true
        } else {
            self.rom_range().contains(&address)
        }
    }

    pub fn card(&self) -> &C {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut C {
        &mut self.card
    }

    pub fn into_card(self) -> C {
        self.card
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::dsk::testdisk;
    use crate::image::DiskImage;
    use std::cell::Cell;
    use std::rc::Rc;

    fn boot_rom() -> Vec<u8> {
        let mut rom = vec![0xEA; BOOT_ROM_SIZE];
        rom[0] = 0xA2;
        rom[1] = 0x20;
        rom[0xFF] = 0x60;
        rom
    }

    fn disk_card() -> Disk2Card {
        let mut card = Disk2Card::new();
        let image = DiskImage::from_bytes(&testdisk::dos33(), None).unwrap();
        card.controller_mut().insert_image(0, image).unwrap();
        card
    }

    #[test]
    fn test_slot_ranges() {
        let bus = SlotBus::new(6, Disk2Card::new()).unwrap();
        assert_eq!(bus.io_range(), 0xC0E0..=0xC0EF);
        assert_eq!(bus.rom_range(), 0xC600..=0xC6FF);
        let bus = SlotBus::new(5, Disk2Card::new()).unwrap();
        assert_eq!(bus.io_range(), 0xC0D0..=0xC0DF);
        assert!(matches!(SlotBus::new(0, Disk2Card::new()), Err(DiskError::InvalidSlot(0))));
        assert!(matches!(SlotBus::new(8, Disk2Card::new()), Err(DiskError::InvalidSlot(8))));
    }

    #[test]
    fn test_boot_rom() {
        let mut card = Disk2Card::new();
        assert!(!card.is_rom_loaded());
        assert_eq!(card.rom_read(0), 0);

        assert!(matches!(card.load_boot_rom(&[0u8; 256]), Err(DiskError::InvalidRom(_))));
        assert!(matches!(card.load_boot_rom(&[0xA2, 0x20]), Err(DiskError::InvalidRom(_))));
        card.load_boot_rom(&boot_rom()).unwrap();
        assert!(card.is_rom_loaded());

        let mut bus = SlotBus::new(6, card).unwrap();
        assert_eq!(bus.read(0xC600), Some(0xA2));
        assert_eq!(bus.read(0xC6FF), Some(0x60));
        assert_eq!(bus.read(0xC500), None);
        // ROMへの書き込みは受け付けるが何もしない
        assert!(bus.write(0xC600, 0x00));
        assert_eq!(bus.read(0xC600), Some(0xA2));
    }

    #[test]
    fn test_io_routed_with_pushed_cycles() {
        let mut bus = SlotBus::new(6, disk_card()).unwrap();
        bus.set_cycle_count(100);
        assert_eq!(bus.read(0xC0E9), Some(0));
        assert!(bus.card().controller().is_motor_on());
        assert_eq!(bus.read(0xC0D9), None);
        assert!(!bus.write(0xC0D8, 0));

        bus.set_cycle_count(140);
        let nibble = bus.read(0xC0EC).unwrap();
        assert!(nibble & 0x80 != 0);
    }

    #[test]
    fn test_io_with_clock() {
        let clock = Rc::new(Cell::new(0u64));
        let source = clock.clone();
        let mut bus = SlotBus::new(6, disk_card()).unwrap().with_clock(move || source.get());

        clock.set(10);
        bus.write(0xC0E9, 0);
        bus.write(0xC0E8, 0);
        assert!(bus.card().controller().is_motor_off_pending());

        clock.set(10 + crate::controller::DEFAULT_MOTOR_OFF_DELAY);
        assert_eq!(bus.now(), 10 + crate::controller::DEFAULT_MOTOR_OFF_DELAY);
        assert_eq!(bus.read(0xC0EC), Some(0));
        assert!(!bus.card().controller().is_motor_on());
    }
}
