//! A2DISK - Apple II Disk II ツール
//!
//! ディスクイメージの情報表示、トラックのニブルダンプ、全セクタの検証、
//! コントローラ経由のセクタ読み取りを行う。
//!
//! # 使用方法
//! ```text
//! a2disk info dos33.dsk
//! a2disk nibbles game.woz --track 17 --count 512
//! a2disk verify prodos.po
//! a2disk sector dos33.dsk --track 17 --sector 0 --disk-log flow+state
//! a2disk status --config a2disk_config.json
//! ```

use std::path::PathBuf;
use std::process;

use a2disk::bus::SlotBus;
use a2disk::config::{self, DiskConfig};
use a2disk::controller::DEFAULT_MOTOR_OFF_DELAY;
use a2disk::disk_log::{DiskLogLevel, LogObserver};
use a2disk::gcr;
use a2disk::image::dsk::{SECTORS_PER_TRACK, DOS_SECTOR_ORDER};
use a2disk::image::DiskImage;
use a2disk::Disk2Card;
use clap::{Parser, Subcommand};

/// A2DISK - Apple II Disk II controller and disk image tool
#[derive(Parser, Debug)]
#[command(name = "a2disk")]
#[command(author = "A2RS Project")]
#[command(version)]
#[command(about = "A2DISK - Apple II Disk II controller and disk image tool", long_about = None)]
struct Args {
    /// ディスクログレベル（flow, state, switch, nibble, all を + で連結）
    #[arg(long, global = true, default_value = "flow")]
    disk_log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// イメージの形式とメタデータを表示
    Info {
        image: PathBuf,
    },
    /// トラックのニブル列を16進ダンプ
    Nibbles {
        image: PathBuf,
        /// トラック番号 (0-39)
        #[arg(short, long, default_value = "0")]
        track: usize,
        /// 表示するニブル数（0 = 1周分）
        #[arg(short, long, default_value = "256")]
        count: usize,
    },
    /// 全トラックの全セクタをデコードして検証
    Verify {
        image: PathBuf,
    },
    /// ソフトスイッチ経由でシーク・読み取りしてセクタを表示
    Sector {
        image: PathBuf,
        #[arg(short, long)]
        track: usize,
        /// DOS 3.3論理セクタ番号
        #[arg(short, long)]
        sector: usize,
    },
    /// 設定からカードを組み立ててステータスをJSONで表示
    Status {
        /// 設定ファイル（省略時は実行ファイルと同じディレクトリ）
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// ディスクログレベルをパース
fn parse_disk_log_level(s: &str) -> DiskLogLevel {
    let parts: Vec<&str> = s.split('+').filter(|p| !p.trim().eq_ignore_ascii_case("none")).collect();
    DiskLogLevel::from_names(&parts)
}

fn load_image(path: &PathBuf) -> DiskImage {
    match DiskImage::load(path) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Failed to load {}: {}", path.display(), e);
            process::exit(1);
        }
    }
}

fn hex_dump(data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
        println!("{:04X}: {}", i * 16, bytes.join(" "));
    }
}

fn cmd_info(path: &PathBuf) {
    let image = load_image(path);
    println!("File:            {}", path.display());
    println!("Format:          {}", image.format_name());
    println!("Tracks:          {}", image.track_count());
    println!("Write protected: {}", image.is_write_protected());
    if let Some(order) = image.sector_order() {
        println!("Sector order:    {:?}", order);
    }
    if let Some(info) = image.woz_info() {
        println!("INFO version:    {}", info.version);
        println!("Creator:         {}", info.creator);
        println!("Synchronized:    {}", info.synchronized);
        println!("Cleaned:         {}", info.cleaned);
        println!("Boot sector:     {}", info.boot_sector_format_name());
        println!("Bit timing:      {} x 125ns", info.optimal_bit_timing);
        let mapped = (0..image.track_count() * 4).filter(|&qt| image.has_quarter_track(qt)).count();
        println!("Quarter tracks:  {} mapped", mapped);
        for (key, value) in image.woz_meta() {
            println!("META {:<11} {}", format!("{}:", key), value);
        }
    }
}

fn cmd_nibbles(path: &PathBuf, track: usize, count: usize) {
    let mut image = load_image(path);
    if track >= image.track_count() {
        eprintln!("Track {} out of range (0-{})", track, image.track_count() - 1);
        process::exit(1);
    }
    let nibbles = image.track_nibbles(track);
    let count = if count == 0 { nibbles.len() } else { count.min(nibbles.len()) };
    println!("Track {}: {} nibbles per revolution", track, nibbles.len());
    hex_dump(&nibbles[..count]);
}

fn cmd_verify(path: &PathBuf) -> bool {
    let mut image = load_image(path);
    let mut bad_tracks = 0;
    let mut total = 0;
    for track in 0..image.track_count() {
        if !image.has_quarter_track(track * 4) {
            continue;
        }
        let sectors = image.decode_track(track);
        let mut found = [false; SECTORS_PER_TRACK];
        for s in &sectors {
            if s.address.track as usize != track {
                println!("T{:02}: sector {} claims track {}", track, s.address.sector, s.address.track);
            } else if let Some(slot) = found.get_mut(s.address.sector as usize) {
                *slot = true;
            }
        }
        let good = found.iter().filter(|&&f| f).count();
        total += good;
        if good < SECTORS_PER_TRACK {
            bad_tracks += 1;
            let missing: Vec<String> = (0..SECTORS_PER_TRACK)
                .filter(|&s| !found[s])
                .map(|s| s.to_string())
                .collect();
            println!("T{:02}: {} of {} sectors, missing {}", track, good, SECTORS_PER_TRACK, missing.join(","));
        }
    }
    println!("{} sectors decoded, {} track(s) with errors", total, bad_tracks);
    bad_tracks == 0
}

/// コントローラをソフトスイッチで操作してセクタを読む（RWTSと同じ手順）
fn cmd_sector(path: &PathBuf, level: DiskLogLevel, track: usize, sector: usize) -> bool {
    if sector >= SECTORS_PER_TRACK {
        eprintln!("Sector {} out of range", sector);
        return false;
    }
    let mut card = Disk2Card::new();
    let controller = card.controller_mut();
    controller.set_observer(Box::new(LogObserver::new(level)));
    if let Err(e) = controller.insert_disk(0, path) {
        eprintln!("Failed to load {}: {}", path.display(), e);
        return false;
    }
    let Ok(mut bus) = SlotBus::new(6, card) else {
        return false;
    };
    let io = *bus.io_range().start();
    let mut now = 0u64;
    let mut access = |bus: &mut SlotBus<Disk2Card>, reg: u16, cycles: u64| {
        now += cycles;
        bus.set_cycle_count(now);
        bus.read(io + reg).unwrap_or(0)
    };

    // モーターON、ドライブ1、読み取りモード
    access(&mut bus, 0x9, 4);
    access(&mut bus, 0xA, 4);
    access(&mut bus, 0xE, 4);

    // 半トラックずつシーク（フェーズnのON = $C0x1 + n*2）
    let mut half = 0usize;
    let target = track * 2;
    access(&mut bus, 0x1, 4);
    while half != target {
        let next = if target > half { half + 1 } else { half - 1 };
        access(&mut bus, ((next & 3) * 2 + 1) as u16, 4);
        access(&mut bus, ((half & 3) * 2) as u16, 2800);
        half = next;
    }
    access(&mut bus, ((half & 3) * 2) as u16, 4);

    // 2周分読んでセクタを探す
    let nibbles: Vec<u8> = (0..6656 * 2).map(|_| access(&mut bus, 0xC, 28)).collect();
    let physical = DOS_SECTOR_ORDER.iter().position(|&s| s == sector).unwrap_or(sector);
    let found = gcr::decode_track(&nibbles)
        .into_iter()
        .find(|s| s.address.track as usize == track && s.address.sector as usize == physical);

    match found {
        Some(s) => {
            println!("T{:02} S{:02} (physical {}), volume {}", track, sector, physical, s.address.volume);
            hex_dump(&s.data);
            true
        }
        None => {
            eprintln!("Sector T{} S{} not found", track, sector);
            false
        }
    }
}

fn cmd_status(config_path: Option<PathBuf>) -> bool {
    let path = config_path.unwrap_or_else(config::get_config_path);
    let config = DiskConfig::load_from(&path);
    if config.motor_off_delay != DEFAULT_MOTOR_OFF_DELAY {
        log::info!("Motor-off delay: {} cycles", config.motor_off_delay);
    }
    let bus = match config.build_bus() {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("Failed to build Disk II card: {}", e);
            return false;
        }
    };
    println!("slot {} (I/O ${:04X}, ROM loaded: {})", bus.slot(), bus.io_range().start(), bus.card().is_rom_loaded());
    match serde_json::to_string_pretty(&bus.card().controller().status()) {
        Ok(json) => {
            println!("{}", json);
            true
        }
        Err(e) => {
            eprintln!("Failed to serialize status: {}", e);
            false
        }
    }
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let level = parse_disk_log_level(&args.disk_log);

    let ok = match args.command {
        Command::Info { image } => {
            cmd_info(&image);
            true
        }
        Command::Nibbles { image, track, count } => {
            cmd_nibbles(&image, track, count);
            true
        }
        Command::Verify { image } => cmd_verify(&image),
        Command::Sector { image, track, sector } => cmd_sector(&image, level, track, sector),
        Command::Status { config } => cmd_status(config),
    };

    if !ok {
        process::exit(1);
    }
}
