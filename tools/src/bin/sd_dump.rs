use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use libsdmm::SECTOR_SIZE;
use libsdmm_tools::{BusArgs, print_card_info};

/// Sectors fetched per multi-block read
const CHUNK_SECTORS: u64 = 32;

/// Copy a sector range of a card into a file
#[derive(Parser)]
#[command(name = "sd_dump", version = "1.0")]
struct Args {
    #[command(flatten)]
    bus: BusArgs,
    /// First sector to dump
    #[arg(long, default_value_t = 0)]
    start: u64,
    /// Number of sectors, defaults to the rest of the card
    #[arg(long)]
    count: Option<u64>,
    /// Output file
    output: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.bus.init_logger()?;

    let mut card = args.bus.open_card()?;
    let sectors = print_card_info(&mut card)?;
    if args.start >= sectors {
        return Err(anyhow!("Start sector {} beyond card end {}", args.start, sectors));
    }
    let count = args.count.unwrap_or(sectors - args.start).min(sectors - args.start);
    let end = args.start + count;

    let mut file = File::create(&args.output)?;
    let progress = ProgressBar::new(count * SECTOR_SIZE as u64).with_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}, eta:{eta}] {bar:40.cyan/blue} {bytes} / {total_bytes} ({binary_bytes_per_sec})")
            .unwrap(),
    );

    println!("[+] Dumping sectors {:#X}..{:#X} to {:?}", args.start, end, args.output);
    let mut buf = vec![0u8; CHUNK_SECTORS as usize * SECTOR_SIZE];
    let mut sector = args.start;
    while sector < end {
        let n = CHUNK_SECTORS.min(end - sector) as usize;
        let chunk = &mut buf[..n * SECTOR_SIZE];
        card.read_sectors(u32::try_from(sector)?, chunk)?;
        file.write_all(chunk)?;
        sector += n as u64;
        progress.inc(chunk.len() as u64);
    }
    progress.finish();

    card.deinitialize()?;
    println!("[*] Done");
    Ok(())
}
