use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;

use anyhow::{Result, anyhow};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use libsdmm::file::SdFile;
use libsdmm::{BlockDevice, Control, SECTOR_SIZE};
use libsdmm_tools::{BusArgs, print_card_info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Parser)]
#[command(name = "sd_speedtest", version = "1.0")]
/// Write pseudo-random data to a card, read it back and report throughput
struct Args {
    #[command(flatten)]
    bus: BusArgs,
    /// First sector of the test area
    #[arg(long, default_value_t = 0x10000)]
    start: u64,
    /// Buffer size in KiB
    #[arg(long, default_value_t = 16)]
    kbytes: usize,
    /// Number of buffers written per pass
    #[arg(long, default_value_t = 64)]
    repeats: usize,
    /// RNG seed, random if not set
    #[arg(long)]
    seed: Option<u64>,
}

fn progress(len: u64, msg: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(len).with_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}, eta:{eta}] {msg} {bar:40.cyan/blue} {bytes} / {total_bytes} ({binary_bytes_per_sec})")
            .unwrap(),
    );
    bar.set_message(msg);
    bar
}

fn rate_kib(bytes: usize, start: Instant) -> f64 {
    (bytes as f64 / 1024.0) / start.elapsed().as_secs_f64()
}

/// First differing sector, dumped side by side
fn report_mismatch(expected: &[u8], actual: &[u8], offset: u64) {
    let Some(index) = expected.iter().zip(actual).position(|(a, b)| a != b) else {
        return;
    };
    let sector = index / SECTOR_SIZE;
    let range = sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE;
    println!("[!] Mismatch at byte {:#X}", offset + index as u64);
    println!("    expected: {}", hex::encode(&expected[range.clone()]));
    println!("    actual:   {}", hex::encode(&actual[range]));
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.bus.init_logger()?;

    let bytes = args.kbytes * 1024;
    if bytes == 0 || bytes % SECTOR_SIZE != 0 {
        return Err(anyhow!("Buffer size must be a multiple of {SECTOR_SIZE} bytes"));
    }

    let mut card = args.bus.open_card()?;
    let sectors = print_card_info(&mut card)?;
    let needed = (bytes * args.repeats / SECTOR_SIZE) as u64;
    if args.start + needed > sectors {
        return Err(anyhow!("Test area exceeds card capacity"));
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    println!("[*] Seed {seed:#018X}, buffer {} KiB x {}", args.kbytes, args.repeats);
    let mut buffer = vec![0u8; bytes];
    StdRng::seed_from_u64(seed).fill(&mut buffer[..]);

    let base = args.start * SECTOR_SIZE as u64;
    let total = bytes * args.repeats;
    let mut file = SdFile::open(&mut card)?;

    // Write
    file.seek(SeekFrom::Start(base))?;
    let bar = progress(total as u64, "Writing");
    let start = Instant::now();
    for _ in 0..args.repeats {
        file.write_all(&buffer)?;
        bar.inc(bytes as u64);
    }
    file.flush()?;
    bar.finish_and_clear();
    println!("[+] Written {} KiB at {:.1} KiB/s", total / 1024, rate_kib(total, start));

    // Verify
    file.seek(SeekFrom::Start(base))?;
    let mut readback = vec![0u8; bytes];
    let mut mismatches = 0;
    for i in 0..args.repeats {
        file.read_exact(&mut readback)?;
        if readback != buffer {
            if mismatches == 0 {
                report_mismatch(&buffer, &readback, base + (i * bytes) as u64);
            }
            mismatches += 1;
        }
    }
    if mismatches == 0 {
        println!("[+] Verified");
    } else {
        println!("[!] {mismatches} of {} buffers differ", args.repeats);
    }

    // Read again purely for speed
    file.seek(SeekFrom::Start(base))?;
    let bar = progress(total as u64, "Reading");
    let start = Instant::now();
    for _ in 0..args.repeats {
        file.read_exact(&mut readback)?;
        bar.inc(bytes as u64);
    }
    bar.finish_and_clear();
    println!("[+] Read {} KiB at {:.1} KiB/s", total / 1024, rate_kib(total, start));

    if let Ok(block) = file.ioctl(Control::GetBlockSize) {
        log::info!("Erase block: {block:?}");
    }
    file.close()?;
    println!("[*] Card status after close: {:?}", card.status());

    if mismatches != 0 {
        return Err(anyhow!("Verification failed"));
    }
    Ok(())
}
