use anyhow::{Result, anyhow};
use clap::Args;
use libsdmm::spi::backend::LinePins;
use libsdmm::spi::backend::ftdi::FtdiBitBang;
use libsdmm::time::StdClock;
use libsdmm::{DiskStatus, SdCard};

pub type Card = SdCard<FtdiBitBang, StdClock>;

/// Where the card is wired
#[derive(Args, Debug)]
pub struct BusArgs {
    /// FTDI port description
    #[arg(long, default_value = "FT4232H A")]
    pub device: String,
    /// Clock pin
    #[arg(long, default_value_t = 0)]
    pub clk: u8,
    /// Data-in (MOSI) pin
    #[arg(long, default_value_t = 1)]
    pub di: u8,
    /// Data-out (MISO) pin
    #[arg(long = "do", default_value_t = 2)]
    pub data_out: u8,
    /// Chip select pin
    #[arg(long, default_value_t = 3)]
    pub cs: u8,
    /// Log level
    #[arg(long, default_value = "warn")]
    pub log_level: log::Level,
}

impl BusArgs {
    pub fn init_logger(&self) -> Result<()> {
        simple_logger::init_with_level(self.log_level)?;
        Ok(())
    }

    /// Open the FTDI port and bring up the card
    pub fn open_card(&self) -> Result<Card> {
        let pins = LinePins::configure(self.clk, self.cs, self.di, self.data_out)?;
        let bus = FtdiBitBang::open(&self.device, pins)?;
        let mut card = SdCard::new(bus, StdClock);

        println!("[+] Initializing card...");
        if card.initialize() != DiskStatus::Ready {
            return Err(anyhow!("Card initialization failed"));
        }
        Ok(card)
    }
}

/// Print card type and capacity, returns the sector count
pub fn print_card_info(card: &mut Card) -> Result<u64> {
    let sectors = card.capacity_in_sectors()?;
    println!(
        "[+] Card: {:?}, {} sectors ({} MiB)",
        card.card_type(),
        sectors,
        sectors / 2048
    );
    Ok(sectors)
}
