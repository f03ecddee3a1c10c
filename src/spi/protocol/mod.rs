/// Protocol module - hardware-independent MMC/SD SPI-mode definitions
///
/// This module defines the command set, tokens and register layouts without
/// depending on any specific transport.

pub mod commands;
pub mod csd;
