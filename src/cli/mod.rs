//! Types and helpers for the command-line interface
//!
//! Argument types shared between subcommands, serial port resolution and
//! a progress-bar observer for the flashing engine.

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use self::config::Config;
use crate::{error::Error, progress::FlashObserver};

pub mod config;

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to the device
    #[arg(short = 'p', long)]
    pub port: Option<String>,
}

/// Resolves the serial port to use: the command-line argument wins over
/// the configuration file.
pub fn serial_port(args: &ConnectArgs, config: &Config) -> Result<String, Error> {
    args.port
        .clone()
        .or_else(|| config.connection.serial.clone())
        .ok_or(Error::NoSerial)
}

/// Parses a flash offset or size, decimal or 0x-prefixed hex.
pub fn parse_offset(s: &str) -> Result<u32, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|err| err.to_string())
}

/// Reports flashing progress through an indicatif bar.
pub struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    pub fn new(total_blocks: u32) -> Self {
        let bar = ProgressBar::new(total_blocks as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos:>5}/{len:5} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        BarObserver { bar }
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}

impl FlashObserver for BarObserver {
    fn progress(&mut self, written: u32) {
        self.bar.set_position(written as u64);
    }

    fn status(&mut self, message: &str) {
        self.bar.set_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::parse_offset;

    #[test]
    fn offsets_parse_in_both_bases() {
        assert_eq!(parse_offset("0x6d000").unwrap(), 0x6d000);
        assert_eq!(parse_offset("4096").unwrap(), 4096);
        assert!(parse_offset("0xzz").is_err());
        assert!(parse_offset("").is_err());
    }
}
