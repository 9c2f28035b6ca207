//! A serial flasher for the ESP8266 ROM bootloader
//!
//! [esploader] drives an ESP8266 into its factory ROM loader over a
//! serial line and programs firmware images into the external SPI flash.
//! The ROM protocol is SLIP framed; reading flash back is done through a
//! small stub pushed into on-chip RAM, since the ROM itself only knows
//! how to write. On top of the raw protocol the engine can preserve the
//! flash chip parameters of the firmware being replaced, compensate for
//! the ROM's double-erase defect, and provision a per-device identity
//! record used by a cloud service.
//!
//! ## As an application
//!
//! ```bash
//! $ cargo install esploader
//! $ esploader flash --port /dev/ttyUSB0 firmware/
//! ```
//!
//! ## As a library
//!
//! ```toml
//! esploader = { version = "0.3", default-features = false }
//! ```
//!
//! Disabling the default features drops the `cli` module and its
//! dependencies, leaving the flashing engine itself: open a
//! [connection::Connection], hand it to a [flasher::Flasher] together
//! with [flasher::FlashOpts], and drive it with an implementation of
//! [progress::FlashObserver].
//!
//! [esploader]: https://crates.io/crates/esploader

#[cfg(feature = "cli")]
pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
#[cfg(feature = "fs-merge")]
pub mod filesystem;
pub mod flasher;
pub mod idblock;
pub mod image;
pub mod progress;
pub mod slip;

pub use crate::error::Error;

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
