//! Write firmware images to a device
//!
//! The [Flasher] struct owns the serial connection for the duration of a
//! flashing run and sequences the whole operation: force the chip into
//! the ROM loader, settle the flash chip parameters, optionally provision
//! a device identity, write every image and leave the device runnable.

use std::{
    fmt::{Display, Formatter},
    path::Path,
    str::FromStr,
};

use log::{debug, info, warn};
use serialport::SerialPort;
use strum::{Display as EnumDisplay, VariantNames};

use crate::{
    command::Command,
    connection::Connection,
    error::Error,
    idblock,
    image::{ImageMap, BOOT_IMAGE_MAGIC},
    progress::FlashObserver,
};

#[cfg(feature = "fs-merge")]
use crate::filesystem::{FlashFilesystem, SPIFFS_OFFSET, SPIFFS_SIZE};

mod stub;

pub use stub::read_flash;

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;
pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;
pub(crate) const FLASH_WRITE_SIZE: usize = 0x400;

const FLASH_BLOCK_SIZE: usize = 0x10000;
const FLASH_SECTORS_PER_BLOCK: usize = FLASH_BLOCK_SIZE / FLASH_SECTOR_SIZE;

/// Attempts per image before flashing is abandoned
const WRITE_ATTEMPTS: usize = 3;

/// Supported flash addressing modes
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumDisplay, VariantNames)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio = 0,
    /// Quad Output (4 pins used for data)
    Qout = 1,
    /// Dual I/O (2 pins used for address & data)
    Dio = 2,
    /// Dual Output (2 pins used for data)
    Dout = 3,
}

impl FromStr for FlashMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.to_lowercase().as_str() {
            "qio" => FlashMode::Qio,
            "qout" => FlashMode::Qout,
            "dio" => FlashMode::Dio,
            "dout" => FlashMode::Dout,
            _ => return Err(Error::InvalidFlashMode(s.to_string())),
        };

        Ok(mode)
    }
}

/// Supported flash chip sizes, in megabits
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumDisplay, VariantNames)]
#[repr(u8)]
pub enum FlashSize {
    #[strum(serialize = "4m")]
    Flash4M = 0,
    #[strum(serialize = "2m")]
    Flash2M = 1,
    #[strum(serialize = "8m")]
    Flash8M = 2,
    #[strum(serialize = "16m")]
    Flash16M = 3,
    #[strum(serialize = "32m")]
    Flash32M = 4,
    /// 16 Mbit, 1024 KB memory map
    #[strum(serialize = "16m-c1")]
    Flash16MC1 = 5,
    /// 32 Mbit, 1024 KB memory map
    #[strum(serialize = "32m-c1")]
    Flash32MC1 = 6,
    /// 32 Mbit, 2048 KB memory map
    #[strum(serialize = "32m-c2")]
    Flash32MC2 = 7,
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let size = match s.to_lowercase().as_str() {
            "4m" => FlashSize::Flash4M,
            "2m" => FlashSize::Flash2M,
            "8m" => FlashSize::Flash8M,
            "16m" => FlashSize::Flash16M,
            "32m" => FlashSize::Flash32M,
            "16m-c1" => FlashSize::Flash16MC1,
            "32m-c1" => FlashSize::Flash32MC1,
            "32m-c2" => FlashSize::Flash32MC2,
            _ => return Err(Error::InvalidFlashSize(s.to_string())),
        };

        Ok(size)
    }
}

/// Supported flash clock frequencies
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumDisplay, VariantNames)]
#[repr(u8)]
pub enum FlashFrequency {
    #[strum(serialize = "40m")]
    Freq40M = 0,
    #[strum(serialize = "26m")]
    Freq26M = 1,
    #[strum(serialize = "20m")]
    Freq20M = 2,
    #[strum(serialize = "80m")]
    Freq80M = 0xf,
}

impl FromStr for FlashFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let freq = match s.to_lowercase().as_str() {
            "40m" => FlashFrequency::Freq40M,
            "26m" => FlashFrequency::Freq26M,
            "20m" => FlashFrequency::Freq20M,
            "80m" => FlashFrequency::Freq80M,
            _ => return Err(Error::InvalidFlashFrequency(s.to_string())),
        };

        Ok(freq)
    }
}

/// The flash chip parameter word the boot ROM reads out of bytes 2 and 3
/// of the boot image header: `(mode << 8) | (size << 4) | freq`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashParams(u16);

impl FlashParams {
    pub fn new(mode: FlashMode, size: FlashSize, freq: FlashFrequency) -> Self {
        FlashParams(((mode as u16) << 8) | ((size as u16) << 4) | freq as u16)
    }

    /// Builds the word from header bytes 2 and 3, in that order.
    pub fn from_bytes(hi: u8, lo: u8) -> Self {
        FlashParams(((hi as u16) << 8) | lo as u16)
    }

    /// The header bytes, ready to be written back at offsets 2 and 3.
    pub fn to_bytes(self) -> [u8; 2] {
        [(self.0 >> 8) as u8, self.0 as u8]
    }

    pub(crate) fn mode_byte(self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl Display for FlashParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl FromStr for FlashParams {
    type Err = Error;

    /// Parses either a raw integer (any base) or a `mode,size,freq`
    /// triple such as `dio,32m,40m`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split(',').collect::<Vec<_>>();
        match parts.as_slice() {
            [value] => {
                let value =
                    parse_int(value.trim()).ok_or_else(|| Error::InvalidFlashParams(s.to_string()))?;
                Ok(FlashParams((value & 0xffff) as u16))
            }
            [mode, size, freq] => Ok(FlashParams::new(
                mode.trim().parse()?,
                size.trim().parse()?,
                freq.trim().parse()?,
            )),
            _ => Err(Error::InvalidFlashParams(s.to_string())),
        }
    }
}

fn parse_int(s: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (oct, 8)
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (bin, 2)
    } else {
        (s, 10)
    };

    u32::from_str_radix(digits, radix).ok()
}

/// What run() does for its final step
#[derive(Debug, PartialEq, Eq)]
enum FinishAction {
    BootFirmware,
    FlashEnd,
}

/// In DIO mode the ROM switches the flash to read-only on FLASH_END,
/// leaving the device stuck in the loader. Skip FLASH_END there and
/// reset straight into the firmware instead.
fn finish_action(params: Option<FlashParams>) -> FinishAction {
    match params {
        Some(params) if params.mode_byte() == FlashMode::Dio as u8 => FinishAction::BootFirmware,
        _ => FinishAction::FlashEnd,
    }
}

/// Options controlling a flashing run
#[derive(Debug, Clone)]
pub struct FlashOpts {
    /// Carry the flash chip parameters over from the firmware already on
    /// the device instead of trusting the ones in the new boot image.
    pub preserve_flash_params: bool,
    /// Compensate for the ROM's double-erase defect by passing a corrected
    /// erase length to FLASH_BEGIN.
    pub erase_bug_workaround: bool,
    /// Force this flash parameter word, taking precedence over both the
    /// preserved and the bundled values.
    pub override_flash_params: Option<FlashParams>,
    /// Provision an identity block registering with this host if the
    /// device does not carry one yet.
    pub id_hostname: Option<String>,
    /// Merge the on-device filesystem with the bundled one instead of
    /// overwriting it.
    #[cfg(feature = "fs-merge")]
    pub merge_flash_filesystem: bool,
}

impl Default for FlashOpts {
    fn default() -> Self {
        FlashOpts {
            preserve_flash_params: true,
            erase_bug_workaround: true,
            override_flash_params: None,
            id_hostname: None,
            #[cfg(feature = "fs-merge")]
            merge_flash_filesystem: false,
        }
    }
}

pub struct Flasher {
    connection: Connection,
    images: ImageMap,
    opts: FlashOpts,
    #[cfg(feature = "fs-merge")]
    filesystem: Option<Box<dyn FlashFilesystem>>,
}

impl Flasher {
    pub fn new(connection: Connection, opts: FlashOpts) -> Self {
        Flasher {
            connection,
            images: ImageMap::new(),
            opts,
            #[cfg(feature = "fs-merge")]
            filesystem: None,
        }
    }

    /// Loads the images to flash from a directory of `0x*.bin` files.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P) -> Result<(), Error> {
        self.images = ImageMap::load_dir(dir)?;
        Ok(())
    }

    pub fn images(&self) -> &ImageMap {
        &self.images
    }

    /// Total number of write blocks across all loaded images.
    pub fn total_blocks(&self) -> u32 {
        self.images.total_blocks()
    }

    /// Supplies the filesystem implementation used for merging.
    #[cfg(feature = "fs-merge")]
    pub fn with_filesystem(mut self, filesystem: Box<dyn FlashFilesystem>) -> Self {
        self.filesystem = Some(filesystem);
        self
    }

    /// Runs the whole flashing sequence.
    ///
    /// This blocks for anywhere from seconds to minutes, talking to the
    /// device the entire time; call it from a worker thread if a UI needs
    /// to stay responsive. Aborting is done by tearing down the serial
    /// port, which fails the next read.
    pub fn run(&mut self, observer: &mut dyn FlashObserver) -> Result<(), Error> {
        observer.status("Connecting to the bootloader...");
        self.connection
            .enter_bootloader()
            .map_err(|_| Error::BootloaderNotEntered)?;

        let flash_params = match self.opts.override_flash_params {
            Some(params) => Some(params),
            None if self.opts.preserve_flash_params => Some(self.read_flash_params(observer)?),
            None => None,
        };

        // Whatever ends up in the boot image header is what the ROM will
        // see, so it becomes the effective value from here on.
        let flash_params = self.images.patch_boot_params(flash_params);

        #[cfg(feature = "fs-merge")]
        if self.opts.merge_flash_filesystem {
            self.merge_filesystem(observer)?;
        }

        if let Some(hostname) = self.opts.id_hostname.clone() {
            self.provision_id(&hostname, observer)?;
        }

        let mut written = 0u32;
        for (addr, data) in self.images.iter() {
            let rewind = written;
            let mut success = false;

            for attempts_left in (0..WRITE_ATTEMPTS).rev() {
                match Self::write_image(
                    &mut self.connection,
                    &self.opts,
                    addr,
                    data,
                    &mut written,
                    observer,
                ) {
                    Ok(()) => {
                        success = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            "failed to write image at {:#x}: {} ({} attempts left)",
                            addr, err, attempts_left
                        );
                        written = rewind;
                        observer.progress(written);
                        if self.connection.enter_bootloader().is_err() {
                            break;
                        }
                    }
                }
            }

            if !success {
                return Err(Error::WriteRetriesExhausted { addr });
            }
        }

        match finish_action(flash_params) {
            FinishAction::BootFirmware => {
                observer.status("Rebooting into firmware...");
                self.connection.reset_to_firmware()?;
            }
            FinishAction::FlashEnd => self.leave_flash_mode()?,
        }

        Ok(())
    }

    /// Gives the serial port back once flashing is over.
    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.connection.into_serial()
    }

    /// Reads the flash chip parameters out of the header of the firmware
    /// currently on the device.
    fn read_flash_params(&mut self, observer: &mut dyn FlashObserver) -> Result<FlashParams, Error> {
        observer.status("Reading flash params from the device...");
        let header = read_flash(&mut self.connection, 0, 4).map_err(|err| {
            warn!("failed to read the current firmware header: {}", err);
            Error::ReadFlashParams
        })?;

        if header[0] != BOOT_IMAGE_MAGIC {
            warn!("the firmware on the device has no usable header");
            return Err(Error::ReadFlashParams);
        }

        let params = FlashParams::from_bytes(header[2], header[3]);
        info!("current flash params: {}", params);
        Ok(params)
    }

    /// Installs a fresh identity block unless the device already has one.
    fn provision_id(
        &mut self,
        hostname: &str,
        observer: &mut dyn FlashObserver,
    ) -> Result<(), Error> {
        observer.status("Checking for an existing device identity...");
        let block = read_flash(
            &mut self.connection,
            idblock::ID_BLOCK_OFFSET,
            idblock::ID_BLOCK_SIZE as u32,
        )?;

        if idblock::is_present(&block) {
            info!("existing device identity found");
        } else {
            info!("generating a new device identity");
            self.images
                .insert(idblock::ID_BLOCK_OFFSET, idblock::generate(hostname));
        }

        Ok(())
    }

    #[cfg(feature = "fs-merge")]
    fn merge_filesystem(&mut self, observer: &mut dyn FlashObserver) -> Result<(), Error> {
        let filesystem = match self.filesystem.as_ref() {
            Some(filesystem) => filesystem,
            None => {
                warn!("no filesystem implementation supplied, skipping the merge");
                return Ok(());
            }
        };

        warn!("filesystem merging has not been validated end to end");
        observer.status("Merging the on-device filesystem...");

        let device = read_flash(&mut self.connection, SPIFFS_OFFSET, SPIFFS_SIZE)?;
        let bundled = self.images.get(SPIFFS_OFFSET).unwrap_or(&[]);
        let merged = filesystem.merge(&device, bundled)?;

        self.images.insert(SPIFFS_OFFSET, merged);
        info!("merged flash filesystem content");
        Ok(())
    }

    /// Writes one image: a FLASH_BEGIN erasing the target region, then the
    /// data in fixed-size blocks with the tail padded up to a full block.
    fn write_image(
        connection: &mut Connection,
        opts: &FlashOpts,
        addr: u32,
        data: &[u8],
        written: &mut u32,
        observer: &mut dyn FlashObserver,
    ) -> Result<(), Error> {
        let blocks = (data.len() + FLASH_WRITE_SIZE - 1) / FLASH_WRITE_SIZE;
        debug!("writing {} blocks at {:#x}", blocks, addr);
        observer.status(&format!("Erasing flash at {:#x}...", addr));

        let size = blocks * FLASH_WRITE_SIZE;
        let erase_size = if opts.erase_bug_workaround {
            fixup_erase_length(addr as usize, size)
        } else {
            size
        };

        connection.command(Command::FlashBegin {
            erase_size: erase_size as u32,
            blocks: blocks as u32,
            block_size: FLASH_WRITE_SIZE as u32,
            offset: addr,
        })?;

        for (sequence, block) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
            observer.status(&format!("Writing block {}@{:#x}...", sequence, addr));
            connection.command(Command::FlashData {
                data: block,
                pad_to: FLASH_WRITE_SIZE,
                pad_byte: 0xff,
                sequence: sequence as u32,
            })?;
            *written += 1;
            observer.progress(*written);
        }

        Ok(())
    }

    fn leave_flash_mode(&mut self) -> Result<(), Error> {
        match self.connection.command(Command::FlashEnd {
            stay_in_loader: true,
        }) {
            Ok(_) => Ok(()),
            Err(err) if self.opts.erase_bug_workaround => {
                // The corrected erase length makes the loader's own
                // end-of-write bookkeeping come up short, so it reports a
                // failure here even though everything was written.
                debug!("ignoring FLASH_END failure: {}", err);
                Ok(())
            }
            Err(err) => Err(Error::LeaveFlashMode(Box::new(err))),
        }
    }
}

/// Corrects the erase length passed to FLASH_BEGIN for the ROM's
/// double-erase defect.
///
/// The ROM erases a region sector by sector up to the first 64 KB block
/// boundary, then block-wise, but forgets to subtract the head sectors
/// from its running total, so they get erased twice. Passing a shrunken
/// length cancels that out; the worst case (an odd sector count short of
/// twice the head) still erases one extra sector.
pub(crate) fn fixup_erase_length(start: usize, len: usize) -> usize {
    let start_sector = start / FLASH_SECTOR_SIZE;
    let tail_sectors = FLASH_SECTORS_PER_BLOCK - start_sector % FLASH_SECTORS_PER_BLOCK;
    let sectors = (len + FLASH_SECTOR_SIZE - 1) / FLASH_SECTOR_SIZE;

    if sectors <= 2 * tail_sectors {
        (sectors / 2 + sectors % 2) * FLASH_SECTOR_SIZE
    } else {
        len - tail_sectors * FLASH_SECTOR_SIZE
    }
}

pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_folds_over_the_seed() {
        assert_eq!(checksum(&[0x01, 0x02, 0x03], CHECKSUM_INIT), 0xEF);
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
        assert_eq!(checksum(&[0xEF], CHECKSUM_INIT), 0x00);
    }

    #[test]
    fn erase_fixup_at_a_block_boundary() {
        // 16 sectors starting at a block boundary: halved
        assert_eq!(fixup_erase_length(0x10000, 0x4000), 0x2000);
    }

    #[test]
    fn erase_fixup_large_region() {
        // 256 sectors: head sectors subtracted once
        assert_eq!(fixup_erase_length(0x10000, 0x100000), 0xf0000);
    }

    #[test]
    fn erase_fixup_cancels_the_rom_defect() {
        // The ROM ends up erasing f(x) = 2x sectors when x <= t, x + t
        // otherwise, where t is the sector count up to the block boundary.
        // Composed with the fixup it must land on x, or x + 1 for odd
        // x below the fold.
        for tail in 1..=FLASH_SECTORS_PER_BLOCK {
            let start = (FLASH_SECTORS_PER_BLOCK - tail) * FLASH_SECTOR_SIZE;
            for sectors in 1..=4 * FLASH_SECTORS_PER_BLOCK {
                let len = sectors * FLASH_SECTOR_SIZE;
                let passed = fixup_erase_length(start, len) / FLASH_SECTOR_SIZE;
                let erased = if passed <= tail {
                    2 * passed
                } else {
                    passed + tail
                };
                assert!(
                    erased == sectors || erased == sectors + sectors % 2,
                    "start {:#x} sectors {} erased {}",
                    start,
                    sectors,
                    erased
                );
            }
        }
    }

    #[test]
    fn flash_params_from_triple() {
        let params: FlashParams = "dio,32m,40m".parse().unwrap();
        assert_eq!(params, FlashParams::from_bytes(0x02, 0x40));
        assert_eq!(params.to_bytes(), [0x02, 0x40]);
    }

    #[test]
    fn flash_params_from_numbers() {
        assert_eq!(
            "0x0220".parse::<FlashParams>().unwrap(),
            FlashParams::from_bytes(0x02, 0x20)
        );
        assert_eq!(
            "544".parse::<FlashParams>().unwrap(),
            FlashParams::from_bytes(0x02, 0x20)
        );
        // masked to 16 bits
        assert_eq!(
            "0x10240".parse::<FlashParams>().unwrap(),
            FlashParams::from_bytes(0x02, 0x40)
        );
    }

    #[test]
    fn flash_params_rejects_junk() {
        assert!("qio,4m".parse::<FlashParams>().is_err());
        assert!("zio,4m,40m".parse::<FlashParams>().is_err());
        assert!("qio,5m,40m".parse::<FlashParams>().is_err());
        assert!("qio,4m,41m".parse::<FlashParams>().is_err());
        assert!("bogus".parse::<FlashParams>().is_err());
    }

    #[test]
    fn parse_packs_every_alphabet_value() {
        let modes = [("qio", 0u8), ("qout", 1), ("dio", 2), ("dout", 3)];
        let sizes = [
            ("4m", 0u8),
            ("2m", 1),
            ("8m", 2),
            ("16m", 3),
            ("32m", 4),
            ("16m-c1", 5),
            ("32m-c1", 6),
            ("32m-c2", 7),
        ];
        let freqs = [("40m", 0u8), ("26m", 1), ("20m", 2), ("80m", 0xf)];

        for (mode, mode_value) in modes {
            for (size, size_value) in sizes {
                for (freq, freq_value) in freqs {
                    let params: FlashParams =
                        format!("{},{},{}", mode, size, freq).parse().unwrap();
                    assert_eq!(
                        params.to_bytes(),
                        [mode_value, (size_value << 4) | freq_value]
                    );
                }
            }
        }
    }

    #[test]
    fn dio_skips_flash_end() {
        assert_eq!(
            finish_action(Some(FlashParams::from_bytes(0x02, 0x40))),
            FinishAction::BootFirmware
        );
        assert_eq!(
            finish_action(Some(FlashParams::from_bytes(0x00, 0x40))),
            FinishAction::FlashEnd
        );
        assert_eq!(finish_action(None), FinishAction::FlashEnd);
    }
}
