//! Reading flash through a RAM stub
//!
//! The ESP8266 ROM loader has no read-flash command. To read, a small
//! Xtensa program is pushed into IRAM and executed: it pulls blocks off
//! the SPI flash through the ROM's own `SPIRead` and streams each one
//! back as a SLIP frame through the ROM's `send_packet`, then jumps to
//! the reset vector so the chip lands back in the loader.

use log::debug;

use crate::{
    command::Command,
    connection::Connection,
    error::Error,
    flasher::FLASH_WRITE_SIZE,
};

/// Where the stub is loaded in IRAM
const STUB_LOAD_ADDR: u32 = 0x4010_0000;
/// Entry point: first instruction after the parameter and data words
const STUB_ENTRY_ADDR: u32 = 0x4010_001c;

/// Machine code of the read stub. The code expects three u32 parameters
/// (offset, block length, block count) prepended at the load address, and
/// keeps its ROM entry points (send_packet, SPIRead, ResetVector) and a
/// scratch buffer pointer as data words in front of the loop. The blob is
/// pre-assembled; the l32r offsets bake in the exact layout, so keep the
/// bytes as they are.
const READ_FLASH_STUB: [u8; 64] = [
    0x80, 0x3c, 0x00, 0x40, // send_packet
    0x1c, 0x4b, 0x00, 0x40, // SPIRead
    0x80, 0x00, 0x00, 0x40, // ResetVector
    0x00, 0x80, 0xfe, 0x3f, // scratch buffer
    // loop: SPIRead(offset, buffer, block_len); send_packet(buffer,
    // block_len); repeat block_count times, then jump through ResetVector
    0xc1, 0xfb, 0xff, 0xd1, 0xf8, 0xff, 0x2d, 0x0d, 0x31, 0xfd, 0xff, 0x41, 0xf7, 0xff, 0x4a,
    0xdd, 0x51, 0xf9, 0xff, 0xc0, 0x05, 0x00, 0x21, 0xf9, 0xff, 0x31, 0xf3, 0xff, 0x41, 0xf5,
    0xff, 0xc0, 0x04, 0x00, 0x0b, 0xcc, 0x56, 0xec, 0xfd, 0x61, 0xf4, 0xff, 0xa0, 0x06, 0x00,
    0x00, 0x00, 0x00,
];

/// Builds the RAM image: the three parameter words followed by the code.
fn stub_image(offset: u32, block_len: u32, block_count: u32) -> Vec<u8> {
    let mut image = Vec::with_capacity(12 + READ_FLASH_STUB.len());
    image.extend_from_slice(&offset.to_le_bytes());
    image.extend_from_slice(&block_len.to_le_bytes());
    image.extend_from_slice(&block_count.to_le_bytes());
    image.extend_from_slice(&READ_FLASH_STUB);
    image
}

/// Reads `len` bytes of flash starting at `offset`.
///
/// The connection must already be synced with the loader. The stub reboots
/// the chip when it is done, so this ends by syncing with the loader
/// again; afterwards the connection is usable as before.
pub fn read_flash(connection: &mut Connection, offset: u32, len: u32) -> Result<Vec<u8>, Error> {
    debug!("reading {:#x} bytes of flash at {:#x}", len, offset);

    // The loader initializes its SPI state on FLASH_BEGIN, and SPIRead
    // fails without it.
    connection
        .command(Command::FlashBegin {
            erase_size: 0,
            blocks: 0,
            block_size: FLASH_WRITE_SIZE as u32,
            offset: 0,
        })
        .map_err(|_| Error::ReadFlash("failed to initialize flash"))?;

    let stub = stub_image(offset, len, 1);

    connection
        .command(Command::MemBegin {
            size: stub.len() as u32,
            blocks: 1,
            block_size: stub.len() as u32,
            offset: STUB_LOAD_ADDR,
        })
        .map_err(|_| Error::ReadFlash("failed to start writing to RAM"))?;

    connection
        .command(Command::MemData {
            data: &stub,
            pad_to: 0,
            pad_byte: 0xff,
            sequence: 0,
        })
        .map_err(|_| Error::ReadFlash("failed to write to RAM"))?;

    connection
        .command(Command::MemEnd {
            no_entry: false,
            entry: STUB_ENTRY_ADDR,
        })
        .map_err(|_| Error::ReadFlash("failed to run the read stub"))?;

    let mut data = connection.read_frame()?;
    if data.len() < len as usize {
        debug!("short flash read: {} of {} bytes", data.len(), len);
        return Err(Error::ReadFlash("failed to read flash"));
    }
    data.truncate(len as usize);

    // The stub went through the reset vector; make sure the chip is back
    // in the loader before anyone sends the next command.
    connection
        .try_sync(5)
        .map_err(|_| Error::ReadFlash("device did not come back after reading flash"))?;

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_parameters_then_code() {
        let image = stub_image(0x6d000, 0x10000, 1);
        assert_eq!(image.len(), 12 + 64);
        assert_eq!(&image[0..4], 0x6d000u32.to_le_bytes());
        assert_eq!(&image[4..8], 0x10000u32.to_le_bytes());
        assert_eq!(&image[8..12], 1u32.to_le_bytes());
        assert_eq!(&image[12..], &READ_FLASH_STUB);
    }

    #[test]
    fn stub_rom_entry_points() {
        // First three data words are the ROM addresses the stub calls into.
        assert_eq!(&READ_FLASH_STUB[0..4], 0x4000_3c80u32.to_le_bytes());
        assert_eq!(&READ_FLASH_STUB[4..8], 0x4000_4b1cu32.to_le_bytes());
        assert_eq!(&READ_FLASH_STUB[8..12], 0x4000_0080u32.to_le_bytes());
    }
}
