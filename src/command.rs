//! Commands understood by the ESP8266 ROM loader
//!
//! A request frame is `[0x00][cmd][len:u16 LE][checksum:u32 LE]` followed by
//! `len` bytes of payload, the whole thing SLIP encoded. Only the data-block
//! commands carry a checksum; everywhere else the field is zero.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{checksum, CHECKSUM_INIT};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request direction byte
const DIR_REQUEST: u8 = 0x00;

/// Sync preamble: a recognizable header plus a train of 0x55 for the
/// loader's baud rate detection
const SYNC_PAYLOAD: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
];

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    ReadReg = 0x0a,
}

impl CommandType {
    /// Response timeout for this command.
    ///
    /// FLASH_BEGIN erases the whole target region before answering, which
    /// on a large image takes tens of seconds.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::FlashBegin => ERASE_TIMEOUT,
            CommandType::FlashData | CommandType::FlashEnd => WRITE_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        erase_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        stay_in_loader: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    Sync,
    ReadReg {
        address: u32,
    },
}

impl<'a> Command<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.command_type().timeout()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[DIR_REQUEST, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                erase_size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, erase_size, blocks, block_size, offset)?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashEnd { stay_in_loader } => {
                write_basic(writer, &(stay_in_loader as u32).to_le_bytes(), 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::MemData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: no_entry as u32,
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_PAYLOAD, 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
    };

    write_basic(writer, bytes_of(&params), 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: Command) -> Vec<u8> {
        let mut out = Vec::new();
        command.write(&mut out).unwrap();
        out
    }

    #[test]
    fn sync_frame() {
        let bytes = frame(Command::Sync);
        assert_eq!(&bytes[..8], &[0x00, 0x08, 0x24, 0x00, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(bytes[12..].iter().all(|b| *b == 0x55));
        assert_eq!(bytes.len(), 8 + 36);
    }

    #[test]
    fn read_reg_frame() {
        let bytes = frame(Command::ReadReg {
            address: 0x3ff0_0050,
        });
        assert_eq!(
            bytes,
            [0x00, 0x0a, 0x04, 0x00, 0, 0, 0, 0, 0x50, 0x00, 0xf0, 0x3f]
        );
    }

    #[test]
    fn flash_begin_frame() {
        let bytes = frame(Command::FlashBegin {
            erase_size: 0x2000,
            blocks: 16,
            block_size: 0x400,
            offset: 0x10000,
        });
        assert_eq!(&bytes[..8], &[0x00, 0x02, 0x10, 0x00, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], 0x2000u32.to_le_bytes());
        assert_eq!(&bytes[12..16], 16u32.to_le_bytes());
        assert_eq!(&bytes[16..20], 0x400u32.to_le_bytes());
        assert_eq!(&bytes[20..24], 0x10000u32.to_le_bytes());
    }

    #[test]
    fn flash_data_frame_pads_and_checksums() {
        let bytes = frame(Command::FlashData {
            data: &[0x01, 0x02, 0x03],
            pad_to: 4,
            pad_byte: 0xff,
            sequence: 7,
        });
        // header: padded length 20, checksum 0xEF ^ 01 ^ 02 ^ 03 ^ FF = 0x10
        assert_eq!(&bytes[..8], &[0x00, 0x03, 0x14, 0x00, 0x10, 0, 0, 0]);
        // block params: size 4, sequence 7, two zero words
        assert_eq!(&bytes[8..12], 4u32.to_le_bytes());
        assert_eq!(&bytes[12..16], 7u32.to_le_bytes());
        assert_eq!(&bytes[16..24], [0u8; 8]);
        // data plus padding
        assert_eq!(&bytes[24..], &[0x01, 0x02, 0x03, 0xff]);
    }

    #[test]
    fn flash_end_frame_stays_in_loader() {
        let bytes = frame(Command::FlashEnd {
            stay_in_loader: true,
        });
        assert_eq!(bytes, [0x00, 0x04, 0x04, 0x00, 0, 0, 0, 0, 0x01, 0, 0, 0]);
    }

    #[test]
    fn mem_end_frame() {
        let bytes = frame(Command::MemEnd {
            no_entry: false,
            entry: 0x4010_001c,
        });
        assert_eq!(&bytes[..8], &[0x00, 0x06, 0x08, 0x00, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], [0u8; 4]);
        assert_eq!(&bytes[12..16], 0x4010_001cu32.to_le_bytes());
    }
}
