//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
    path::PathBuf,
};

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::{
    command::CommandType,
    flasher::{FlashFrequency, FlashMode, FlashSize},
};

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while talking to the device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("The ROM loader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Failed to talk to the ROM bootloader")]
    #[diagnostic(
        code(esploader::no_bootloader),
        help(
            "Check the wiring: DTR must drive GPIO0 and RTS must drive CH_PD/RESET, \
             both active low at the chip"
        )
    )]
    BootloaderNotEntered,

    #[error("Failed to read flash params from the existing firmware")]
    #[diagnostic(
        code(esploader::flash_params),
        help(
            "The first flash sector does not carry a valid firmware header; \
             pass an explicit flash parameter value instead of preserving"
        )
    )]
    ReadFlashParams,

    #[error("Flash read failed: {0}")]
    #[diagnostic(code(esploader::read_flash))]
    ReadFlash(&'static str),

    #[error(transparent)]
    #[diagnostic(transparent)]
    ImageLoad(#[from] ImageLoadError),

    #[error("Failed to flash image at {addr:#x}")]
    #[diagnostic(
        code(esploader::write_retries_exhausted),
        help("The write was retried three times; check the serial link and the flash chip")
    )]
    WriteRetriesExhausted { addr: u32 },

    #[error("Failed to leave flashing mode")]
    #[diagnostic(
        code(esploader::flash_end),
        help(
            "Most likely flashing was successful, but you need to reboot \
             your device manually"
        )
    )]
    LeaveFlashMode(#[source] Box<Error>),

    #[error("The flash params '{0}' are not valid")]
    #[diagnostic(
        code(esploader::invalid_flash_params),
        help("Pass either a raw integer or a 'mode,size,freq' triple such as 'dio,32m,40m'")
    )]
    InvalidFlashParams(String),

    #[error("The flash mode '{0}' is not valid")]
    #[diagnostic(
        code(esploader::invalid_flash_mode),
        help("The accepted values are: {:?}", FlashMode::VARIANTS)
    )]
    InvalidFlashMode(String),

    #[error("The flash size '{0}' is not valid")]
    #[diagnostic(
        code(esploader::invalid_flash_size),
        help("The accepted values are: {:?}", FlashSize::VARIANTS)
    )]
    InvalidFlashSize(String),

    #[error("The flash frequency '{0}' is not valid")]
    #[diagnostic(
        code(esploader::invalid_flash_frequency),
        help("The accepted values are: {:?}", FlashFrequency::VARIANTS)
    )]
    InvalidFlashFrequency(String),

    #[error("Unrecognized MAC address prefix {0:#04x}")]
    #[diagnostic(code(esploader::unknown_oui))]
    UnknownOui(u8),

    #[error("No serial port was specified")]
    #[diagnostic(
        code(esploader::no_serial),
        help("Pass --port or set a default port in the configuration file")
    )]
    NoSerial,
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and the boot and reset lines are free")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(TimedOutCommand),

    #[error("Received a malformed or truncated response")]
    #[diagnostic(
        code(esploader::invalid_response),
        help("Try hard-resetting the device and running the command again")
    )]
    InvalidResponse,

    #[error("Response answers command {got:#04x}, expected {expected:#04x}")]
    #[diagnostic(code(esploader::wrong_response))]
    WrongResponse { expected: u8, got: u8 },
}

#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        TimedOutCommand {
            command: Some(command),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

/// Failure codes reported by the ROM loader in the `last_error` byte
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[repr(u8)]
#[non_exhaustive]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esploader::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Loader failed to execute command")]
    #[diagnostic(code(esploader::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid checksum")]
    #[diagnostic(code(esploader::rom::checksum))]
    InvalidChecksum = 0x07,

    #[error("Loader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Loader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidChecksum,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0a => RomErrorKind::FlashReadLengthError,
            _ => RomErrorKind::Other,
        }
    }
}

/// A non-zero status in a ROM loader response
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ImageLoadError {
    #[error("Image directory {} does not exist", .0.display())]
    #[diagnostic(code(esploader::image_dir))]
    DirectoryMissing(PathBuf),

    #[error("No image files to flash in {}", .0.display())]
    #[diagnostic(
        code(esploader::no_images),
        help("Image files are named after their flash offset, e.g. 0x00000.bin")
    )]
    NoImages(PathBuf),

    #[error("{0} is not a valid flash address")]
    #[diagnostic(code(esploader::bad_image_name))]
    InvalidAddress(String),

    #[error("Image {file} is at {addr:#x}, which is not at a sector boundary")]
    #[diagnostic(
        code(esploader::unaligned_image),
        help("Flash offsets must be multiples of 4096")
    )]
    UnalignedAddress { file: String, addr: u32 },

    #[error("Failed to read {}", .path.display())]
    #[diagnostic(code(esploader::image_io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub(crate) trait ResultExt {
    /// mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
