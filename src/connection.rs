//! Serial connection to the ESP8266 ROM loader
//!
//! The [Connection] struct owns the serial port and handles framing,
//! response decoding and the DTR/RTS dance that forces the chip into the
//! loader. The wiring is assumed to match the usual flashing adapters:
//! DTR drives GPIO0 and RTS drives CH_PD/RESET, both active low.

use std::{
    fmt::{Display, Formatter},
    io::{BufWriter, Write},
    thread::sleep,
    time::Duration,
};

use log::debug;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{
    command::{Command, DEFAULT_TIMEOUT},
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    slip::{decoder::read_frame, encoder::SlipEncoder},
};

/// The loader answers a single sync with a burst of responses; all of
/// them must parse before it is considered reachable.
const SYNC_RESPONSE_COUNT: usize = 8;

const MAC_WORD0_REG: u32 = 0x3ff0_0050;
const MAC_WORD1_REG: u32 = 0x3ff0_0054;

/// Response direction byte
const DIR_RESPONSE: u8 = 0x01;

/// A decoded response frame from the ROM loader
#[derive(Debug, Clone)]
pub struct Response {
    pub cmd: u8,
    pub value: [u8; 4],
    pub body: Vec<u8>,
    pub status: u8,
    pub last_error: u8,
}

impl Response {
    /// Parses a SLIP frame into a response. Anything shorter than the
    /// fixed header or with the wrong direction byte is not a response.
    fn parse(frame: &[u8]) -> Option<Response> {
        if frame.len() < 10 {
            debug!("incomplete response: {:02x?}", frame);
            return None;
        }
        if frame[0] != DIR_RESPONSE {
            debug!("invalid direction byte in response: {:02x?}", frame);
            return None;
        }

        let declared = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let mut value = [0u8; 4];
        value.copy_from_slice(&frame[4..8]);

        let body = frame[8..frame.len().min(8 + declared)].to_vec();
        let (status, last_error) = if body.len() == 2 {
            (body[0], body[1])
        } else {
            (0, 0)
        };

        Some(Response {
            cmd: frame[1],
            value,
            body,
            status,
            last_error,
        })
    }

    pub fn ok(&self) -> bool {
        self.status == 0 && self.last_error == 0
    }
}

/// A MAC address read out of the chip's OTP registers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(":"))
    }
}

pub struct Connection {
    serial: Box<dyn SerialPort>,
}

impl Connection {
    pub fn new(serial: Box<dyn SerialPort>) -> Self {
        Connection { serial }
    }

    /// Opens `port` with the settings the ROM loader expects (9600 8N1,
    /// no flow control).
    pub fn open(port: &str) -> Result<Self, Error> {
        let serial = serialport::new(port, 9600)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(ConnectionError::from)?;

        Ok(Connection::new(serial))
    }

    /// Forces the chip into the ROM loader by pulsing GPIO0 and RESET,
    /// then syncs with it.
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        debug!("entering the ROM loader");
        self.serial.write_data_terminal_ready(false)?;
        self.serial.write_request_to_send(true)?;
        sleep(Duration::from_millis(50));
        self.serial.write_data_terminal_ready(true)?;
        self.serial.write_request_to_send(false)?;
        sleep(Duration::from_millis(50));
        self.serial.write_data_terminal_ready(false)?;

        self.try_sync(3)
    }

    /// Releases GPIO0 and pulses RESET so the chip boots the firmware in
    /// flash instead of the loader.
    pub fn reset_to_firmware(&mut self) -> Result<(), Error> {
        debug!("rebooting into firmware");
        self.serial.write_data_terminal_ready(false)?;
        self.serial.write_request_to_send(true)?;
        sleep(Duration::from_millis(50));
        self.serial.write_request_to_send(false)?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.write_command(Command::Sync)?;

        for _ in 0..SYNC_RESPONSE_COUNT {
            if self.read_response()?.is_none() {
                return Err(ConnectionError::InvalidResponse.into());
            }
        }

        Ok(())
    }

    /// Retries the whole sync exchange up to `attempts` times.
    pub fn try_sync(&mut self, attempts: usize) -> Result<(), Error> {
        for _ in 0..attempts {
            if self.sync().is_ok() {
                return Ok(());
            }
        }
        Err(ConnectionError::ConnectionFailed.into())
    }

    /// Runs `f` with the given response timeout, restoring the old one
    /// afterwards.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.serial.timeout();
        self.serial.set_timeout(timeout)?;
        let result = f(self);
        self.serial.set_timeout(old_timeout)?;
        result
    }

    pub(crate) fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("writing command: {:?}", command.command_type());
        self.serial.clear(ClearBuffer::Input)?;

        let mut writer = BufWriter::new(self.serial.as_mut());
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn read_response(&mut self) -> Result<Option<Response>, Error> {
        let frame = read_frame(self.serial.as_mut())?;
        Ok(Response::parse(&frame))
    }

    /// Writes a command and reads its response, checking the echo and the
    /// status bytes.
    pub fn command(&mut self, command: Command<'_>) -> Result<Response, Error> {
        let ty = command.command_type();
        self.with_timeout(ty.timeout(), |connection| {
            connection.write_command(command)?;

            let response = match connection.read_response()? {
                Some(response) => response,
                None => return Err(ConnectionError::InvalidResponse.into()),
            };
            if response.cmd != ty as u8 {
                return Err(ConnectionError::WrongResponse {
                    expected: ty as u8,
                    got: response.cmd,
                }
                .into());
            }
            if !response.ok() {
                debug!(
                    "command {} failed: status {} {}",
                    ty, response.status, response.last_error
                );
                return Err(RomError::new(ty, RomErrorKind::from(response.last_error)).into());
            }
            Ok(response)
        })
        .for_command(ty)
    }

    /// Reads a 32-bit chip register, returning its raw little-endian bytes.
    pub fn read_reg(&mut self, address: u32) -> Result<[u8; 4], Error> {
        Ok(self.command(Command::ReadReg { address })?.value)
    }

    /// Reads the chip's MAC address out of its OTP registers.
    pub fn read_mac(&mut self) -> Result<MacAddr, Error> {
        let word0 = self.read_reg(MAC_WORD0_REG)?;
        let word1 = self.read_reg(MAC_WORD1_REG)?;
        mac_from_words(word0, word1)
    }

    /// Reads one raw SLIP frame off the wire. Used when the device streams
    /// data outside the command/response pattern.
    pub(crate) fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        Ok(read_frame(self.serial.as_mut())?)
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial
    }
}

fn mac_from_words(word0: [u8; 4], word1: [u8; 4]) -> Result<MacAddr, Error> {
    let oui: [u8; 3] = match word1[2] {
        0 => [0x18, 0xfe, 0x34],
        1 => [0xac, 0xd0, 0x74],
        other => return Err(Error::UnknownOui(other)),
    };

    Ok(MacAddr([
        oui[0], oui[1], oui[2], word1[1], word1[0], word0[3],
    ]))
}

/// Opens `port`, checks that an ESP8266 ROM loader answers on it and
/// returns the chip's MAC address.
pub fn probe(port: &str) -> Result<MacAddr, Error> {
    let mut connection = Connection::open(port)?;
    connection
        .enter_bootloader()
        .map_err(|_| Error::BootloaderNotEntered)?;
    connection.read_mac()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_short_frames_and_wrong_direction() {
        assert!(Response::parse(&[0x01, 0x08, 0x02, 0x00, 0, 0, 0, 0, 0]).is_none());
        assert!(Response::parse(&[0x00, 0x08, 0x02, 0x00, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn parse_extracts_value_and_status() {
        let frame = [
            0x01, 0x0a, 0x02, 0x00, 0x50, 0x00, 0xf0, 0x3f, 0x00, 0x00,
        ];
        let response = Response::parse(&frame).unwrap();
        assert_eq!(response.cmd, 0x0a);
        assert_eq!(response.value, [0x50, 0x00, 0xf0, 0x3f]);
        assert_eq!(response.body, [0x00, 0x00]);
        assert!(response.ok());
    }

    #[test]
    fn parse_flags_nonzero_status() {
        let frame = [
            0x01, 0x03, 0x02, 0x00, 0, 0, 0, 0, 0x01, 0x06,
        ];
        let response = Response::parse(&frame).unwrap();
        assert_eq!(response.status, 0x01);
        assert_eq!(response.last_error, 0x06);
        assert!(!response.ok());
    }

    #[test]
    fn mac_for_both_known_ouis() {
        let mac = mac_from_words([0, 0, 0, 0xbb], [0x34, 0x12, 0, 0]).unwrap();
        assert_eq!(mac.0, [0x18, 0xfe, 0x34, 0x12, 0x34, 0xbb]);
        assert_eq!(mac.to_string(), "18:fe:34:12:34:bb");

        let mac = mac_from_words([0, 0, 0, 0x01], [0xcd, 0xab, 1, 0]).unwrap();
        assert_eq!(mac.0, [0xac, 0xd0, 0x74, 0xab, 0xcd, 0x01]);
    }

    #[test]
    fn mac_rejects_unknown_oui() {
        assert!(mac_from_words([0; 4], [0, 0, 7, 0]).is_err());
    }
}
