//! SLIP framing (RFC 1055) as spoken by the ESP8266 ROM loader.

pub mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context, opening the frame
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<'a, W: Write> Write for SlipEncoder<'a, W> {
        /// Writes the given buffer replacing the END and ESC bytes
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }
}

pub mod decoder {
    use std::io::{ErrorKind, Read};

    use log::debug;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    /// Reads a single SLIP frame from `source`.
    ///
    /// Everything before the opening delimiter is discarded. The decoder is
    /// permissive: an unknown escape sequence or a read timeout ends the
    /// frame and yields the bytes accumulated so far, leaving the caller to
    /// judge whether the result is usable. Any other I/O error is propagated.
    pub fn read_frame<R: Read + ?Sized>(source: &mut R) -> std::io::Result<Vec<u8>> {
        let mut frame = Vec::new();

        loop {
            match next_byte(source)? {
                Some(END) => break,
                Some(_) => continue,
                None => return Ok(frame),
            }
        }

        loop {
            let value = match next_byte(source)? {
                Some(value) => value,
                None => return Ok(frame),
            };

            match value {
                END => return Ok(frame),
                ESC => match next_byte(source)? {
                    Some(ESC_END) => frame.push(END),
                    Some(ESC_ESC) => frame.push(ESC),
                    Some(other) => {
                        debug!("invalid SLIP escape sequence: {:#04x}", other);
                        return Ok(frame);
                    }
                    None => return Ok(frame),
                },
                _ => frame.push(value),
            }
        }
    }

    fn next_byte<R: Read + ?Sized>(source: &mut R) -> std::io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match source.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{decoder::read_frame, encoder::SlipEncoder};

    fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut encoder = SlipEncoder::new(&mut out).unwrap();
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap();
        out
    }

    #[test]
    fn encode_escapes_reserved_bytes() {
        assert_eq!(
            encode(&[0xC0, 0xDB, 0x01]),
            [0xC0, 0xDB, 0xDC, 0xDB, 0xDD, 0x01, 0xC0]
        );
    }

    #[test]
    fn encode_plain_data_is_delimiters_only() {
        let data = [0x01, 0x02, 0x7F, 0xFE];
        let mut expected = vec![0xC0];
        expected.extend_from_slice(&data);
        expected.push(0xC0);
        assert_eq!(encode(&data), expected);
    }

    #[test]
    fn decode_skips_leading_garbage() {
        let input = [0xAA, 0xBB, 0xC0, 0x01, 0x02, 0xC0];
        let frame = read_frame(&mut input.as_ref()).unwrap();
        assert_eq!(frame, [0x01, 0x02]);
    }

    #[test]
    fn decode_unescapes() {
        let input = [0xC0, 0x01, 0xDB, 0xDC, 0xDB, 0xDD, 0x03, 0xC0];
        let frame = read_frame(&mut input.as_ref()).unwrap();
        assert_eq!(frame, [0x01, 0xC0, 0xDB, 0x03]);
    }

    #[test]
    fn decode_invalid_escape_yields_partial_frame() {
        let input = [0xC0, 0x01, 0x02, 0xDB, 0x42, 0x03, 0xC0];
        let frame = read_frame(&mut input.as_ref()).unwrap();
        assert_eq!(frame, [0x01, 0x02]);
    }

    #[test]
    fn decode_exhausted_source_yields_partial_frame() {
        let input = [0xC0, 0x01, 0x02];
        let frame = read_frame(&mut input.as_ref()).unwrap();
        assert_eq!(frame, [0x01, 0x02]);
    }

    #[test]
    fn round_trip() {
        let cases: [&[u8]; 4] = [
            &[],
            &[0x00],
            &[0xC0, 0xC0, 0xDB, 0xDB, 0xDC, 0xDD],
            &(0..=255).collect::<Vec<u8>>(),
        ];
        for data in cases {
            let encoded = encode(data);
            let decoded = read_frame(&mut encoded.as_slice()).unwrap();
            assert_eq!(decoded, data);
        }
    }
}
