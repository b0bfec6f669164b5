//! Wire-format primitives shared by every OTS node encoding
//!
//! `Serializer`/`Deserializer` wrap a plain reader/writer with the LEB128
//! varuint and length-prefixed byte-string primitives the calendar's node
//! encodings (`calendar_store.rs`'s shallow form, `backup.rs`'s chunk
//! records) are built from.

use std::io::{Read, Write};

use super::error::{OtsError, Result};

/// Standard deserializer for OTS wire data.
pub struct Deserializer<R: Read> {
    reader: R,
}

impl<R: Read> Deserializer<R> {
    /// Constructs a new deserializer from a reader
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Extracts the underlying reader from the deserializer
    #[must_use]
    #[allow(dead_code)]
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads a single byte from the reader
    ///
    /// # Errors
    ///
    /// Returns an error if the read operation fails
    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0];
        self.reader.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Deserializes an unsigned integer using LEB128 variable-length encoding
    ///
    /// # Errors
    ///
    /// Returns an error if the read operation fails
    pub fn read_uint(&mut self) -> Result<usize> {
        let mut ret = 0;
        let mut shift = 0;

        loop {
            // Bottom 7 bits are value bits
            let byte = self.read_byte()?;
            ret |= ((byte & 0x7f) as usize) << shift;
            // Top bit is a continue bit
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        Ok(ret)
    }

    /// Deserializes a fixed number of bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the read operation fails
    pub fn read_fixed_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut ret = vec![0; n];
        self.reader.read_exact(&mut ret)?;
        Ok(ret)
    }

    /// Deserializes a variable number of bytes with length prefix
    ///
    /// # Errors
    ///
    /// Returns `OtsError::BadLength` if the length is out of range
    pub fn read_bytes(&mut self, min: usize, max: usize) -> Result<Vec<u8>> {
        let n = self.read_uint()?;
        if n < min || n > max {
            return Err(OtsError::BadLength { min, max, val: n });
        }
        self.read_fixed_bytes(n)
    }
}

/// Standard serializer for OTS wire data.
pub struct Serializer<W: Write> {
    writer: W,
}

impl<W: Write> Serializer<W> {
    /// Constructs a new serializer from a writer
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Extracts the underlying writer from the serializer
    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes a single byte to the writer
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.writer.write_all(&[byte])?;
        Ok(())
    }

    /// Write an unsigned integer using LEB128 variable-length encoding
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails
    pub fn write_uint(&mut self, mut n: usize) -> Result<()> {
        if n == 0 {
            self.write_byte(0x00)
        } else {
            while n > 0 {
                if n > 0x7f {
                    self.write_byte((n as u8) | 0x80)?;
                } else {
                    self.write_byte(n as u8)?;
                }
                n >>= 7;
            }
            Ok(())
        }
    }

    /// Write a fixed number of bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails
    pub fn write_fixed_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Write a variable number of bytes with length prefix
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.write_uint(data.len())?;
        self.write_fixed_bytes(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        let test_values = vec![0, 127, 128, 16384];

        for val in test_values {
            let mut buf = Vec::new();
            let mut ser = Serializer::new(&mut buf);
            ser.write_uint(val).unwrap();

            let mut deser = Deserializer::new(&buf[..]);
            let result = deser.read_uint().unwrap();
            assert_eq!(result, val, "Round-trip failed for value {}", val);
        }
    }

    #[test]
    fn test_read_bytes_length_validation() {
        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ser.write_uint(50).unwrap();
        ser.write_fixed_bytes(&[0u8; 50]).unwrap();

        let mut deser = Deserializer::new(&buf[..]);
        let result = deser.read_bytes(1, 10);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), OtsError::BadLength { min: 1, max: 10, val: 50 }));
    }

    #[test]
    fn test_deserializer_into_inner() {
        let data = b"test data";
        let deser = Deserializer::new(&data[..]);
        let _reader = deser.into_inner();
    }

    #[test]
    fn test_serializer_into_inner() {
        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ser.write_byte(0x42).unwrap();
        let writer = ser.into_inner();
        assert_eq!(*writer, vec![0x42]);
    }

    #[test]
    fn test_write_uint_large_values() {
        let test_values = vec![127, 128, 255, 256, 16383, 16384, 65535, 65536];

        for val in test_values {
            let mut buf = Vec::new();
            let mut ser = Serializer::new(&mut buf);
            ser.write_uint(val).unwrap();

            let mut deser = Deserializer::new(&buf[..]);
            let result = deser.read_uint().unwrap();
            assert_eq!(result, val, "Failed round-trip for value {}", val);
        }
    }

    #[test]
    fn test_write_uint_zero() {
        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ser.write_uint(0).unwrap();
        assert_eq!(buf, vec![0x00]);

        let mut deser = Deserializer::new(&buf[..]);
        assert_eq!(deser.read_uint().unwrap(), 0);
    }

    #[test]
    fn test_read_fixed_bytes_empty() {
        let data = b"";
        let mut deser = Deserializer::new(&data[..]);
        let result = deser.read_fixed_bytes(0).unwrap();
        assert_eq!(result, Vec::<u8>::new());
    }

    #[test]
    fn test_write_fixed_bytes_empty() {
        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ser.write_fixed_bytes(&[]).unwrap();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_read_bytes_in_range() {
        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ser.write_uint(5).unwrap();
        ser.write_fixed_bytes(&[1, 2, 3, 4, 5]).unwrap();

        let mut deser = Deserializer::new(&buf[..]);
        let result = deser.read_bytes(1, 10).unwrap();
        assert_eq!(result, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_read_bytes_below_min() {
        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ser.write_uint(5).unwrap();
        ser.write_fixed_bytes(&[1, 2, 3, 4, 5]).unwrap();

        let mut deser = Deserializer::new(&buf[..]);
        let result = deser.read_bytes(10, 20);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), OtsError::BadLength { min: 10, max: 20, val: 5 }));
    }
}
