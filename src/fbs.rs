//! FBS ("framebuffer stream") record codec.
//!
//! The persisted capture format consumed by offline tooling: an ASCII
//! version line, one comment line, then records of a big-endian U32 length,
//! that many payload bytes, zero padding to a 4-byte boundary, and a 4-byte
//! timestamp.

use std::io::{self, BufRead, Write};

pub const FBS_VERSION: &str = "FBS 001.002\n";

/// One captured record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FbsRecord {
    pub payload: Vec<u8>,
    /// Milliseconds since the start of the capture.
    pub timestamp: u32,
}

/// Streaming reader over an FBS file.
#[derive(Debug)]
pub struct FbsReader<R> {
    reader: R,
}

impl<R: BufRead> FbsReader<R> {
    /// Validate the version line and skip the comment line.
    pub fn new(mut reader: R) -> io::Result<Self> {
        let mut version = String::new();
        reader.read_line(&mut version)?;
        if version != FBS_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("not an FBS 001.002 file: {version:?}"),
            ));
        }
        let mut comment = String::new();
        reader.read_line(&mut comment)?;
        Ok(Self { reader })
    }

    /// The next record, or `None` at end of file.
    pub fn next_record(&mut self) -> io::Result<Option<FbsRecord>> {
        let mut length_bytes = [0u8; 4];
        match self.reader.read_exact(&mut length_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let length = u32::from_be_bytes(length_bytes) as usize;

        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload)?;

        let mut padding = [0u8; 3];
        self.reader.read_exact(&mut padding[..pad_len(length)])?;

        let mut timestamp_bytes = [0u8; 4];
        self.reader.read_exact(&mut timestamp_bytes)?;

        Ok(Some(FbsRecord {
            payload,
            timestamp: u32::from_be_bytes(timestamp_bytes),
        }))
    }
}

/// Streaming writer producing an FBS file.
pub struct FbsWriter<W> {
    writer: W,
}

impl<W: Write> FbsWriter<W> {
    /// Write the version line and a single comment line.
    pub fn new(mut writer: W, comment: &str) -> io::Result<Self> {
        writer.write_all(FBS_VERSION.as_bytes())?;
        writer.write_all(comment.as_bytes())?;
        if !comment.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        Ok(Self { writer })
    }

    pub fn write_record(&mut self, payload: &[u8], timestamp: u32) -> io::Result<()> {
        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.write_all(&[0u8; 3][..pad_len(payload.len())])?;
        self.writer.write_all(&timestamp.to_be_bytes())?;
        Ok(())
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn pad_len(length: usize) -> usize {
    (4 - length % 4) % 4
}
