//! Stream-continuous zlib inflation.
//!
//! ZRLE and Tight never terminate their zlib streams: each rectangle
//! appends more bytes to a stream whose logical end is the end of the
//! session, and back-references may reach into data inflated many
//! rectangles ago. The inflater therefore parses the two-byte zlib header
//! itself and then runs a raw DEFLATE state whose LZ77 window survives
//! between segments. The Adler-32 trailer never arrives on the wire and is
//! not checked.

use flate2::{Decompress, FlushDecompress, Status};
use thiserror::Error;

const ZLIB_METHOD_DEFLATE: u8 = 8;
const FLG_DICTIONARY: u8 = 0x20;
/// Adler-32 of the empty dictionary; the only preset dictionary we accept.
const EMPTY_ADLER32: u32 = 1;
const OUTPUT_CHUNK: usize = 32 * 1024;

/// Inflation failures.
#[derive(Error, Debug)]
pub enum InflateError {
    #[error("zlib: invalid header")]
    BadHeader,
    #[error("zlib: invalid dictionary")]
    BadDictionary,
    #[error("zlib: truncated segment")]
    ShortRead,
    #[error("zlib: corrupt deflate stream: {0}")]
    Corrupt(String),
}

impl From<InflateError> for crate::Error {
    fn from(err: InflateError) -> Self {
        crate::Error::Decode(err.to_string())
    }
}

/// A zlib stream that can be fed arbitrary-length segments drawn from
/// different upstream sources while preserving its decoder state.
///
/// The first segment must begin with the stream's zlib header; later
/// segments continue the same DEFLATE state. [`Inflator::reset`] rewinds to
/// the header-expecting mode, as Tight's control byte demands.
#[derive(Default)]
pub struct Inflator {
    stream: Option<Decompress>,
}

impl Inflator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one compressed segment and return every byte it inflates to.
    pub fn inflate(&mut self, segment: &[u8]) -> Result<Vec<u8>, InflateError> {
        let mut input = segment;
        if self.stream.is_none() {
            input = read_header(input)?;
            self.stream = Some(Decompress::new(false));
        }
        let stream = self.stream.as_mut().expect("inflate state present");

        let mut out = Vec::new();
        let mut consumed = 0usize;
        loop {
            out.reserve(OUTPUT_CHUNK);
            let spare = out.capacity() - out.len();
            let before_in = stream.total_in();
            let before_out = stream.total_out();
            let status = stream
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| InflateError::Corrupt(e.to_string()))?;
            consumed += (stream.total_in() - before_in) as usize;
            let produced = (stream.total_out() - before_out) as usize;

            match status {
                // RFB streams never actually end, but a well-formed final
                // block still yields whatever it inflated to.
                Status::StreamEnd => break,
                Status::BufError => break,
                Status::Ok => {
                    if consumed == input.len() && produced < spare {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Discard all decoder state. The next segment must start a fresh
    /// stream, header included.
    pub fn reset(&mut self) {
        self.stream = None;
    }
}

/// Validate the two-byte zlib header and return the remaining payload.
fn read_header(input: &[u8]) -> Result<&[u8], InflateError> {
    if input.len() < 2 {
        return Err(InflateError::ShortRead);
    }
    let (cmf, flg) = (input[0], input[1]);
    let header = u16::from_be_bytes([cmf, flg]);
    if cmf & 0x0f != ZLIB_METHOD_DEFLATE || header % 31 != 0 {
        return Err(InflateError::BadHeader);
    }

    let mut rest = &input[2..];
    if flg & FLG_DICTIONARY != 0 {
        if rest.len() < 4 {
            return Err(InflateError::ShortRead);
        }
        let checksum = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if checksum != EMPTY_ADLER32 {
            return Err(InflateError::BadDictionary);
        }
        rest = &rest[4..];
    }
    Ok(rest)
}
