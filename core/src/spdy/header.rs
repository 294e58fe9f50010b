//! SPDY/3 name/value header blocks.
//!
//! A block is a count of pairs followed by length-prefixed names and values,
//! all as big-endian u32. On the wire the block is zlib-compressed with a
//! dictionary; each direction keeps one compression context for the life of
//! the connection, so blocks must be encoded and decoded in frame order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::dictionary::HEADER_DICTIONARY;
use super::SpdyError;

const MAX_HEADER_BLOCK: usize = 1024 * 1024;

/// Ordered header list with lowercase names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. SPDY requires lowercase names.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn to_block(&self) -> Vec<u8> {
        let size = 4 + self
            .entries
            .iter()
            .map(|(name, value)| 8 + name.len() + value.len())
            .sum::<usize>();
        let mut block = BytesMut::with_capacity(size);
        block.put_u32(self.entries.len() as u32);
        for (name, value) in &self.entries {
            block.put_u32(name.len() as u32);
            block.extend_from_slice(name.as_bytes());
            block.put_u32(value.len() as u32);
            block.extend_from_slice(value.as_bytes());
        }
        block.to_vec()
    }

    fn from_block(mut block: &[u8]) -> Result<Self, SpdyError> {
        fn take_string(block: &mut &[u8]) -> Result<String, SpdyError> {
            if block.remaining() < 4 {
                return Err(header_error("truncated length"));
            }
            let len = block.get_u32() as usize;
            if block.remaining() < len {
                return Err(header_error("truncated string"));
            }
            let value = std::str::from_utf8(&block[..len])
                .map_err(|_| header_error("header is not valid UTF-8"))?
                .to_string();
            block.advance(len);
            Ok(value)
        }

        if block.remaining() < 4 {
            return Err(header_error("missing pair count"));
        }
        let count = block.get_u32() as usize;
        let mut headers = Headers {
            entries: Vec::with_capacity(count.min(64)),
        };
        for _ in 0..count {
            let name = take_string(&mut block)?;
            let value = take_string(&mut block)?;
            headers.entries.push((name.to_ascii_lowercase(), value));
        }
        Ok(headers)
    }
}

fn header_error(reason: &str) -> SpdyError {
    SpdyError::Malformed {
        frame: "header block",
        reason: reason.to_string(),
    }
}

/// Compressing side of a connection's header context.
pub struct HeaderEncoder {
    zlib: Compress,
}

impl HeaderEncoder {
    pub fn new() -> Result<Self, SpdyError> {
        let mut zlib = Compress::new(Compression::default(), true);
        zlib.set_dictionary(HEADER_DICTIONARY)
            .map_err(|e| SpdyError::Compression(e.to_string()))?;
        Ok(Self { zlib })
    }

    pub fn encode(&mut self, headers: &Headers) -> Result<Bytes, SpdyError> {
        let input = headers.to_block();
        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        let start = self.zlib.total_in();

        loop {
            let consumed = (self.zlib.total_in() - start) as usize;
            self.zlib
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| SpdyError::Compression(e.to_string()))?;

            let consumed = (self.zlib.total_in() - start) as usize;
            // A sync flush is complete once all input is taken and the
            // output buffer was not filled to the brim.
            if consumed == input.len() && output.len() < output.capacity() {
                break;
            }
            output.reserve(output.capacity().max(64));
        }

        Ok(Bytes::from(output))
    }
}

/// Decompressing side of a connection's header context.
pub struct HeaderDecoder {
    zlib: Decompress,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self {
            zlib: Decompress::new(true),
        }
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<Headers, SpdyError> {
        let mut output = Vec::with_capacity(block.len() * 4 + 64);
        let start = self.zlib.total_in();

        loop {
            let consumed = (self.zlib.total_in() - start) as usize;
            let before_out = output.len();
            let status = match self.zlib.decompress_vec(
                &block[consumed..],
                &mut output,
                FlushDecompress::Sync,
            ) {
                Ok(status) => status,
                Err(e) if e.needs_dictionary().is_some() => {
                    self.zlib
                        .set_dictionary(HEADER_DICTIONARY)
                        .map_err(|e| SpdyError::Compression(e.to_string()))?;
                    continue;
                }
                Err(e) => return Err(SpdyError::Compression(e.to_string())),
            };

            let consumed = (self.zlib.total_in() - start) as usize;
            if consumed == block.len() && output.len() < output.capacity() {
                break;
            }
            if status == Status::BufError && output.len() == before_out && consumed == block.len()
            {
                break;
            }
            if output.len() > MAX_HEADER_BLOCK {
                return Err(header_error("decompressed block too large"));
            }
            output.reserve(output.capacity().max(256));
        }

        Headers::from_block(&output)
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}
