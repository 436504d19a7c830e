//! Byte-oriented facade over a stream that interleaves raw bytes (entry
//! headers) with zlib streams (object bodies). The pack format gives the
//! inflated size of each body up front but not its compressed size, so the
//! decompressor routinely pulls in bytes that belong to the next entry;
//! whatever it does not consume stays in the refill buffer for later calls.

use std::io::Read;

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{Error, Result};

const REFILL_SIZE: usize = 4096;

pub struct InflateBuffer<R> {
    input: R,
    buf: [u8; REFILL_SIZE],
    offset: usize,
    len: usize,
}

impl<R: Read> InflateBuffer<R> {
    pub fn new(input: R) -> Self {
        InflateBuffer {
            input,
            buf: [0; REFILL_SIZE],
            offset: 0,
            len: 0,
        }
    }

    /// Pull the next chunk from the underlying stream. `len` stays zero at
    /// end of input.
    fn refill(&mut self) -> Result<()> {
        let n = self
            .input
            .read(&mut self.buf)
            .map_err(|err| Error::Pack(format!("reading pack stream: {err}")))?;
        self.offset = 0;
        self.len = n;
        Ok(())
    }

    /// Next raw byte of the stream.
    pub fn get_byte(&mut self) -> Result<u8> {
        if self.len == 0 {
            self.refill()?;
            if self.len == 0 {
                return Err(Error::Pack("unexpected end of pack stream".into()));
            }
        }
        let byte = self.buf[self.offset];
        self.offset += 1;
        self.len -= 1;
        Ok(byte)
    }

    /// Run one zlib stream to completion, producing exactly `size` inflated
    /// bytes. Compressed input beyond the stream's end is left in the buffer.
    pub fn inflate_exact(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; size];
        let mut written = 0;
        // One spare output byte once `out` is full: the trailing checksum
        // still has to be pulled through the decompressor, and any byte that
        // actually lands here means the stream was longer than declared.
        let mut spare = [0u8; 1];
        let mut state = Decompress::new(true);

        loop {
            if self.len == 0 {
                self.refill()?;
            }
            let eof = self.len == 0;
            let flush = if eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };

            let before_in = state.total_in();
            let before_out = state.total_out();
            let input = &self.buf[self.offset..self.offset + self.len];
            let status = if written < size {
                state.decompress(input, &mut out[written..], flush)
            } else {
                state.decompress(input, &mut spare, flush)
            }
            .map_err(|err| Error::Pack(format!("corrupt deflate stream: {err}")))?;

            let consumed = (state.total_in() - before_in) as usize;
            let produced = (state.total_out() - before_out) as usize;
            self.offset += consumed;
            self.len -= consumed;

            if written >= size && produced > 0 {
                return Err(Error::Pack(
                    "inflated data exceeds the declared object size".into(),
                ));
            }
            written += produced;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError if consumed == 0 && produced == 0 => {
                    if eof {
                        return Err(Error::Pack("pack stream ended mid-object".into()));
                    }
                    return Err(Error::Pack("decompressor made no progress".into()));
                }
                Status::Ok | Status::BufError => {}
            }
        }

        if written != size {
            return Err(Error::Pack(format!(
                "object inflated to {written} bytes, header declared {size}"
            )));
        }
        Ok(out)
    }
}
