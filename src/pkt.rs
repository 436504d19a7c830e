//! pkt-line framing: every control message is prefixed by its length as four
//! ASCII hex digits (length includes the prefix itself). A length of four or
//! less is the flush sentinel `0000`.

use std::io::{ErrorKind, Read, Write};

use crate::error::{Error, Result};

/// Longest payload a single pkt-line can carry (`0xffff` minus the prefix).
pub const MAX_PAYLOAD: usize = 0xffff - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A data frame, with at most one trailing newline stripped.
    Data(Vec<u8>),
    /// The `0000` flush sentinel, ending a stream of frames.
    Flush,
    /// The peer closed the channel cleanly between frames.
    Eof,
}

pub fn read_packet(input: &mut (impl Read + ?Sized)) -> Result<Packet> {
    let mut header = [0u8; 4];
    loop {
        match input.read(&mut header[..1]) {
            Ok(0) => return Ok(Packet::Eof),
            Ok(_) => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::Transport(format!("reading pkt-line: {err}"))),
        }
    }
    input
        .read_exact(&mut header[1..])
        .map_err(|_| Error::Protocol("truncated pkt-line header".into()))?;

    let length = std::str::from_utf8(&header)
        .ok()
        .and_then(|text| usize::from_str_radix(text, 16).ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid pkt-line header {:?}",
                String::from_utf8_lossy(&header)
            ))
        })?;
    if length <= 4 {
        return Ok(Packet::Flush);
    }

    let mut payload = vec![0u8; length - 4];
    input
        .read_exact(&mut payload)
        .map_err(|_| Error::Protocol("pkt-line shorter than its declared length".into()))?;
    if payload.last() == Some(&b'\n') {
        payload.pop();
    }
    Ok(Packet::Data(payload))
}

/// Frame `payload` onto the channel. An empty payload writes the flush
/// sentinel. No newline is appended.
pub fn write_packet(output: &mut impl Write, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return flush_packet(output);
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Protocol(format!(
            "pkt-line payload of {} bytes exceeds the frame limit",
            payload.len()
        )));
    }
    let transport = |err| Error::Transport(format!("writing pkt-line: {err}"));
    write!(output, "{:04x}", payload.len() + 4).map_err(transport)?;
    output.write_all(payload).map_err(transport)?;
    Ok(())
}

pub fn flush_packet(output: &mut impl Write) -> Result<()> {
    output
        .write_all(b"0000")
        .map_err(|err| Error::Transport(format!("writing flush-pkt: {err}")))
}
