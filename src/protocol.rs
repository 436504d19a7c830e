//! Upload-pack negotiation, protocol v1. Two phases run against fresh
//! sessions: the tree fetch (commit plus tree closure at depth 1, blobs
//! filtered out) and the blob fetch for whatever the path resolver marked as
//! needed. `multi_ack` is advertised but never exercised: the driver only
//! ever waits for `NAK` before the pack stream starts.

use std::io::Read;

use tracing::{info, warn};

use crate::delta;
use crate::error::{Error, Result};
use crate::mirror::Mirror;
use crate::pack;
use crate::pkt::{self, Packet};
use crate::transport::Transport;

const HASH_LEN: usize = 40;

/// Scan the ref advertisement for the last ref whose line contains `branch`.
/// `Ok(None)` means the peer closed the stream or advertised no such ref;
/// the caller treats both as "nothing to do" rather than an error.
fn select_branch(output: &mut dyn Read, branch: &str) -> Result<Option<String>> {
    let mut tip = None;
    loop {
        match pkt::read_packet(output)? {
            Packet::Data(line) => {
                let Ok(text) = std::str::from_utf8(&line) else {
                    continue;
                };
                if text.len() > HASH_LEN
                    && text.as_bytes()[..HASH_LEN].iter().all(u8::is_ascii_hexdigit)
                    && text.contains(branch)
                {
                    tip = Some(text[..HASH_LEN].to_ascii_lowercase());
                }
            }
            Packet::Flush => return Ok(tip),
            Packet::Eof => return Ok(None),
        }
    }
}

/// Discard negotiation chatter up to the flush that ends the shallow
/// section.
fn skip_to_flush(output: &mut dyn Read) -> Result<()> {
    loop {
        match pkt::read_packet(output)? {
            Packet::Data(_) => continue,
            Packet::Flush => return Ok(()),
            Packet::Eof => return Err(Error::Protocol("stream ended during negotiation".into())),
        }
    }
}

/// Read acknowledgments until the server answers `NAK`. Interleaved flush
/// packets are tolerated.
fn read_to_nak(output: &mut dyn Read) -> Result<()> {
    loop {
        match pkt::read_packet(output)? {
            Packet::Data(line) if line == b"NAK" => return Ok(()),
            Packet::Data(_) | Packet::Flush => continue,
            Packet::Eof => return Err(Error::Protocol("stream ended before NAK".into())),
        }
    }
}

fn flush_request(session: &mut crate::transport::Session) -> Result<()> {
    session
        .input
        .flush()
        .map_err(|err| Error::Transport(format!("flushing request: {err}")))
}

/// Discover the branch tip and fetch its commit and tree closure, blobs
/// filtered out. Returns false when the mirror is already current or the
/// branch is not advertised.
pub fn update_trees(mirror: &mut Mirror, transport: &mut dyn Transport) -> Result<bool> {
    let mut session = transport.connect()?;

    let Some(tip) = select_branch(&mut session.output, &mirror.branch)? else {
        warn!(branch = %mirror.branch, repo = %mirror.name, "branch not advertised by the remote");
        session.close()?;
        return Ok(false);
    };
    if tip == mirror.last_commit {
        session.close()?;
        return Ok(false);
    }
    info!(domain = %mirror.domain, repo = %mirror.name, branch = %mirror.branch, "updating repository");

    pkt::write_packet(
        &mut session.input,
        format!("want {tip} multi_ack filter no-progress\n").as_bytes(),
    )?;
    pkt::write_packet(&mut session.input, b"deepen 1\n")?;
    pkt::write_packet(&mut session.input, b"filter blob:none\n")?;
    pkt::flush_packet(&mut session.input)?;
    for id in mirror.store.tree_ids() {
        pkt::write_packet(&mut session.input, format!("have {id}\n").as_bytes())?;
    }
    pkt::flush_packet(&mut session.input)?;
    pkt::write_packet(&mut session.input, b"done\n")?;
    flush_request(&mut session)?;

    skip_to_flush(&mut session.output)?;
    read_to_nak(&mut session.output)?;
    // One more pkt-line sits between the acknowledgment and the raw pack
    // bytes; its content is not interpreted.
    if pkt::read_packet(&mut session.output)? == Packet::Eof {
        return Err(Error::Protocol("stream ended before pack data".into()));
    }

    pack::read_pack(&mut session.output, &mut mirror.store, &mut mirror.pending)?;
    session.close()?;
    delta::resolve(&mut mirror.store, &mut mirror.pending)?;
    mirror.last_commit = tip;
    Ok(true)
}

/// Fetch every blob the path resolver marked as needed. Returns false when
/// nothing is missing or the remote stopped advertising the branch.
pub fn fetch_blobs(mirror: &mut Mirror, transport: &mut dyn Transport) -> Result<bool> {
    if !mirror.wanted.iter().any(|want| want.needed) {
        return Ok(false);
    }

    let mut session = transport.connect()?;
    let Some(tip) = select_branch(&mut session.output, &mirror.branch)? else {
        warn!(branch = %mirror.branch, repo = %mirror.name, "branch disappeared between negotiation phases");
        session.close()?;
        return Ok(false);
    };
    if tip != mirror.last_commit {
        warn!(domain = %mirror.domain, repo = %mirror.name, "branch moved while we weren't looking");
    }

    let mut first = true;
    for want in mirror.wanted.iter().filter(|want| want.needed) {
        let line = if first {
            format!("want {} no-progress\n", want.hash)
        } else {
            format!("want {}\n", want.hash)
        };
        first = false;
        pkt::write_packet(&mut session.input, line.as_bytes())?;
    }
    pkt::flush_packet(&mut session.input)?;
    pkt::write_packet(&mut session.input, b"done\n")?;
    flush_request(&mut session)?;

    read_to_nak(&mut session.output)?;
    pack::read_pack(&mut session.output, &mut mirror.store, &mut mirror.pending)?;
    session.close()?;
    delta::resolve(&mut mirror.store, &mut mirror.pending)?;
    Ok(true)
}
