//! Deferred pack entries: a delta names a base object and carries a patch of
//! copy and insert instructions that materializes the derived object.

use bytes::Buf;

use crate::error::{Error, Result};
use crate::object::{Object, ObjectStore};

/// A pack entry whose payload patches a base object.
#[derive(Debug)]
pub struct Delta {
    pub base: DeltaBase,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum DeltaBase {
    /// Base object named by its hex id.
    Reference(String),
    /// Base object named by its byte offset within the same pack. Parsed to
    /// keep the stream aligned, but never resolved: the client does not
    /// advertise `ofs-delta`, so a compliant server will not send these.
    Offset(u64),
}

/// Little-endian size in 7-bit groups, terminated by a cleared top bit.
fn read_size(patch: &mut &[u8]) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0;
    loop {
        if !patch.has_remaining() {
            return Err(Error::Delta("patch truncated inside a size header".into()));
        }
        let byte = patch.get_u8();
        if shift >= usize::BITS {
            return Err(Error::Delta("size header overflows the native width".into()));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Materialize the object a patch describes against `base`.
pub fn apply(base: &Object, patch: &[u8]) -> Result<Vec<u8>> {
    let mut patch = patch;
    let base_size = read_size(&mut patch)?;
    if base_size != base.data.len() {
        return Err(Error::Delta(format!(
            "base {} is {} bytes, patch expects {base_size}",
            base.id,
            base.data.len()
        )));
    }
    let new_size = read_size(&mut patch)?;
    let mut out: Vec<u8> = Vec::with_capacity(new_size);

    while patch.has_remaining() {
        let opcode = patch.get_u8();
        if opcode & 0x80 != 0 {
            // Copy from the base. Bits 0..3 select which little-endian offset
            // bytes follow, bits 4..6 which size bytes; absent bytes are zero.
            let mut offset = 0usize;
            for bit in 0..4 {
                if opcode & (1 << bit) != 0 {
                    if !patch.has_remaining() {
                        return Err(Error::Delta("patch truncated inside a copy operand".into()));
                    }
                    offset |= (patch.get_u8() as usize) << (bit * 8);
                }
            }
            let mut size = 0usize;
            for bit in 0..3 {
                if opcode & (1 << (bit + 4)) != 0 {
                    if !patch.has_remaining() {
                        return Err(Error::Delta("patch truncated inside a copy operand".into()));
                    }
                    size |= (patch.get_u8() as usize) << (bit * 8);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            size = size.min(new_size.saturating_sub(out.len()));
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.data.len())
                .ok_or_else(|| {
                    Error::Delta(format!("copy of {size} bytes at {offset} overruns the base"))
                })?;
            out.extend_from_slice(&base.data[offset..end]);
        } else if opcode != 0 {
            // Insert literal bytes from the patch itself.
            let size = opcode as usize;
            if patch.remaining() < size {
                return Err(Error::Delta("patch truncated inside an insert".into()));
            }
            out.extend_from_slice(&patch[..size]);
            patch.advance(size);
        } else {
            return Err(Error::Delta("reserved zero instruction".into()));
        }
    }

    if out.len() != new_size {
        return Err(Error::Delta(format!(
            "patch produced {} bytes, header declared {new_size}",
            out.len()
        )));
    }
    Ok(out)
}

/// Apply every pending delta, inserting the derived objects into the store.
/// Deltas may chain, so unresolvable entries are retried until a full pass
/// makes no progress.
pub fn resolve(store: &mut ObjectStore, pending: &mut Vec<Delta>) -> Result<()> {
    while !pending.is_empty() {
        let mut deferred = Vec::new();
        let mut progressed = false;

        for delta in pending.drain(..) {
            let base_id = match &delta.base {
                DeltaBase::Reference(id) => id.clone(),
                DeltaBase::Offset(offset) => {
                    return Err(Error::Delta(format!(
                        "offset-delta against pack offset {offset} is not supported"
                    )));
                }
            };
            let applied = match store.get(&base_id) {
                Some(base) => Some((base.kind, apply(base, &delta.data)?)),
                None => None,
            };
            match applied {
                Some((kind, data)) => {
                    store.insert(Object::new(kind, data));
                    progressed = true;
                }
                None => deferred.push(delta),
            }
        }

        if !deferred.is_empty() && !progressed {
            let missing = match &deferred[0].base {
                DeltaBase::Reference(id) => id.clone(),
                DeltaBase::Offset(offset) => offset.to_string(),
            };
            return Err(Error::Delta(format!(
                "{} deltas cannot be resolved; first missing base is {missing}",
                deferred.len()
            )));
        }
        *pending = deferred;
    }
    Ok(())
}
