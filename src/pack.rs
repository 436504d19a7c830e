//! Pack-file ingestion: a 12-byte header followed by the declared number of
//! entries, each a variable-length header plus one zlib stream, closed by a
//! 20-byte digest trailer.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};

use crate::delta::{Delta, DeltaBase};
use crate::error::{Error, Result};
use crate::inflate::InflateBuffer;
use crate::object::{Object, ObjectStore, ObjectType};

const PACK_SIGNATURE: u32 = 0x5041434b; // "PACK"
const PACK_VERSION: u32 = 2;

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

/// Consume one pack stream: base objects go into the store (replacing any
/// previous entry under the same id), deltas are queued for resolution.
pub fn read_pack(
    input: &mut impl Read,
    store: &mut ObjectStore,
    pending: &mut Vec<Delta>,
) -> Result<()> {
    let header = |err| Error::Pack(format!("reading pack header: {err}"));
    let signature = input.read_u32::<BigEndian>().map_err(header)?;
    if signature != PACK_SIGNATURE {
        return Err(Error::Pack(format!("bad pack signature {signature:#010x}")));
    }
    let version = input.read_u32::<BigEndian>().map_err(header)?;
    if version != PACK_VERSION {
        return Err(Error::Pack(format!("unsupported pack version {version}")));
    }
    let count = input.read_u32::<BigEndian>().map_err(header)?;

    let mut buf = InflateBuffer::new(input);
    for _ in 0..count {
        read_entry(&mut buf, store, pending)?;
    }

    // 20-byte SHA-1 trailer over the whole pack. Its presence is required;
    // the digest itself is not verified.
    for _ in 0..20 {
        buf.get_byte()?;
    }
    Ok(())
}

fn read_entry<R: Read>(
    buf: &mut InflateBuffer<R>,
    store: &mut ObjectStore,
    pending: &mut Vec<Delta>,
) -> Result<()> {
    let mut byte = buf.get_byte()?;
    let kind = (byte >> 4) & 0x07;
    let mut length = (byte & 0x0f) as u64;
    let mut shift = 4;
    while byte & 0x80 != 0 {
        byte = buf.get_byte()?;
        if shift >= u64::BITS {
            return Err(Error::Pack("object length varint is too long".into()));
        }
        length |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    let length = length as usize;

    match kind {
        1..=4 => {
            let data = buf.inflate_exact(length)?;
            let kind = ObjectType::from_wire(kind)
                .ok_or_else(|| Error::Pack(format!("unknown object type {kind}")))?;
            store.insert(Object::new(kind, data));
        }
        OBJ_REF_DELTA => {
            let mut base = [0u8; 20];
            for slot in base.iter_mut() {
                *slot = buf.get_byte()?;
            }
            let data = buf.inflate_exact(length)?;
            pending.push(Delta {
                base: DeltaBase::Reference(hex::encode(base)),
                data,
            });
        }
        OBJ_OFS_DELTA => {
            let mut byte = buf.get_byte()?;
            let mut offset = (byte & 0x7f) as u64;
            while byte & 0x80 != 0 {
                byte = buf.get_byte()?;
                offset = ((offset + 1) << 7) | (byte & 0x7f) as u64;
            }
            let data = buf.inflate_exact(length)?;
            pending.push(Delta {
                base: DeltaBase::Offset(offset),
                data,
            });
        }
        other => return Err(Error::Pack(format!("unknown pack entry type {other}"))),
    }
    Ok(())
}
