//! On-disk collection format (`.goc`): a fixed-size commit field, the
//! length-prefixed identity strings, then every object as type / length /
//! hash / payload. Integers are host-endian; the file never leaves the
//! machine that wrote it. Anything structurally implausible makes the whole
//! file untrustworthy, and the caller recreates the collection from scratch.

use std::io::{Read, Write};
use std::path::PathBuf;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::mirror::Mirror;
use crate::object::{Object, ObjectStore, ObjectType};

const HASH_LEN: usize = 40;
/// Identity strings never get anywhere near this; larger means the file is
/// not ours.
const MAX_FIELD: u64 = 1 << 20;
const MAX_OBJECTS: u64 = u32::MAX as u64;
const MAX_PAYLOAD: u64 = 1 << 31;

/// Persistent fields of a mirror, as read back from a `.goc` file.
#[derive(Debug)]
pub struct Snapshot {
    pub last_commit: String,
    pub domain: String,
    pub name: String,
    pub branch: String,
    pub socket: PathBuf,
    pub store: ObjectStore,
}

pub fn save(mirror: &Mirror, out: &mut impl Write) -> Result<()> {
    let mut commit = [0u8; HASH_LEN + 1];
    commit[..mirror.last_commit.len()].copy_from_slice(mirror.last_commit.as_bytes());
    out.write_all(&commit)?;

    write_string(out, &mirror.domain)?;
    write_string(out, &mirror.name)?;
    write_string(out, &mirror.branch)?;
    write_string(out, &mirror.socket.to_string_lossy())?;

    // Sorted layout keeps repeated serializations byte-identical.
    let mut objects: Vec<&Object> = mirror.store.iter().collect();
    objects.sort_unstable_by(|a, b| a.id.cmp(&b.id));

    out.write_u64::<NativeEndian>(objects.len() as u64)?;
    for object in objects {
        out.write_u32::<NativeEndian>(object.kind.wire() as u32)?;
        out.write_u64::<NativeEndian>(object.data.len() as u64)?;
        out.write_all(object.id.as_bytes())?;
        out.write_all(&object.data)?;
    }
    Ok(())
}

pub fn load(input: &mut impl Read) -> Result<Snapshot> {
    let mut commit = [0u8; HASH_LEN + 1];
    input
        .read_exact(&mut commit)
        .map_err(|err| Error::Cache(format!("reading commit field: {err}")))?;
    let nul = commit
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Cache("unterminated commit hash".into()))?;
    if nul != 0 && nul != HASH_LEN {
        return Err(Error::Cache(format!("commit hash of length {nul}")));
    }
    let last_commit = std::str::from_utf8(&commit[..nul])
        .map_err(|_| Error::Cache("commit hash is not valid UTF-8".into()))?
        .to_string();

    let domain = read_string(input, "domain")?;
    let name = read_string(input, "name")?;
    let branch = read_string(input, "branch")?;
    let socket = PathBuf::from(read_string(input, "socket")?);

    let count = input
        .read_u64::<NativeEndian>()
        .map_err(|err| Error::Cache(format!("reading object count: {err}")))?;
    if count > MAX_OBJECTS {
        return Err(Error::Cache(format!("implausible object count {count}")));
    }

    let mut store = ObjectStore::new();
    for index in 0..count {
        let object = read_object(input)
            .map_err(|err| Error::Cache(format!("object {index} of {count}: {err}")))?;
        store.insert(object);
    }

    Ok(Snapshot {
        last_commit,
        domain,
        name,
        branch,
        socket,
        store,
    })
}

fn read_object(input: &mut impl Read) -> Result<Object> {
    let wire = input.read_u32::<NativeEndian>()?;
    let kind = u8::try_from(wire)
        .ok()
        .and_then(ObjectType::from_wire)
        .ok_or_else(|| Error::Cache(format!("unknown object type {wire}")))?;

    let length = input.read_u64::<NativeEndian>()?;
    if length > MAX_PAYLOAD {
        return Err(Error::Cache(format!("implausible payload length {length}")));
    }

    let mut id = [0u8; HASH_LEN];
    input.read_exact(&mut id)?;
    let id = std::str::from_utf8(&id)
        .ok()
        .filter(|id| id.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| Error::Cache("object id is not hex".into()))?
        .to_string();

    let mut data = vec![0u8; length as usize];
    input.read_exact(&mut data)?;
    // The id is trusted as stored; it was computed when the object was first
    // ingested.
    Ok(Object::with_id(kind, data, id))
}

fn write_string(out: &mut impl Write, value: &str) -> Result<()> {
    out.write_u64::<NativeEndian>(value.len() as u64)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

fn read_string(input: &mut impl Read, field: &str) -> Result<String> {
    let length = input
        .read_u64::<NativeEndian>()
        .map_err(|err| Error::Cache(format!("reading {field} length: {err}")))?;
    if length > MAX_FIELD {
        return Err(Error::Cache(format!(
            "implausible {field} length {length}"
        )));
    }
    let mut data = vec![0u8; length as usize];
    input
        .read_exact(&mut data)
        .map_err(|err| Error::Cache(format!("reading {field}: {err}")))?;
    String::from_utf8(data).map_err(|_| Error::Cache(format!("{field} is not valid UTF-8")))
}
