//! Sparse working-set resolution: walk the tree closure of the current
//! commit and collect the blobs whose paths match the configured patterns.

use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::object::{ObjectStore, ObjectType};

const DIR_MODE: u32 = 0o040000;

/// A blob selected by a path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedObject {
    pub hash: String,
    /// Slash-joined location under the repository root, no leading slash.
    pub path: String,
    /// True when the store does not hold the blob yet.
    pub needed: bool,
}

/// Glob over a single path segment: `*` matches any run of characters
/// (greedy, with backtracking), everything else matches literally. There are
/// no character classes and no `?`.
pub fn segment_matches(name: &str, pattern: &str) -> bool {
    fn matches(name: &[u8], pattern: &[u8]) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some((b'*', rest)) => {
                if rest.is_empty() {
                    return true;
                }
                (0..=name.len()).any(|skip| matches(&name[skip..], rest))
            }
            Some((&literal, rest)) => {
                name.first() == Some(&literal) && matches(&name[1..], rest)
            }
        }
    }
    matches(name.as_bytes(), pattern.as_bytes())
}

/// Match a full slash-separated path: every segment must match its pattern
/// segment, and the segment counts must agree.
pub fn path_matches(path: &str, pattern: &str) -> bool {
    let mut names = path.split('/');
    let mut segments = pattern.split('/');
    loop {
        match (names.next(), segments.next()) {
            (None, None) => return true,
            (Some(name), Some(segment)) if segment_matches(name, segment) => continue,
            _ => return false,
        }
    }
}

struct TreeEntry<'a> {
    mode: u32,
    name: &'a str,
    hash: String,
}

/// A tree payload is a run of `<octal mode> SP <name> NUL <20 hash bytes>`
/// entries with no length prefix.
fn tree_entries(data: &[u8]) -> Result<Vec<TreeEntry<'_>>> {
    let corrupt = |what: &str| Error::Pack(format!("malformed tree entry: {what}"));
    let mut rest = data;
    let mut entries = Vec::new();
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| corrupt("missing mode terminator"))?;
        let mode = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|text| u32::from_str_radix(text, 8).ok())
            .ok_or_else(|| corrupt("mode is not octal"))?;
        let nul = rest[space + 1..]
            .iter()
            .position(|&b| b == 0)
            .map(|at| space + 1 + at)
            .ok_or_else(|| corrupt("missing name terminator"))?;
        let name = std::str::from_utf8(&rest[space + 1..nul])
            .map_err(|_| corrupt("name is not valid UTF-8"))?;
        if rest.len() < nul + 21 {
            return Err(corrupt("truncated hash"));
        }
        entries.push(TreeEntry {
            mode,
            name,
            hash: hex::encode(&rest[nul + 1..nul + 21]),
        });
        rest = &rest[nul + 21..];
    }
    Ok(entries)
}

/// First line of a commit payload names its root tree.
fn root_tree_id(commit_id: &str, data: &[u8]) -> Result<String> {
    let tree_line = data
        .strip_prefix(b"tree ")
        .filter(|rest| rest.len() >= 41 && rest[40] == b'\n')
        .ok_or_else(|| Error::Cache(format!("commit {commit_id} has no tree header")))?;
    let id = std::str::from_utf8(&tree_line[..40])
        .ok()
        .filter(|id| id.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| Error::Cache(format!("commit {commit_id} has a malformed tree id")))?;
    Ok(id.to_ascii_lowercase())
}

/// Walk the tree closure of `commit_id`, appending every blob that matches
/// `pattern` to `wanted`. Returns the number of matches; zero is reported
/// with a warning, as a likely configuration mistake.
pub fn resolve_pattern(
    store: &ObjectStore,
    commit_id: &str,
    pattern: &str,
    wanted: &mut Vec<WantedObject>,
) -> Result<usize> {
    let commit = store
        .get(commit_id)
        .ok_or_else(|| Error::Cache(format!("commit {commit_id} missing from the object store")))?;
    if commit.kind != ObjectType::Commit {
        return Err(Error::Cache(format!("{commit_id} is not a commit")));
    }
    let root = root_tree_id(commit_id, &commit.data)?;

    let segments: Vec<&str> = pattern.split('/').collect();
    let mut prefix = Vec::new();
    let count = walk(store, &root, &segments, &mut prefix, wanted)?;
    if count == 0 {
        warn!(pattern, "no files matched pathspec");
    }
    Ok(count)
}

fn walk(
    store: &ObjectStore,
    tree_id: &str,
    segments: &[&str],
    prefix: &mut Vec<String>,
    wanted: &mut Vec<WantedObject>,
) -> Result<usize> {
    let tree = store
        .get(tree_id)
        .ok_or_else(|| Error::Cache(format!("tree {tree_id} missing from the object store")))?;
    if tree.kind != ObjectType::Tree {
        return Err(Error::Cache(format!("{tree_id} is not a tree")));
    }

    let mut count = 0;
    for entry in tree_entries(&tree.data)? {
        if !segment_matches(entry.name, segments[0]) {
            continue;
        }
        let is_dir = entry.mode == DIR_MODE;
        if segments.len() > 1 {
            if !is_dir {
                error!(path = %joined(prefix, entry.name), "not a directory; skipping");
                continue;
            }
            prefix.push(entry.name.to_string());
            count += walk(store, &entry.hash, &segments[1..], prefix, wanted)?;
            prefix.pop();
        } else {
            if is_dir {
                error!(path = %joined(prefix, entry.name), "is a directory; skipping");
                continue;
            }
            wanted.push(WantedObject {
                needed: !store.contains(&entry.hash),
                path: joined(prefix, entry.name),
                hash: entry.hash,
            });
            count += 1;
        }
    }
    Ok(count)
}

fn joined(prefix: &[String], name: &str) -> String {
    if prefix.is_empty() {
        return name.to_string();
    }
    let mut path = prefix.join("/");
    path.push('/');
    path.push_str(name);
    path
}
