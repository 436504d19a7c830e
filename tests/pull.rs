//! End-to-end pull scenarios over scripted in-memory sessions: each test
//! stages the byte streams an upload-pack peer would produce and checks the
//! mirror's working tree, cache file, and negotiation requests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Cursor, Write};
use std::rc::Rc;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use gitsip::hash;
use gitsip::mirror::Mirror;
use gitsip::transport::{Session, Transport};

// ---- scripted transport ----------------------------------------------------

struct SharedSink(Rc<RefCell<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hands out one pre-recorded response per `connect` and keeps everything
/// the driver wrote, per session.
struct ScriptedTransport {
    responses: VecDeque<Vec<u8>>,
    sent: Vec<Rc<RefCell<Vec<u8>>>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<Vec<u8>>) -> Self {
        ScriptedTransport {
            responses: responses.into(),
            sent: Vec::new(),
        }
    }

    fn sessions_used(&self) -> usize {
        self.sent.len()
    }

    fn sent_text(&self, session: usize) -> String {
        String::from_utf8_lossy(&self.sent[session].borrow()).into_owned()
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> gitsip::Result<Session> {
        let response = self.responses.pop_front().unwrap_or_default();
        let sink = Rc::new(RefCell::new(Vec::new()));
        self.sent.push(Rc::clone(&sink));
        Ok(Session::from_streams(
            Box::new(SharedSink(sink)),
            Box::new(Cursor::new(response)),
        ))
    }
}

// ---- wire fixtures ---------------------------------------------------------

fn pkt(text: &str) -> Vec<u8> {
    format!("{:04x}{}", text.len() + 4, text).into_bytes()
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn entry_header(kind: u8, mut length: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = (kind << 4) | (length & 0x0f) as u8;
    length >>= 4;
    while length > 0 {
        out.push(byte | 0x80);
        byte = (length & 0x7f) as u8;
        length >>= 7;
    }
    out.push(byte);
    out
}

fn base_entry(kind: u8, data: &[u8]) -> Vec<u8> {
    let mut entry = entry_header(kind, data.len());
    entry.extend_from_slice(&compress(data));
    entry
}

fn ref_delta_entry(base_id: &str, patch: &[u8]) -> Vec<u8> {
    let mut entry = entry_header(7, patch.len());
    entry.extend_from_slice(&hex::decode(base_id).unwrap());
    entry.extend_from_slice(&compress(patch));
    entry
}

fn pack_of(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        pack.extend_from_slice(entry);
    }
    pack.extend_from_slice(&[0u8; 20]);
    pack
}

fn tree_payload(entries: &[(&str, &str, &str)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (mode, name, id) in entries {
        data.extend_from_slice(mode.as_bytes());
        data.push(b' ');
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(&hex::decode(id).unwrap());
    }
    data
}

fn commit_payload(tree_id: &str) -> Vec<u8> {
    format!("tree {tree_id}\nauthor tester <t@example> 0 +0000\ncommitter tester <t@example> 0 +0000\n\nsnapshot\n")
        .into_bytes()
}

fn advertisement(tip: &str) -> Vec<u8> {
    let mut out = pkt(&format!("{tip} HEAD\0multi_ack filter no-progress\n"));
    out.extend_from_slice(&pkt(&format!("{tip} refs/heads/master\n")));
    out.extend_from_slice(b"0000");
    out
}

/// Tree fetch response: shallow section, the acknowledgment pair, raw pack.
fn tree_fetch_response(tip: &str, pack: &[u8]) -> Vec<u8> {
    let mut out = advertisement(tip);
    out.extend_from_slice(&pkt(&format!("shallow {tip}\n")));
    out.extend_from_slice(b"0000");
    out.extend_from_slice(&pkt("NAK\n"));
    out.extend_from_slice(&pkt("NAK\n"));
    out.extend_from_slice(pack);
    out
}

/// Blob fetch response: single NAK, then the raw pack.
fn blob_fetch_response(tip: &str, pack: &[u8]) -> Vec<u8> {
    let mut out = advertisement(tip);
    out.extend_from_slice(&pkt("NAK\n"));
    out.extend_from_slice(pack);
    out
}

// ---- scenarios -------------------------------------------------------------

const URL: &str = "git@example.com:user/repo";
const README: &[u8] = b"# fixture readme\n";

struct Repo {
    readme_id: String,
    tree_id: String,
    commit_id: String,
    commit: Vec<u8>,
    tree: Vec<u8>,
}

fn simple_repo() -> Repo {
    let readme_id = hash::object_id("blob", README);
    let tree = tree_payload(&[("100644", "README.md", &readme_id)]);
    let tree_id = hash::object_id("tree", &tree);
    let commit = commit_payload(&tree_id);
    let commit_id = hash::object_id("commit", &commit);
    Repo {
        readme_id,
        tree_id,
        commit_id,
        commit,
        tree,
    }
}

#[test]
fn cold_clone_fetches_trees_then_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let repo = simple_repo();

    let tree_pack = pack_of(&[base_entry(1, &repo.commit), base_entry(2, &repo.tree)]);
    let blob_pack = pack_of(&[base_entry(3, README)]);
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&repo.commit_id, &tree_pack),
        blob_fetch_response(&repo.commit_id, &blob_pack),
    ]);

    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    let report = mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();

    assert!(report.changed);
    assert_eq!(report.files.len(), 1);
    let (virtual_path, file) = &report.files[0];
    assert_eq!(virtual_path, "README.md");
    assert_eq!(fs::read(file).unwrap(), README);
    assert_eq!(mirror.last_commit, repo.commit_id);
    assert!(mirror.pending.is_empty());

    assert_eq!(transport.sessions_used(), 2);
    let negotiation = transport.sent_text(0);
    assert!(negotiation.contains(&format!(
        "want {} multi_ack filter no-progress\n",
        repo.commit_id
    )));
    assert!(negotiation.contains("deepen 1\n"));
    assert!(negotiation.contains("filter blob:none\n"));
    assert!(negotiation.ends_with("0009done\n"));
    let blob_request = transport.sent_text(1);
    assert!(blob_request.contains(&format!("want {} no-progress\n", repo.readme_id)));
}

#[test]
fn warm_rerun_with_unchanged_tip_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let repo = simple_repo();

    let tree_pack = pack_of(&[base_entry(1, &repo.commit), base_entry(2, &repo.tree)]);
    let blob_pack = pack_of(&[base_entry(3, README)]);
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&repo.commit_id, &tree_pack),
        blob_fetch_response(&repo.commit_id, &blob_pack),
    ]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();
    let cache_file = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.path().extension().is_some_and(|ext| ext == "goc"))
        .expect("cache file written")
        .path();
    let cached_bytes = fs::read(&cache_file).unwrap();

    // second run: only the ref advertisement, tip unchanged
    let mut transport = ScriptedTransport::new(vec![advertisement(&repo.commit_id)]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    let report = mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();

    assert!(!report.changed);
    assert_eq!(report.files.len(), 1, "unchanged files are still reported");
    assert_eq!(transport.sessions_used(), 1);
    assert_eq!(transport.sent_text(0), "", "no negotiation beyond discovery");
    assert_eq!(fs::read(&cache_file).unwrap(), cached_bytes);
}

#[test]
fn tree_only_update_announces_haves_and_skips_blob_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let repo = simple_repo();

    // run 1: cold clone
    let tree_pack = pack_of(&[base_entry(1, &repo.commit), base_entry(2, &repo.tree)]);
    let blob_pack = pack_of(&[base_entry(3, README)]);
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&repo.commit_id, &tree_pack),
        blob_fetch_response(&repo.commit_id, &blob_pack),
    ]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();

    // the remote gains a file the pattern does not cover
    let other_id = hash::object_id("blob", b"unrelated\n");
    let tree2 = tree_payload(&[
        ("100644", "README.md", &repo.readme_id),
        ("100644", "unrelated.txt", &other_id),
    ]);
    let tree2_id = hash::object_id("tree", &tree2);
    let commit2 = commit_payload(&tree2_id);
    let commit2_id = hash::object_id("commit", &commit2);

    let update_pack = pack_of(&[base_entry(1, &commit2), base_entry(2, &tree2)]);
    let mut transport =
        ScriptedTransport::new(vec![tree_fetch_response(&commit2_id, &update_pack)]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    let report = mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();

    assert!(report.changed);
    assert_eq!(mirror.last_commit, commit2_id);
    assert_eq!(transport.sessions_used(), 1, "no blob fetch was needed");
    let negotiation = transport.sent_text(0);
    assert!(
        negotiation.contains(&format!("have {}\n", repo.tree_id)),
        "known trees are announced"
    );

    // the new state is what the next run resumes from
    let reloaded = Mirror::open(URL, "master", dir.path()).unwrap();
    assert_eq!(reloaded.last_commit, commit2_id);
    assert!(reloaded.store.contains(&tree2_id));
}

#[test]
fn sparse_fetch_materializes_only_matching_blobs() {
    let dir = tempfile::tempdir().unwrap();

    let alpha = b"int alpha(void);\n".as_slice();
    let beta = b"int beta(void);\n".as_slice();
    let notes = b"not a header\n".as_slice();
    let alpha_id = hash::object_id("blob", alpha);
    let beta_id = hash::object_id("blob", beta);
    let notes_id = hash::object_id("blob", notes);

    let src_tree = tree_payload(&[
        ("100644", "alpha.h", &alpha_id),
        ("100644", "beta.h", &beta_id),
        ("100644", "notes.txt", &notes_id),
    ]);
    let src_tree_id = hash::object_id("tree", &src_tree);
    let root = tree_payload(&[("40000", "src", &src_tree_id)]);
    let root_id = hash::object_id("tree", &root);
    let commit = commit_payload(&root_id);
    let commit_id = hash::object_id("commit", &commit);

    let tree_pack = pack_of(&[
        base_entry(1, &commit),
        base_entry(2, &root),
        base_entry(2, &src_tree),
    ]);
    let blob_pack = pack_of(&[base_entry(3, alpha), base_entry(3, beta)]);
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&commit_id, &tree_pack),
        blob_fetch_response(&commit_id, &blob_pack),
    ]);

    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    let report = mirror
        .pull(&mut transport, &["src/*.h".to_string()])
        .unwrap();

    assert!(report.changed);
    let paths: Vec<&str> = report.files.iter().map(|(v, _)| v.as_str()).collect();
    assert_eq!(paths, vec!["src/alpha.h", "src/beta.h"]);
    assert_eq!(fs::read(mirror.work_dir().join("src/alpha.h")).unwrap(), alpha);
    assert_eq!(fs::read(mirror.work_dir().join("src/beta.h")).unwrap(), beta);
    assert!(!mirror.work_dir().join("src/notes.txt").exists());

    let blob_request = transport.sent_text(1);
    assert!(blob_request.contains(&format!("want {alpha_id} no-progress\n")));
    assert!(blob_request.contains(&format!("want {beta_id}\n")));
    assert!(!blob_request.contains(&notes_id));
}

#[test]
fn delta_chain_in_the_blob_pack_is_resolved() {
    let dir = tempfile::tempdir().unwrap();

    let base = b"config = false\n".as_slice();
    let base_id = hash::object_id("blob", base);
    // patch: copy "config = " (9 bytes), insert "true\n"
    let mut patch = vec![base.len() as u8, 14, 0x90, 0x09];
    patch.extend_from_slice(&[0x05, b't', b'r', b'u', b'e', b'\n']);
    let derived = b"config = true\n".as_slice();
    let derived_id = hash::object_id("blob", derived);

    let tree = tree_payload(&[
        ("100644", "base.cfg", &base_id),
        ("100644", "derived.cfg", &derived_id),
    ]);
    let tree_id = hash::object_id("tree", &tree);
    let commit = commit_payload(&tree_id);
    let commit_id = hash::object_id("commit", &commit);

    let tree_pack = pack_of(&[base_entry(1, &commit), base_entry(2, &tree)]);
    let blob_pack = pack_of(&[
        base_entry(3, base),
        ref_delta_entry(&base_id, &patch),
    ]);
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&commit_id, &tree_pack),
        blob_fetch_response(&commit_id, &blob_pack),
    ]);

    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    let report = mirror.pull(&mut transport, &["*.cfg".to_string()]).unwrap();

    assert!(report.changed);
    assert!(mirror.pending.is_empty());
    assert!(mirror.store.contains(&base_id));
    assert!(mirror.store.contains(&derived_id));
    assert_eq!(
        fs::read(mirror.work_dir().join("derived.cfg")).unwrap(),
        derived
    );
    assert_eq!(fs::read(mirror.work_dir().join("base.cfg")).unwrap(), base);
}

#[test]
fn corrupt_cache_file_falls_back_to_a_cold_clone() {
    let dir = tempfile::tempdir().unwrap();
    let repo = simple_repo();

    // run once to learn the cache file's path, then corrupt it
    let tree_pack = pack_of(&[base_entry(1, &repo.commit), base_entry(2, &repo.tree)]);
    let blob_pack = pack_of(&[base_entry(3, README)]);
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&repo.commit_id, &tree_pack),
        blob_fetch_response(&repo.commit_id, &blob_pack),
    ]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();
    let cache_file = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.path().extension().is_some_and(|ext| ext == "goc"))
        .unwrap()
        .path();
    let full = fs::read(&cache_file).unwrap();
    fs::write(&cache_file, &full[..full.len() / 2]).unwrap();

    // the loader must discard the truncated file and clone from scratch
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&repo.commit_id, &tree_pack),
        blob_fetch_response(&repo.commit_id, &blob_pack),
    ]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    assert!(mirror.last_commit.is_empty(), "cold after corruption");
    let report = mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();

    assert!(report.changed);
    assert_eq!(transport.sessions_used(), 2);
    assert_eq!(mirror.last_commit, repo.commit_id);
    assert_eq!(
        fs::read(mirror.work_dir().join("README.md")).unwrap(),
        README
    );
}

#[test]
fn failed_negotiation_keeps_the_cache_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let repo = simple_repo();

    let tree_pack = pack_of(&[base_entry(1, &repo.commit), base_entry(2, &repo.tree)]);
    let blob_pack = pack_of(&[base_entry(3, README)]);
    let mut transport = ScriptedTransport::new(vec![
        tree_fetch_response(&repo.commit_id, &tree_pack),
        blob_fetch_response(&repo.commit_id, &blob_pack),
    ]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap();
    let cache_file = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.path().extension().is_some_and(|ext| ext == "goc"))
        .unwrap()
        .path();
    let cached_bytes = fs::read(&cache_file).unwrap();

    // a new tip is advertised but the pack stream is garbage
    let other_tip = "12".repeat(20);
    let mut bad = advertisement(&other_tip);
    bad.extend_from_slice(&pkt(&format!("shallow {other_tip}\n")));
    bad.extend_from_slice(b"0000");
    bad.extend_from_slice(&pkt("NAK\n"));
    bad.extend_from_slice(&pkt("NAK\n"));
    bad.extend_from_slice(b"JUNKJUNKJUNKJUNK");
    let mut transport = ScriptedTransport::new(vec![bad]);
    let mut mirror = Mirror::open(URL, "master", dir.path()).unwrap();
    let err = mirror
        .pull(&mut transport, &["README.md".to_string()])
        .unwrap_err();
    assert!(matches!(err, gitsip::Error::Pack(_)));

    assert_eq!(fs::read(&cache_file).unwrap(), cached_bytes);
    let reloaded = Mirror::open(URL, "master", dir.path()).unwrap();
    assert_eq!(reloaded.last_commit, repo.commit_id);
}
