//! Per-repository mirror state and the run orchestration: update the tree
//! closure, resolve path patterns, fetch missing blobs, check matched files
//! out into the working tree, and persist the collection for the next run.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::cache::{self, Snapshot};
use crate::delta::Delta;
use crate::error::{Error, Result};
use crate::hash;
use crate::object::{ObjectStore, ObjectType};
use crate::protocol;
use crate::sparse::{self, WantedObject};
use crate::transport::Transport;

/// Sparse local mirror of one remote repository. Mutated only by the
/// protocol driver and the path resolver during a single run; never shared
/// across concurrent runs.
pub struct Mirror {
    /// Tip of the tracked branch as of the last successful run; empty until
    /// the first fetch. When non-empty, the commit and its tree closure are
    /// in the store.
    pub last_commit: String,
    pub domain: String,
    pub name: String,
    pub branch: String,
    /// Control socket shared with the transport across sequential runs.
    pub socket: PathBuf,
    pub store: ObjectStore,
    /// Deltas awaiting resolution; empty between runs.
    pub pending: Vec<Delta>,
    /// Blobs selected by the path patterns; rebuilt each run.
    pub wanted: Vec<WantedObject>,
    work_dir: PathBuf,
    cache_path: PathBuf,
}

/// What a pull produced.
#[derive(Debug)]
pub struct PullReport {
    /// True when the run fetched anything from the remote.
    pub changed: bool,
    /// `(virtual path, working-tree path)` for every pattern match, fetched
    /// or not.
    pub files: Vec<(String, PathBuf)>,
}

impl Mirror {
    /// Load the cached collection for `url`, or create a fresh one. A cache
    /// file that fails to parse is deleted, and the mirror starts cold.
    pub fn open(url: &str, branch: &str, cache_dir: &Path) -> Result<Mirror> {
        fs::create_dir_all(cache_dir)?;
        let slug = repo_slug(url);
        let work_dir = cache_dir.join(&slug);
        let cache_path = cache_dir.join(format!("{slug}.goc"));

        match File::open(&cache_path) {
            Ok(file) => match cache::load(&mut BufReader::new(file)) {
                Ok(snapshot) => {
                    if snapshot.branch != branch {
                        debug!(
                            cached = %snapshot.branch,
                            requested = %branch,
                            "keeping the branch recorded in the cache"
                        );
                    }
                    return Ok(Mirror::from_parts(snapshot, work_dir, cache_path));
                }
                Err(err) => {
                    error!(file = %cache_path.display(), %err, "discarding unreadable cache file");
                    let _ = fs::remove_file(&cache_path);
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                error!(file = %cache_path.display(), %err, "cannot open cache file");
            }
        }

        let (domain, name) = parse_url(url)?;
        let socket = cache_dir.join(format!("{}.socket", hash::sha1_base64(domain.as_bytes())));
        info!(%domain, repo = %name, %branch, "creating a new mirror");
        Ok(Mirror {
            last_commit: String::new(),
            domain,
            name,
            branch: branch.to_string(),
            socket,
            store: ObjectStore::new(),
            pending: Vec::new(),
            wanted: Vec::new(),
            work_dir,
            cache_path,
        })
    }

    fn from_parts(snapshot: Snapshot, work_dir: PathBuf, cache_path: PathBuf) -> Mirror {
        Mirror {
            last_commit: snapshot.last_commit,
            domain: snapshot.domain,
            name: snapshot.name,
            branch: snapshot.branch,
            socket: snapshot.socket,
            store: snapshot.store,
            pending: Vec::new(),
            wanted: Vec::new(),
            work_dir,
            cache_path,
        }
    }

    /// Where matched files are checked out.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// One full mirroring run. On any error the cache file is left exactly
    /// as the previous run wrote it.
    pub fn pull(&mut self, transport: &mut dyn Transport, patterns: &[String]) -> Result<PullReport> {
        self.pending.clear();
        self.wanted.clear();

        let mut changed = protocol::update_trees(self, transport)?;

        if !self.last_commit.is_empty() {
            for pattern in patterns {
                sparse::resolve_pattern(&self.store, &self.last_commit, pattern, &mut self.wanted)?;
            }
        }

        changed |= protocol::fetch_blobs(self, transport)?;

        let files = self
            .wanted
            .iter()
            .map(|want| (want.path.clone(), self.work_dir.join(&want.path)))
            .collect();

        if changed {
            self.checkout();
            self.persist()?;
        }

        Ok(PullReport { changed, files })
    }

    /// Write matched blobs into the working tree. Files already present with
    /// a current hash are left alone; per-file failures are logged and
    /// skipped.
    fn checkout(&self) {
        for want in &self.wanted {
            let dest = self.work_dir.join(&want.path);
            if !want.needed && dest.exists() {
                continue;
            }
            let Some(object) = self.store.get(&want.hash) else {
                error!(path = %want.path, hash = %want.hash, "blob missing from the store");
                continue;
            };
            if object.kind != ObjectType::Blob {
                error!(path = %want.path, kind = %object.kind, "pattern matched a non-blob object");
                continue;
            }
            if let Err(err) = write_file(&dest, &object.data) {
                error!(file = %dest.display(), %err, "failed to write working-tree file");
            }
        }
    }

    /// Serialize into a temporary file beside the cache, then rename over
    /// it, so a crash mid-write never leaves a torn cache.
    fn persist(&self) -> Result<()> {
        let dir = self
            .cache_path
            .parent()
            .ok_or_else(|| Error::Cache("cache path has no parent directory".into()))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        let mut out = BufWriter::new(tmp.as_file_mut());
        cache::save(self, &mut out)?;
        out.flush()?;
        drop(out);
        tmp.persist(&self.cache_path)
            .map_err(|err| Error::Cache(format!("replacing cache file: {err}")))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(domain: &str, name: &str, branch: &str, socket: &str) -> Mirror {
        Mirror {
            last_commit: String::new(),
            domain: domain.to_string(),
            name: name.to_string(),
            branch: branch.to_string(),
            socket: PathBuf::from(socket),
            store: ObjectStore::new(),
            pending: Vec::new(),
            wanted: Vec::new(),
            work_dir: PathBuf::new(),
            cache_path: PathBuf::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_snapshot_for_tests(snapshot: Snapshot) -> Mirror {
        Mirror::from_parts(snapshot, PathBuf::new(), PathBuf::new())
    }
}

fn write_file(dest: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, data)
}

/// `<user>@<host>:<path>` or `ssh://<host>/<path>`.
fn parse_url(url: &str) -> Result<(String, String)> {
    let split = match url.strip_prefix("ssh://") {
        Some(rest) => rest.split_once('/'),
        None => url.split_once(':'),
    };
    match split {
        Some((domain, name)) if !domain.is_empty() && !name.is_empty() => {
            Ok((domain.to_string(), name.to_string()))
        }
        _ => Err(Error::Url(url.to_string())),
    }
}

/// Cache identity for a URL: the base64 SHA-1 of the whole URL with the
/// repository's short name (at most 20 bytes, `.git` stripped) spliced over
/// the front, so cache entries stay recognizable in a directory listing.
fn repo_slug(url: &str) -> String {
    let digest = hash::sha1_base64(url.as_bytes());
    let name = url.rsplit(['/', ':']).next().unwrap_or(url);
    let name = name.strip_suffix(".git").unwrap_or(name);
    let mut cut = name.len().min(20);
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &name[..cut], &digest[cut..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scp_style_urls() {
        let (domain, name) = parse_url("git@example.com:user/repo.git").unwrap();
        assert_eq!(domain, "git@example.com");
        assert_eq!(name, "user/repo.git");
    }

    #[test]
    fn parses_ssh_scheme_urls() {
        let (domain, name) = parse_url("ssh://example.com/srv/git/repo").unwrap();
        assert_eq!(domain, "example.com");
        assert_eq!(name, "srv/git/repo");
    }

    #[test]
    fn rejects_urls_without_a_path() {
        assert!(matches!(parse_url("example.com"), Err(Error::Url(_))));
        assert!(matches!(parse_url("ssh://example.com"), Err(Error::Url(_))));
        assert!(matches!(parse_url(":path"), Err(Error::Url(_))));
    }

    #[test]
    fn slug_starts_with_the_repo_name() {
        let slug = repo_slug("git@example.com:user/repo.git");
        assert!(slug.starts_with("repo"));
        assert_eq!(slug.len(), 27); // base64 sha1 length
    }

    #[test]
    fn slug_caps_long_names_at_20_bytes() {
        let slug = repo_slug("git@example.com:u/a-very-long-repository-name.git");
        assert_eq!(&slug[..20], "a-very-long-reposito");
        assert_eq!(slug.len(), 27);
    }

    #[test]
    fn slugs_differ_for_same_name_under_different_urls() {
        let a = repo_slug("git@a.example:team/tool");
        let b = repo_slug("git@b.example:team/tool");
        assert_ne!(a, b);
        assert!(a.starts_with("tool") && b.starts_with("tool"));
    }

    #[test]
    fn open_recovers_from_a_corrupt_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = "git@example.com:user/repo";
        let cache_file = dir.path().join(format!("{}.goc", repo_slug(url)));
        fs::write(&cache_file, b"definitely not a goc file").unwrap();

        let mirror = Mirror::open(url, "master", dir.path()).unwrap();
        assert!(mirror.last_commit.is_empty());
        assert!(mirror.store.is_empty());
        assert!(!cache_file.exists(), "corrupt cache file should be deleted");
    }

    #[test]
    fn open_creates_a_cold_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Mirror::open("git@example.com:user/repo", "trunk", dir.path()).unwrap();
        assert_eq!(mirror.domain, "git@example.com");
        assert_eq!(mirror.name, "user/repo");
        assert_eq!(mirror.branch, "trunk");
        assert!(mirror.socket.starts_with(dir.path()));
        assert_eq!(mirror.work_dir(), dir.path().join(repo_slug("git@example.com:user/repo")));
    }

    #[test]
    fn persist_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let url = "git@example.com:user/repo";
        let mut mirror = Mirror::open(url, "master", dir.path()).unwrap();
        let blob = crate::object::Object::new(ObjectType::Blob, b"cached".to_vec());
        let blob_id = blob.id.clone();
        mirror.store.insert(blob);
        mirror.persist().unwrap();

        let reloaded = Mirror::open(url, "master", dir.path()).unwrap();
        assert_eq!(reloaded.store.len(), 1);
        assert_eq!(reloaded.store.get(&blob_id).unwrap().data, b"cached");
    }
}
