//! Byte channels to the remote `git-upload-pack` service. The protocol
//! driver only sees a bidirectional stream; the default supplier tunnels it
//! through a multiplexed ssh subprocess, tests plug in in-memory streams.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};

const SSH_PERSIST: &str = "1m";

/// One request/response exchange with the remote service.
pub struct Session {
    /// Bytes to the peer.
    pub input: Box<dyn Write>,
    /// Bytes from the peer.
    pub output: Box<dyn Read>,
    child: Option<Child>,
}

impl Session {
    /// Session over arbitrary streams; used by tests and in-memory peers.
    pub fn from_streams(input: Box<dyn Write>, output: Box<dyn Read>) -> Self {
        Session {
            input,
            output,
            child: None,
        }
    }

    /// Close both pipes and reap the subprocess, if any. A non-zero exit is
    /// a transport failure.
    pub fn close(self) -> Result<()> {
        let Session {
            input,
            output,
            child,
        } = self;
        drop(input);
        drop(output);
        if let Some(mut child) = child {
            let status = child
                .wait()
                .map_err(|err| Error::Transport(format!("waiting for transport: {err}")))?;
            if !status.success() {
                return Err(Error::Transport(format!("transport exited with {status}")));
            }
        }
        Ok(())
    }
}

/// Supplier of fresh sessions. The peer is stateless between requests, so
/// each negotiation phase connects anew; the underlying connection is
/// amortized by the transport, not the caller.
pub trait Transport {
    fn connect(&mut self) -> Result<Session>;
}

/// `ssh` subprocess running `git-upload-pack` remotely, multiplexed over a
/// shared control socket so that back-to-back sessions reuse one connection.
pub struct SshTransport {
    domain: String,
    name: String,
    socket: PathBuf,
}

impl SshTransport {
    pub fn new(domain: &str, name: &str, socket: &Path) -> Self {
        SshTransport {
            domain: domain.to_string(),
            name: name.to_string(),
            socket: socket.to_path_buf(),
        }
    }
}

impl Transport for SshTransport {
    fn connect(&mut self) -> Result<Session> {
        let mut child = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPersist={SSH_PERSIST}"))
            .args(["-o", "ControlMaster=auto"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "ConnectTimeout=5"])
            .args(["-o", "ServerAliveInterval=5"])
            .arg("-S")
            .arg(&self.socket)
            .arg(&self.domain)
            .arg(format!("git-upload-pack '{}'", self.name))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| Error::Transport(format!("spawning ssh: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("ssh stdin was not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("ssh stdout was not piped".into()))?;
        debug!(domain = %self.domain, repo = %self.name, "connected to upload-pack");

        Ok(Session {
            input: Box::new(BufWriter::new(stdin)),
            output: Box::new(BufReader::new(stdout)),
            child: Some(child),
        })
    }
}
