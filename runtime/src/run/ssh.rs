//! Read-only SSH agent forwarding.
//!
//! RUN never hands the host's agent socket to a container directly. A
//! proxy listens on a private socket and answers from one of two places:
//! the host agent, to which it relays queries and signing requests, or a
//! keyring of private keys read from files. Either way it refuses
//! anything that would change the agent's keys or lock state.

use std::fmt;
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use signature::Signer;
use ssh_key::PrivateKey;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SSH_AGENT_FAILURE: u8 = 5;
const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
const SSH_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;
const SSH_AGENTC_ADD_SMARTCARD_KEY: u8 = 20;
const SSH_AGENTC_REMOVE_SMARTCARD_KEY: u8 = 21;
const SSH_AGENTC_LOCK: u8 = 22;
const SSH_AGENTC_UNLOCK: u8 = 23;
const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
const SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED: u8 = 26;
const SSH_AGENTC_EXTENSION: u8 = 27;

/// Upper bound on one agent message.
const MAX_MESSAGE: usize = 256 * 1024;

/// Upper bound on a private key file.
const MAX_KEY_FILE: u64 = 100 * 1024;

/// Where an SSH mount's agent comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshSource {
    /// Host agent socket
    Socket(PathBuf),
    /// Private keys held in memory
    Keys(Arc<Keyring>),
}

/// Private keys loaded from OpenSSH key files, each with its public key
/// blob in wire form.
#[derive(Clone)]
pub struct Keyring {
    keys: Vec<(Vec<u8>, PrivateKey)>,
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let comments: Vec<&str> = self.keys.iter().map(|(_, k)| k.comment()).collect();
        f.debug_struct("Keyring").field("keys", &comments).finish()
    }
}

impl PartialEq for Keyring {
    fn eq(&self, other: &Self) -> bool {
        self.keys.len() == other.keys.len()
            && self.keys.iter().zip(&other.keys).all(|(a, b)| a.0 == b.0)
    }
}

impl Eq for Keyring {}

impl Keyring {
    /// Read unencrypted OpenSSH private keys from `paths`.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            let mut data = Vec::new();
            std::fs::File::open(path)?
                .take(MAX_KEY_FILE)
                .read_to_end(&mut data)?;
            let key = PrivateKey::from_openssh(&data).map_err(|e| {
                BuildError::InvalidArgument(format!(
                    "cannot parse ssh key {}: {}",
                    path.display(),
                    e
                ))
            })?;
            if key.is_encrypted() {
                return Err(BuildError::InvalidArgument(format!(
                    "ssh key {} is encrypted",
                    path.display()
                )));
            }
            let blob = key.public_key().to_bytes().map_err(|e| {
                BuildError::InvalidArgument(format!(
                    "encoding public key of {}: {}",
                    path.display(),
                    e
                ))
            })?;
            keys.push((blob, key));
        }
        tracing::debug!(keys = keys.len(), "Loaded SSH keys");
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Reply to one request. Only identity listing and signing are served.
    fn answer(&self, request: &[u8]) -> Vec<u8> {
        match request[0] {
            SSH_AGENTC_REQUEST_IDENTITIES => self.identities(),
            SSH_AGENTC_SIGN_REQUEST => self
                .sign(&request[1..])
                .unwrap_or_else(|| vec![SSH_AGENT_FAILURE]),
            _ => vec![SSH_AGENT_FAILURE],
        }
    }

    fn identities(&self) -> Vec<u8> {
        let mut reply = vec![SSH_AGENT_IDENTITIES_ANSWER];
        reply.extend_from_slice(&(self.keys.len() as u32).to_be_bytes());
        for (blob, key) in &self.keys {
            put_string(&mut reply, blob);
            put_string(&mut reply, key.comment().as_bytes());
        }
        reply
    }

    fn sign(&self, mut body: &[u8]) -> Option<Vec<u8>> {
        let blob = take_string(&mut body)?;
        let data = take_string(&mut body)?;
        let (_, key) = self.keys.iter().find(|(b, _)| b.as_slice() == blob)?;
        let signature: ssh_key::Signature = match key.try_sign(data) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "Signing with SSH key failed");
                return None;
            }
        };
        let mut encoded = Vec::new();
        put_string(&mut encoded, signature.algorithm().as_str().as_bytes());
        put_string(&mut encoded, signature.as_bytes());
        let mut reply = vec![SSH_AGENT_SIGN_RESPONSE];
        put_string(&mut reply, &encoded);
        Some(reply)
    }
}

fn put_string(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
}

fn take_string<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let data = *buf;
    let len = u32::from_be_bytes(data.get(..4)?.try_into().ok()?) as usize;
    let value = data.get(4..4 + len)?;
    *buf = &data[4 + len..];
    Some(value)
}

/// Parse an `--ssh` value: `default`, `<id>`, or `<id>=<path>[,<path>...]`
/// where the paths are either one agent socket or any number of private
/// key files. Without paths the host's `SSH_AUTH_SOCK` is used.
pub fn parse_ssh_source<F>(spec: &str, lookup: F) -> Result<(String, SshSource)>
where
    F: Fn(&str) -> Option<String>,
{
    let (id, paths) = match spec.split_once('=') {
        Some((id, paths)) => (
            id.to_string(),
            paths
                .split(',')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect::<Vec<_>>(),
        ),
        None => (spec.to_string(), Vec::new()),
    };
    if id.is_empty() {
        return Err(BuildError::InvalidArgument(format!(
            "invalid ssh source {:?}: missing id",
            spec
        )));
    }
    if paths.is_empty() {
        let socket = lookup("SSH_AUTH_SOCK").ok_or_else(|| {
            BuildError::InvalidArgument(format!(
                "ssh source {:?} names no socket and SSH_AUTH_SOCK is not set",
                id
            ))
        })?;
        return Ok((id, SshSource::Socket(PathBuf::from(socket))));
    }

    let mut sockets = Vec::new();
    let mut key_files = Vec::new();
    for path in paths {
        let meta = std::fs::metadata(&path).map_err(|e| {
            BuildError::InvalidArgument(format!(
                "ssh source {:?}: {}: {}",
                id,
                path.display(),
                e
            ))
        })?;
        if meta.file_type().is_socket() {
            sockets.push(path);
        } else {
            key_files.push(path);
        }
    }
    match (sockets.len(), key_files.is_empty()) {
        (0, _) => Ok((id, SshSource::Keys(Arc::new(Keyring::load(&key_files)?)))),
        (1, true) => Ok((id, SshSource::Socket(sockets.remove(0)))),
        (1, false) => Err(BuildError::InvalidArgument(format!(
            "ssh source {:?}: cannot mix keys and a socket",
            id
        ))),
        _ => Err(BuildError::InvalidArgument(format!(
            "ssh source {:?}: only one socket is allowed",
            id
        ))),
    }
}

fn is_mutating(kind: u8) -> bool {
    matches!(
        kind,
        SSH_AGENTC_ADD_IDENTITY
            | SSH_AGENTC_REMOVE_IDENTITY
            | SSH_AGENTC_REMOVE_ALL_IDENTITIES
            | SSH_AGENTC_ADD_SMARTCARD_KEY
            | SSH_AGENTC_REMOVE_SMARTCARD_KEY
            | SSH_AGENTC_LOCK
            | SSH_AGENTC_UNLOCK
            | SSH_AGENTC_ADD_ID_CONSTRAINED
            | SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED
            | SSH_AGENTC_EXTENSION
    )
}

async fn read_message(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 || len > MAX_MESSAGE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("agent message of {} bytes", len),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_message(stream: &mut UnixStream, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await
}

/// Forward one request to the host agent, connecting on first use.
async fn relay(
    agent: &mut Option<UnixStream>,
    upstream: &Path,
    request: &[u8],
) -> std::io::Result<Vec<u8>> {
    if agent.is_none() {
        *agent = Some(UnixStream::connect(upstream).await?);
    }
    let Some(conn) = agent.as_mut() else {
        return Ok(vec![SSH_AGENT_FAILURE]);
    };
    write_message(conn, request).await?;
    Ok(read_message(conn)
        .await?
        .unwrap_or_else(|| vec![SSH_AGENT_FAILURE]))
}

async fn serve_client(mut client: UnixStream, source: SshSource) -> std::io::Result<()> {
    let mut agent: Option<UnixStream> = None;
    while let Some(request) = read_message(&mut client).await? {
        if is_mutating(request[0]) {
            tracing::debug!(kind = request[0], "Refusing agent request");
            write_message(&mut client, &[SSH_AGENT_FAILURE]).await?;
            continue;
        }
        let reply = match &source {
            SshSource::Socket(upstream) => relay(&mut agent, upstream, &request).await?,
            SshSource::Keys(keyring) => keyring.answer(&request),
        };
        write_message(&mut client, &reply).await?;
    }
    Ok(())
}

/// A running proxy agent. Dropping it stops the accept loop and removes
/// the socket.
pub struct AgentProxy {
    socket: PathBuf,
    _dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AgentProxy {
    /// Listen on a fresh socket under `tmp_dir`, answering from `source`.
    pub fn start(source: &SshSource, tmp_dir: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("a3s-build-ssh-")
            .tempdir_in(tmp_dir)
            .map_err(|e| {
                BuildError::RuntimeError(format!(
                    "creating agent socket directory in {}: {}",
                    tmp_dir.display(),
                    e
                ))
            })?;
        let socket = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket).map_err(|e| {
            BuildError::RuntimeError(format!("listening on {}: {}", socket.display(), e))
        })?;
        let (tx, mut rx) = oneshot::channel::<()>();
        let source = source.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((client, _)) => {
                            let source = source.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_client(client, source).await {
                                    tracing::debug!(error = %e, "Agent client ended");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Agent proxy accept failed");
                            break;
                        }
                    },
                }
            }
        });
        tracing::debug!(socket = %socket.display(), "Started SSH agent proxy");
        Ok(Self {
            socket,
            _dir: dir,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

impl Drop for AgentProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        tracing::debug!(socket = %self.socket.display(), "Stopped SSH agent proxy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signature::Verifier;
    use ssh_key::{Algorithm, LineEnding};

    /// An upstream agent that answers every request with an empty
    /// identity list.
    fn fake_agent(path: &Path) -> JoinHandle<()> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(Some(_)) = read_message(&mut conn).await {
                        write_message(&mut conn, &[SSH_AGENT_IDENTITIES_ANSWER, 0, 0, 0, 0])
                            .await
                            .unwrap();
                    }
                });
            }
        })
    }

    fn key_file(dir: &Path, name: &str, comment: &str) -> (PathBuf, PrivateKey) {
        let mut key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        key.set_comment(comment);
        let path = dir.join(name);
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        (path, key)
    }

    async fn request(client: &mut UnixStream, body: &[u8]) -> Vec<u8> {
        write_message(client, body).await.unwrap();
        read_message(client).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_proxy_relays_queries_and_refuses_changes() {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.sock");
        let _agent = fake_agent(&upstream);
        let proxy = AgentProxy::start(&SshSource::Socket(upstream), dir.path()).unwrap();

        let mut client = UnixStream::connect(proxy.socket_path()).await.unwrap();
        let reply = request(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
        assert_eq!(reply[0], SSH_AGENT_IDENTITIES_ANSWER);

        for refused in [
            vec![SSH_AGENTC_ADD_IDENTITY, 1, 2, 3],
            vec![SSH_AGENTC_LOCK],
            vec![SSH_AGENTC_EXTENSION, 0, 0, 0, 0],
        ] {
            assert_eq!(request(&mut client, &refused).await, vec![SSH_AGENT_FAILURE]);
        }
    }

    #[tokio::test]
    async fn test_keyring_lists_and_signs_read_only() {
        let dir = TempDir::new().unwrap();
        let (first, first_key) = key_file(dir.path(), "id_first", "first@host");
        let (second, _) = key_file(dir.path(), "id_second", "second@host");
        let spec = format!("git={},{}", first.display(), second.display());
        let (id, source) = parse_ssh_source(&spec, |_| None).unwrap();
        assert_eq!(id, "git");
        let SshSource::Keys(keyring) = &source else {
            panic!("expected a keyring, got {:?}", source);
        };
        assert_eq!(keyring.len(), 2);

        let proxy = AgentProxy::start(&source, dir.path()).unwrap();
        let mut client = UnixStream::connect(proxy.socket_path()).await.unwrap();

        let reply = request(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
        assert_eq!(reply[0], SSH_AGENT_IDENTITIES_ANSWER);
        assert_eq!(&reply[1..5], &2u32.to_be_bytes());
        let mut body = &reply[5..];
        let blob = take_string(&mut body).unwrap().to_vec();
        assert_eq!(take_string(&mut body).unwrap(), b"first@host");
        assert_eq!(blob, first_key.public_key().to_bytes().unwrap());

        let data = b"session data";
        let mut sign = vec![SSH_AGENTC_SIGN_REQUEST];
        put_string(&mut sign, &blob);
        put_string(&mut sign, data);
        sign.extend_from_slice(&0u32.to_be_bytes());
        let reply = request(&mut client, &sign).await;
        assert_eq!(reply[0], SSH_AGENT_SIGN_RESPONSE);
        let mut body = &reply[1..];
        let mut encoded = take_string(&mut body).unwrap();
        assert_eq!(take_string(&mut encoded).unwrap(), b"ssh-ed25519");
        let raw = take_string(&mut encoded).unwrap();
        let signature = ssh_key::Signature::new(Algorithm::Ed25519, raw.to_vec()).unwrap();
        Verifier::verify(first_key.public_key(), data, &signature).unwrap();

        let mut unknown = vec![SSH_AGENTC_SIGN_REQUEST];
        put_string(&mut unknown, b"not a key");
        put_string(&mut unknown, data);
        assert_eq!(request(&mut client, &unknown).await, vec![SSH_AGENT_FAILURE]);

        for refused in [
            vec![SSH_AGENTC_REMOVE_ALL_IDENTITIES],
            vec![SSH_AGENTC_LOCK, 0, 0, 0, 1, b'x'],
            vec![SSH_AGENTC_ADD_IDENTITY, 1, 2, 3],
        ] {
            assert_eq!(request(&mut client, &refused).await, vec![SSH_AGENT_FAILURE]);
        }
        let reply = request(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
        assert_eq!(&reply[1..5], &2u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_drop_removes_socket() {
        let dir = TempDir::new().unwrap();
        let source = SshSource::Socket(dir.path().join("missing.sock"));
        let proxy = AgentProxy::start(&source, dir.path()).unwrap();
        let socket = proxy.socket_path().to_path_buf();
        assert!(socket.exists());
        drop(proxy);
        assert!(!socket.exists());
    }

    #[test]
    fn test_parse_ssh_source() {
        let env = |key: &str| (key == "SSH_AUTH_SOCK").then(|| "/run/agent.sock".to_string());
        let (id, source) = parse_ssh_source("default", env).unwrap();
        assert_eq!(id, "default");
        assert_eq!(source, SshSource::Socket(PathBuf::from("/run/agent.sock")));

        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("other.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        let (id, source) = parse_ssh_source(&format!("git={}", socket.display()), |_| None).unwrap();
        assert_eq!(id, "git");
        assert_eq!(source, SshSource::Socket(socket.clone()));

        assert!(parse_ssh_source("default", |_| None).is_err());
        assert!(parse_ssh_source("=/x", |_| None).is_err());
        assert!(parse_ssh_source("k=/does/not/exist", |_| None).is_err());

        let garbage = dir.path().join("id_garbage");
        std::fs::write(&garbage, "key").unwrap();
        assert!(parse_ssh_source(&format!("k={}", garbage.display()), |_| None).is_err());

        let (key, _) = key_file(dir.path(), "id_ed25519", "me@host");
        let mixed = format!("k={},{}", key.display(), socket.display());
        assert!(parse_ssh_source(&mixed, |_| None).is_err());
    }
}
