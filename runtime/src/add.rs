//! ADD and COPY.
//!
//! Every source is streamed through an OS pipe: a producer thread writes
//! a tar stream of the source (a local glob match, a downloaded file or a
//! cloned repository) while the calling thread digests the stream and
//! extracts it into the container. In link mode the content lands in a
//! staging directory that becomes a separate layer at commit time.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::idmap::{IdMappings, IdPair};
use chrono::{DateTime, Utc};
use tempfile::{NamedTempFile, TempDir};

use crate::builder::{Builder, LinkedLayer};
use crate::copier::{
    self, clean_path, join_under, rel_subdirectory, ExcludeMatcher, GetOptions, MkdirOptions,
    PutOptions, StatOptions,
};
use crate::digest::{encoded, parse_digest, HashingWriter};
use crate::digester::{CompositeDigester, ContentType, Digester};
use crate::pipe::os_pipe;
use crate::retry::{retry_if_necessary, RetryOptions};
use crate::store::Store;
use crate::tarfilter::{Chain, TarAction, TarFilterer, TarItem};
use crate::user::{running_in_user_namespace, user_for_copy};

/// Options for [`Builder::add`].
#[derive(Default)]
pub struct AddOptions<'a> {
    /// Octal permissions for every copied item
    pub chmod: String,
    /// `user[:group]` owning every copied item (default 0:0)
    pub chown: String,
    /// Expected `sha256:<hex>` of a remote source
    pub checksum: String,
    /// Keep source ownership when `chown` is unset
    pub preserve_ownership: bool,
    /// Receives everything that is copied
    pub hasher: Option<&'a mut (dyn Write + Send)>,
    /// `.containerignore` patterns, relative to the context directory
    pub excludes: Vec<String>,
    /// Where the excludes came from, for error messages
    pub ignore_file: String,
    /// Base for local sources; `/` with sources relative to the current
    /// directory when unset
    pub context_dir: Option<PathBuf>,
    /// Owner mapping of the sources when they belong to another container
    pub id_mappings: Option<IdMappings>,
    /// Digest the content without storing it
    pub dry_run: bool,
    pub strip_setuid_bit: bool,
    pub strip_setgid_bit: bool,
    pub strip_sticky_bit: bool,
    /// Directory holding `*.crt` CA certificates for remote sources
    pub cert_path: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
    pub retry: RetryOptions,
    /// Keep the parent directories after a `/./` marker in the source
    pub parents: bool,
    /// Timestamp forced onto all content
    pub timestamp: Option<DateTime<Utc>>,
    /// Stage the content as a separate layer
    pub link: bool,
    /// Appended to the history of a linked layer
    pub build_metadata: String,
}

/// Kind of an ADD/COPY source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Remote,
    Git,
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn is_git_location(source: &str) -> bool {
    let without_fragment = source.split('#').next().unwrap_or(source);
    without_fragment.ends_with(".git")
}

/// Classify a source. Git locations are HTTP(S) URLs ending in `.git`,
/// optionally followed by a `#ref[:subdir]` fragment.
pub fn classify_source(source: &str) -> SourceKind {
    if !is_url(source) {
        SourceKind::Local
    } else if is_git_location(source) {
        SourceKind::Git
    } else {
        SourceKind::Remote
    }
}

/// Prefix stripped from names in parents mode, and the parent directory
/// entries to drop, derived from the `/./` pivot in `source`.
fn parents_pivot(source: &str, context_dir: &Path) -> (PathBuf, Vec<PathBuf>) {
    let context = context_dir.display().to_string();
    let trimmed = source.strip_prefix(context.as_str()).unwrap_or(source);
    let prefix = match trimmed.split_once("/./") {
        Some((prefix, _)) => prefix,
        None => return (PathBuf::from("/"), Vec::new()),
    };
    let prefix = clean_path(&Path::new("/").join(prefix));
    let prefix = prefix.strip_prefix("/").unwrap_or(&prefix).to_path_buf();
    let skip = prefix
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("."))
        .map(Path::to_path_buf)
        .collect();
    (prefix, skip)
}

/// Where a source's tar stream ends up.
enum Sink<'a> {
    Discard,
    Put {
        root: &'a Path,
        directory: &'a Path,
        options: PutOptions,
    },
}

/// Reader that copies what it reads into a digester and an optional
/// caller-supplied writer.
struct TeeReader<'a, R, E> {
    inner: R,
    digester: &'a mut dyn Digester,
    extra: Option<E>,
}

impl<R: Read, E: Write> Read for TeeReader<'_, R, E> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.digester.write_all(&buf[..n])?;
            if let Some(extra) = self.extra.as_mut() {
                extra.write_all(&buf[..n])?;
            }
        }
        Ok(n)
    }
}

/// Run `produce` on a worker thread, feeding its tar stream through the
/// digester into `sink`. Failures on both sides are reported together.
fn pump<P, E>(
    source: &str,
    produce: P,
    sink: Sink<'_>,
    digester: &mut dyn Digester,
    extra: Option<E>,
) -> Result<()>
where
    P: FnOnce(File) -> Result<()> + Send,
    E: Write,
{
    let (reader, writer) = os_pipe()?;
    let (produced, consumed) = std::thread::scope(|scope| {
        let producer = scope.spawn(move || produce(writer));
        let mut tee = TeeReader {
            inner: reader,
            digester,
            extra,
        };
        let consumed = match &sink {
            Sink::Discard => std::io::copy(&mut tee, &mut std::io::sink())
                .map(|_| ())
                .map_err(BuildError::from),
            Sink::Put {
                root,
                directory,
                options,
            } => copier::put(root, directory, options, &mut tee),
        };
        drop(tee);
        let produced = producer
            .join()
            .unwrap_or_else(|_| Err(BuildError::Internal("copy producer panicked".to_string())));
        (produced, consumed)
    });
    let mut errors = Vec::new();
    if let Err(e) = produced {
        errors.push(BuildError::CopierError(format!("reading {:?}: {}", source, e)));
    }
    if let Err(e) = consumed {
        errors.push(BuildError::CopierError(format!("storing {:?}: {}", source, e)));
    }
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(BuildError::from_many(errors)),
    }
}

/// A remote file downloaded to a temporary location.
struct Download {
    file: NamedTempFile,
    size: u64,
    last_modified: Option<DateTime<Utc>>,
}

fn http_client(options: &AddOptions<'_>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if options.insecure_skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(dir) = &options.cert_path {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            BuildError::ConfigError(format!("reading certificates from {}: {}", dir.display(), e))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let pem = std::fs::read(&path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                BuildError::ConfigError(format!("parsing certificate {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
    }
    builder
        .build()
        .map_err(|e| BuildError::ConfigError(format!("creating HTTP client: {}", e)))
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    dir: &Path,
    expected: Option<&str>,
) -> Result<Download> {
    let network = |e: reqwest::Error| BuildError::Network {
        url: url.to_string(),
        message: e.to_string(),
    };
    let mut response = client.get(url).send().await.map_err(network)?;
    let status = response.status();
    if status.is_server_error() {
        return Err(BuildError::Network {
            url: url.to_string(),
            message: format!("invalid response status {}", status.as_u16()),
        });
    }
    if !status.is_success() {
        return Err(BuildError::Other(format!(
            "fetching {}: invalid response status {}",
            url,
            status.as_u16()
        )));
    }
    let last_modified = match response.headers().get(reqwest::header::LAST_MODIFIED) {
        Some(value) => {
            let text = value.to_str().unwrap_or_default();
            let parsed = DateTime::parse_from_rfc2822(text).map_err(|e| {
                BuildError::Other(format!("parsing last-modified time {:?}: {}", text, e))
            })?;
            Some(parsed.with_timezone(&Utc))
        }
        None => None,
    };

    let file = tempfile::Builder::new()
        .prefix("download")
        .tempfile_in(dir)
        .map_err(|e| {
            BuildError::Other(format!("creating temporary file to hold {:?}: {}", url, e))
        })?;
    let mut writer = HashingWriter::new(file.reopen()?);
    while let Some(chunk) = response.chunk().await.map_err(network)? {
        writer.write_all(&chunk)?;
    }
    writer.flush()?;
    let size = writer.count();
    if let Some(expected) = expected {
        let actual = writer.digest();
        if actual != expected {
            return Err(BuildError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(Download {
        file,
        size,
        last_modified,
    })
}

/// Name of the item created for a remote source.
fn remote_name(url: &str, rename_target: &str) -> Result<String> {
    if !rename_target.is_empty() {
        return Ok(rename_target.to_string());
    }
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| BuildError::InvalidArgument(format!("parsing URL {:?}: {}", url, e)))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            BuildError::InvalidArgument(format!("no file name in source URL {:?}", url))
        })
}

/// Write a single-entry archive holding a downloaded file.
fn write_remote_archive(
    writer: File,
    download: &Download,
    name: &str,
    owner: IdPair,
    mode: u32,
    mtime: DateTime<Utc>,
) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(download.size);
    header.set_uid(owner.uid as u64);
    header.set_gid(owner.gid as u64);
    header.set_mode(mode);
    header.set_mtime(mtime.timestamp().max(0) as u64);
    let content = download.file.reopen()?;
    builder
        .append_data(&mut header, name, content)
        .map_err(|e| BuildError::CopierError(format!("writing header for {:?}: {}", name, e)))?;
    builder.into_inner()?;
    Ok(())
}

/// Shallow-clone `#ref[:subdir]`-qualified git location into `dir`.
/// Returns the directory to copy from.
async fn clone_git(source: &str, dir: &Path) -> Result<PathBuf> {
    let (url, fragment) = match source.split_once('#') {
        Some((url, fragment)) => (url, fragment),
        None => (source, ""),
    };
    let (reference, subdir) = match fragment.split_once(':') {
        Some((r, s)) => (r, s),
        None => (fragment, ""),
    };
    let mut command = tokio::process::Command::new("git");
    command.arg("clone").arg("--depth").arg("1");
    if !reference.is_empty() {
        command.arg("--branch").arg(reference);
    }
    command.arg(url).arg(dir);
    tracing::debug!(url, reference, "Cloning git source");
    let output = command
        .output()
        .await
        .map_err(|e| BuildError::Other(format!("running git to clone {:?}: {}", url, e)))?;
    if !output.status.success() {
        return Err(BuildError::Other(format!(
            "cloning {:?}: {}",
            url,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(join_under(dir, Path::new(subdir)))
}

impl Builder {
    /// Copy `sources` into the container at `destination`, extracting local
    /// archives when `extract` is set.
    pub async fn add(
        &mut self,
        store: &Store,
        destination: &str,
        extract: bool,
        mut options: AddOptions<'_>,
        sources: &[String],
    ) -> Result<()> {
        let mount_point = self.rootfs(store)?;

        let (context_dir, current_dir) = match &options.context_dir {
            Some(dir) if dir.is_absolute() => (clean_path(dir), clean_path(dir)),
            Some(dir) => {
                let abs = clean_path(&std::env::current_dir()?.join(dir));
                (abs.clone(), abs)
            }
            None => (PathBuf::from("/"), std::env::current_dir()?),
        };

        let mut sources = sources.to_vec();
        let mut local_sources = Vec::new();
        let mut remote_count = 0;
        let mut git_count = 0;
        for source in sources.iter_mut() {
            if source.is_empty() {
                return Err(BuildError::InvalidArgument("empty source location".to_string()));
            }
            match classify_source(source) {
                SourceKind::Remote => remote_count += 1,
                SourceKind::Git => git_count += 1,
                SourceKind::Local => {
                    if !Path::new(source.as_str()).is_absolute() && options.context_dir.is_none() {
                        *source = current_dir.join(source.as_str()).display().to_string();
                    }
                    local_sources.push(source.clone());
                }
            }
        }
        if !options.checksum.is_empty() {
            if !local_sources.is_empty() {
                return Err(BuildError::InvalidArgument(
                    "checksum flag is not supported for local sources".to_string(),
                ));
            }
            let (algorithm, _) = parse_digest(&options.checksum)?;
            if algorithm != "sha256" {
                return Err(BuildError::InvalidArgument(format!(
                    "unsupported checksum algorithm {:?}",
                    algorithm
                )));
            }
        }

        let local_stats = if local_sources.is_empty() {
            Vec::new()
        } else {
            let stat_options = StatOptions {
                check_for_archives: extract,
                ..Default::default()
            };
            copier::stat(&context_dir, &context_dir, &stat_options, &local_sources)?
        };
        let mut local_item_count = 0;
        for source in &local_sources {
            let stat = local_stats.iter().find(|s| &s.glob == source);
            match stat {
                Some(s) if !s.globbed.is_empty() => local_item_count += s.globbed.len(),
                _ => {
                    return Err(BuildError::NotFound(format!(
                        "checking source {:?} under {}: no glob matches",
                        source,
                        context_dir.display()
                    )))
                }
            }
        }
        if local_item_count + remote_count + git_count == 0 {
            return Err(BuildError::NotFound(format!("no sources {:?} found", sources)));
        }

        // ownership and permissions of the new content
        let owner = if options.chown.is_empty() {
            IdPair::default()
        } else {
            user_for_copy(&mount_point, &options.chown).map_err(|e| match e {
                BuildError::NotFound(msg) => BuildError::NotFound(format!(
                    "looking up UID/GID for {:?}: {}",
                    options.chown, msg
                )),
                other => other,
            })?
        };
        let chown = if options.chown.is_empty() && options.preserve_ownership {
            None
        } else {
            Some(owner)
        };
        let chmod = if options.chmod.is_empty() {
            None
        } else {
            Some(u32::from_str_radix(&options.chmod, 8).map_err(|e| {
                BuildError::InvalidArgument(format!("parsing chmod {:?}: {}", options.chmod, e))
            })?)
        };

        // work out whether the destination names a directory or a file
        let work_dir = self.config.config.working_dir.clone();
        let mut destination = destination.to_string();
        let mut must_be_dir = destination.ends_with('/')
            || destination.ends_with("/.")
            || destination.is_empty()
            || sources.len() > 1;
        if destination.is_empty() || !Path::new(&destination).is_absolute() {
            let joined = clean_path(&Path::new("/").join(&work_dir).join(&destination));
            destination = joined.display().to_string();
            if must_be_dir && destination != "/" {
                destination.push('/');
            }
        }
        must_be_dir = must_be_dir
            || clean_path(Path::new(&destination)) == clean_path(&Path::new("/").join(&work_dir));
        let mut can_be_file = false;
        if sources.len() == 1 {
            if remote_count == 1 {
                can_be_file = true;
            }
            if local_sources.len() == 1 {
                let stat = &local_stats[0];
                if let Some(item) = stat.globbed.first().and_then(|g| stat.results.get(g)) {
                    if item.is_dir || (item.is_archive && extract) {
                        must_be_dir = true;
                    }
                    if item.is_regular {
                        can_be_file = true;
                    }
                }
            }
            if git_count > 0 {
                must_be_dir = true;
            }
        }

        let mut rename_target = String::new();
        let mut extract_directory = join_under(&mount_point, Path::new(&destination));
        let dest_stats = copier::stat(
            &mount_point,
            &join_under(&mount_point, Path::new(&work_dir)),
            &StatOptions {
                check_for_archives: extract,
                ..Default::default()
            },
            &[glob::Pattern::escape(&extract_directory.display().to_string())],
        )?;
        let dest_item = dest_stats
            .first()
            .and_then(|s| s.globbed.first().and_then(|g| s.results.get(g)));
        let split_rename = |path: &Path| -> (String, PathBuf) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf());
            (name, parent)
        };
        let new_dest_dir = dest_item.is_none() && must_be_dir && !can_be_file;
        match dest_item {
            None if !must_be_dir && can_be_file => {
                (rename_target, extract_directory) = split_rename(&extract_directory);
            }
            Some(item) if item.is_regular => {
                if must_be_dir {
                    return Err(BuildError::InvalidArgument(format!(
                        "destination {} already exists but is not a directory",
                        destination
                    )));
                }
                (rename_target, extract_directory) = split_rename(&extract_directory);
            }
            _ => {}
        }

        let matcher = ExcludeMatcher::new(&options.excludes)?;
        let extract_directory = copier::eval(&mount_point, &extract_directory)?;

        let src_mappings = options.id_mappings.clone().unwrap_or_default();
        let dest_mappings = self.id_mappings.clone();
        let mkdir_options = MkdirOptions {
            id_mappings: dest_mappings.clone(),
            chown_new: chown,
            ..Default::default()
        };

        let mut staging_dir = None;
        let mut created_dirs = Vec::new();
        let (put_root, put_dir) = if options.link {
            let clean_dest = clean_path(Path::new(&destination));
            if clean_dest.display().to_string().contains("..") {
                return Err(BuildError::PathEscape {
                    root: "/".to_string(),
                    path: destination.clone(),
                });
            }
            let staging = self.container_directory(store).join(format!(
                "link-stage-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..12]
            ));
            std::fs::create_dir_all(&staging).map_err(|e| {
                BuildError::StorageError(format!(
                    "creating staging directory for link {:?}: {}",
                    self.container_id, e
                ))
            })?;
            let target = join_under(&staging, &clean_dest);
            let put_dir = if rename_target.is_empty() {
                target
            } else {
                target.parent().map(Path::to_path_buf).unwrap_or_else(|| staging.clone())
            };
            rel_subdirectory(&staging, &put_dir)?;
            copier::mkdir(&staging, &put_dir, &mkdir_options)?;
            let mut dir = put_dir.clone();
            while dir != staging {
                if dir.exists() {
                    created_dirs.push(dir.clone());
                }
                if !dir.pop() {
                    break;
                }
            }
            staging_dir = Some(staging.clone());
            (staging, put_dir)
        } else {
            copier::mkdir(&mount_point, &extract_directory, &mkdir_options)?;
            (extract_directory.clone(), extract_directory.clone())
        };

        let ignore_devices = running_in_user_namespace();
        let mut digester = CompositeDigester::new();
        let mut latest_timestamp: Option<DateTime<Utc>> = None;
        let needs_http = sources.iter().any(|s| classify_source(s) == SourceKind::Remote);
        let client = if needs_http {
            Some(http_client(&options)?)
        } else {
            None
        };
        let download_dir = self.container_directory(store);

        for source in &sources {
            let kind = classify_source(source);
            if kind != SourceKind::Local {
                let sink = if options.dry_run {
                    Sink::Discard
                } else {
                    Sink::Put {
                        root: &put_root,
                        directory: &put_dir,
                        options: PutOptions {
                            id_mappings: dest_mappings.clone(),
                            ignore_devices,
                            ..Default::default()
                        },
                    }
                };
                digester.start(ContentType::Raw)?;
                let hash = digester
                    .hash()
                    .ok_or_else(|| BuildError::Internal("no active content digester".to_string()))?;
                if kind == SourceKind::Git {
                    let clone_dir = TempDir::new_in(&download_dir)?;
                    let repository = clone_git(source, clone_dir.path()).await?;
                    let get_options = GetOptions {
                        id_mappings: src_mappings.clone(),
                        excludes: options.excludes.clone(),
                        expand_archives: extract,
                        chown_dirs: chown,
                        chmod_dirs: chmod,
                        chown_files: chown,
                        chmod_files: chmod,
                        strip_setuid_bit: options.strip_setuid_bit,
                        strip_setgid_bit: options.strip_setgid_bit,
                        strip_sticky_bit: options.strip_sticky_bit,
                        timestamp: options.timestamp,
                        ..Default::default()
                    };
                    let produce = |writer: File| -> Result<()> {
                        copier::get(&repository, &repository, &get_options, &[".".to_string()], writer)?;
                        Ok(())
                    };
                    pump(source, produce, sink, hash, options.hasher.as_deref_mut())?;
                } else {
                    let expected = if options.checksum.is_empty() {
                        None
                    } else {
                        Some(options.checksum.as_str())
                    };
                    let client = client
                        .as_ref()
                        .ok_or_else(|| BuildError::Internal("no HTTP client".to_string()))?;
                    let download = retry_if_necessary(source, options.retry, || {
                        fetch_once(client, source, &download_dir, expected)
                    })
                    .await?;
                    let name = remote_name(source, &rename_target)?;
                    let mtime = options
                        .timestamp
                        .or(download.last_modified)
                        .unwrap_or(DateTime::UNIX_EPOCH);
                    let owner = chown.unwrap_or_default();
                    let mode = chmod.unwrap_or(0o600);
                    let produce = |writer: File| -> Result<()> {
                        write_remote_archive(writer, &download, &name, owner, mode, mtime)
                    };
                    pump(source, produce, sink, hash, options.hasher.as_deref_mut())?;
                }
                continue;
            }

            let stat = match local_stats.iter().find(|s| &s.glob == source) {
                Some(s) => s,
                None => continue,
            };
            let items_copied = Arc::new(AtomicUsize::new(0));
            for globbed in &stat.globbed {
                let rel = if Path::new(globbed).is_absolute() {
                    rel_subdirectory(&context_dir, Path::new(globbed)).map_err(|_| {
                        BuildError::PathEscape {
                            root: context_dir.display().to_string(),
                            path: globbed.clone(),
                        }
                    })?
                } else {
                    PathBuf::from(globbed)
                };
                if copier::resolve::escapes(&rel) {
                    return Err(BuildError::PathEscape {
                        root: context_dir.display().to_string(),
                        path: globbed.clone(),
                    });
                }
                let item = stat.results.get(globbed).cloned().unwrap_or_default();
                if rel != Path::new(".") {
                    if matcher.matches(&rel) {
                        // an excluded directory is only walked when
                        // something below it is re-included
                        if !item.is_dir || !matcher.may_reinclude_below(&rel) {
                            continue;
                        }
                    } else if new_dest_dir {
                        items_copied.fetch_add(1, Ordering::SeqCst);
                    }
                } else {
                    items_copied.fetch_add(1, Ordering::SeqCst);
                }
                if options.link && latest_timestamp.map(|t| item.mod_time > t).unwrap_or(true) {
                    latest_timestamp = Some(item.mod_time);
                }

                let renamed_items = Arc::new(AtomicUsize::new(0));
                let mut chain = Chain::new();
                {
                    let counter = Arc::clone(&items_copied);
                    chain.push(move |_: &mut TarItem| -> Result<TarAction> {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(TarAction::Keep)
                    });
                }
                if options.parents {
                    let (prefix, skip) = parents_pivot(source, &context_dir);
                    chain.push(move |item: &mut TarItem| -> Result<TarAction> {
                        if item.is_dir() && skip.iter().any(|s| s == &item.path) {
                            return Ok(TarAction::Skip);
                        }
                        if let Ok(stripped) = item.path.strip_prefix(&prefix) {
                            item.path = stripped.to_path_buf();
                        }
                        if item.header.entry_type().is_hard_link() {
                            if let Some(link) = &item.link_name {
                                if let Ok(stripped) = link.strip_prefix(&prefix) {
                                    item.link_name = Some(stripped.to_path_buf());
                                }
                            }
                        }
                        if item.path.as_os_str().is_empty() {
                            return Ok(TarAction::Skip);
                        }
                        Ok(TarAction::Keep)
                    });
                }
                if !rename_target.is_empty() {
                    let target = PathBuf::from(&rename_target);
                    let renamed = Arc::clone(&renamed_items);
                    chain.push(move |item: &mut TarItem| -> Result<TarAction> {
                        item.path = target.clone();
                        renamed.fetch_add(1, Ordering::SeqCst);
                        Ok(TarAction::Keep)
                    });
                }

                let get_options = GetOptions {
                    id_mappings: src_mappings.clone(),
                    excludes: options.excludes.clone(),
                    expand_archives: extract,
                    chown_dirs: chown,
                    chmod_dirs: chmod,
                    chown_files: chown,
                    chmod_files: chmod,
                    strip_setuid_bit: options.strip_setuid_bit,
                    strip_setgid_bit: options.strip_setgid_bit,
                    strip_sticky_bit: options.strip_sticky_bit,
                    parents: options.parents,
                    timestamp: options.timestamp,
                    ..Default::default()
                };
                let glob = glob::Pattern::escape(globbed);
                let context = &context_dir;
                let produce = move |writer: File| -> Result<()> {
                    let filterer = TarFilterer::new(writer, chain)?;
                    let filterer = copier::get(context, context, &get_options, &[glob], filterer)?;
                    filterer.finish()?;
                    Ok(())
                };
                let sink = if options.dry_run {
                    Sink::Discard
                } else {
                    Sink::Put {
                        root: &put_root,
                        directory: &put_dir,
                        options: PutOptions {
                            id_mappings: dest_mappings.clone(),
                            default_dir_owner: chown,
                            ignore_devices,
                            ..Default::default()
                        },
                    }
                };
                digester.start(if item.is_dir {
                    ContentType::Dir
                } else {
                    ContentType::File
                })?;
                let hash = digester
                    .hash()
                    .ok_or_else(|| BuildError::Internal("no active content digester".to_string()))?;
                let pumped = pump(source, produce, sink, hash, options.hasher.as_deref_mut());
                let renamed = renamed_items.load(Ordering::SeqCst);
                let renamed = if !rename_target.is_empty() && renamed > 1 {
                    Err(BuildError::Internal(format!(
                        "renamed {} items when we expected to only rename 1",
                        renamed
                    )))
                } else {
                    Ok(())
                };
                match (pumped, renamed) {
                    (Ok(()), Ok(())) => {}
                    (Err(e), Ok(())) | (Ok(()), Err(e)) => return Err(e),
                    (Err(a), Err(b)) => return Err(BuildError::from_many(vec![a, b])),
                }
            }
            if items_copied.load(Ordering::SeqCst) == 0 {
                let using = if options.ignore_file.is_empty() {
                    String::new()
                } else {
                    format!(" using {}", options.ignore_file)
                };
                return Err(BuildError::NotFound(format!(
                    "no items matching glob {:?} copied ({} filtered out{})",
                    stat.glob,
                    stat.globbed.len(),
                    using
                )));
            }
        }

        let (content_type, digest) = digester.digest();
        let mut summary = content_type;
        if !digest.is_empty() {
            if !summary.is_empty() {
                summary.push(':');
            }
            summary.push_str(encoded(&digest));
        }
        tracing::debug!(container = %self.container, summary = %summary, destination = %destination, "Added content");
        self.content_summary = Some(summary.clone());

        if let Some(staging) = staging_dir {
            if let Some(latest) = latest_timestamp {
                for dir in &created_dirs {
                    if let Err(e) = set_dir_times(dir, latest) {
                        tracing::warn!(path = %dir.display(), error = %e, "Failed to set timestamp on directory");
                    }
                }
            }
            let created = options
                .timestamp
                .or(latest_timestamp)
                .unwrap_or(DateTime::UNIX_EPOCH);
            let command = if extract { "ADD" } else { "COPY" };
            let created_by = format!(
                "/bin/sh -c #(nop) {} --link {} in {} {}",
                command, summary, destination, options.build_metadata
            );
            let comment = self.image_history_comment.clone();
            self.appended_linked_layers.push(LinkedLayer::new(
                Some(created),
                &created_by,
                "",
                &comment,
                Some(staging),
            ));
            self.save(store).map_err(|e| {
                BuildError::StorageError(format!(
                    "saving builder state after queuing linked layer: {}",
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Create `path` in the container if needed, owned by `user` and with
    /// `mode`. An unknown user falls back to 0:0.
    pub fn ensure_container_path_as(
        &mut self,
        store: &Store,
        path: &str,
        user: &str,
        mode: Option<u32>,
    ) -> Result<()> {
        let mount_point = self.rootfs(store)?;
        let owner = if user.is_empty() {
            IdPair::default()
        } else {
            user_for_copy(&mount_point, user).unwrap_or_default()
        };
        let options = MkdirOptions {
            id_mappings: self.id_mappings.clone(),
            chown_new: Some(owner),
            chmod_new: mode,
            ..Default::default()
        };
        copier::mkdir(&mount_point, &join_under(&mount_point, Path::new(path)), &options)
    }
}

fn set_dir_times(dir: &Path, when: DateTime<Utc>) -> std::io::Result<()> {
    let times = std::fs::FileTimes::new()
        .set_accessed(when.into())
        .set_modified(when.into());
    File::open(dir)?.set_times(times)
}
