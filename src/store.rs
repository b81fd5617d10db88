//! Artifact store: one directory per retrieval token under a single storage root.
//!
//! Every download gets its own namespace (`<root>/<token>/`) created with create-if-absent
//! semantics, so concurrent requests never share a location and no application lock is needed.
//! The filesystem is the only coordination point between request handlers and the sweep:
//! `create_dir` for allocation, `rename` for replacement and `remove_dir` for empty namespaces.

use std::{
    fmt,
    fs::Metadata,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    formats::bytes_to_mb,
};

const MAX_TOKEN_LEN: usize = 64;
const ALLOCATION_ATTEMPTS: usize = 3;
const STAGING_PREFIX: &str = ".staging-";
const TRANSIENT_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

/// Opaque retrieval token. Only ever constructed from the CSPRNG or through [`Token::parse`],
/// so it is always a single, separator-free path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(value: &str) -> Option<Self> {
        let valid = !value.is_empty()
            && value.len() <= MAX_TOKEN_LEN
            && value
                .chars()
                .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'));

        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A freshly created, still empty namespace.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub token: Token,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub token: Token,
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn size_mb(&self) -> f64 {
        bytes_to_mb(self.size_bytes as f64)
    }
}

#[derive(Debug, Clone)]
pub struct SweepFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed_files: Vec<PathBuf>,
    pub removed_namespaces: Vec<PathBuf>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, path: &Path, error: impl fmt::Display) {
        warn!("No se pudo limpiar {:?}: {error}", path);
        self.failures.push(SweepFailure {
            path: path.to_path_buf(),
            message: error.to_string(),
        });
    }
}

#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Creates the storage root if needed and pins its canonical location.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|error| Error::storage("No se pudo crear la carpeta de descargas", error))?;
        let root = tokio::fs::canonicalize(&root)
            .await
            .map_err(|error| Error::storage("No se pudo resolver la carpeta de descargas", error))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn allocate(&self) -> Result<Allocation> {
        for _ in 0..ALLOCATION_ATTEMPTS {
            let token = Token::generate();
            let dir = self.root.join(token.as_str());

            match tokio::fs::create_dir(&dir).await {
                Ok(()) => {
                    debug!("Namespace {token} reservado");
                    return Ok(Allocation { token, dir });
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    warn!("Colision de token {token}; se generara otro");
                }
                Err(error) => {
                    return Err(Error::storage(
                        "No se pudo preparar la carpeta de descarga",
                        error,
                    ));
                }
            }
        }

        Err(Error::Storage(
            "No se pudo reservar un identificador de descarga unico.".to_string(),
        ))
    }

    /// Checks that the caller left exactly one retrievable file in the namespace.
    pub async fn finalize(&self, token: &Token) -> Result<Artifact> {
        let namespace = self.namespace(token);
        let mut files = match retrievable_files(&namespace).await {
            Ok(files) => files,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(error) => {
                return Err(Error::storage(
                    "No se pudo leer la carpeta de descarga",
                    error,
                ));
            }
        };

        match files.len() {
            0 => Err(Error::ArtifactMissing),
            1 => {
                let (path, metadata) = files.remove(0);
                Ok(describe(token, path, &metadata))
            }
            count => Err(Error::UnexpectedArtifacts(count)),
        }
    }

    /// Maps a client-supplied token to the file to stream back.
    ///
    /// The token is validated before any filesystem access, and both the namespace and the
    /// chosen file are canonicalized and checked against the storage root.
    pub async fn resolve(&self, raw_token: &str) -> Result<Artifact> {
        let token = Token::parse(raw_token).ok_or_else(|| {
            warn!("Se rechazo un token de descarga invalido: {:?}", raw_token);
            Error::NotFound
        })?;

        let namespace = match tokio::fs::canonicalize(self.namespace(&token)).await {
            Ok(path) => path,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(error) => {
                return Err(Error::storage(
                    "No se pudo resolver la carpeta de descarga",
                    error,
                ));
            }
        };
        if !namespace.starts_with(&self.root) || namespace == self.root {
            warn!("Se bloqueo una carpeta fuera de la raiz de descargas: {:?}", namespace);
            return Err(Error::NotFound);
        }

        let files = match retrievable_files(&namespace).await {
            Ok(files) => files,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(error) => {
                return Err(Error::storage(
                    "No se pudo leer la carpeta de descarga",
                    error,
                ));
            }
        };

        let (path, metadata) = newest(files).ok_or(Error::NotFound)?;
        let canonical = match tokio::fs::canonicalize(&path).await {
            Ok(path) => path,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(error) => {
                return Err(Error::storage(
                    "No se pudo resolver el archivo descargado",
                    error,
                ));
            }
        };
        if !canonical.starts_with(&namespace) {
            warn!("Se bloqueo un archivo fuera de su carpeta: {:?}", canonical);
            return Err(Error::NotFound);
        }

        Ok(describe(&token, canonical, &metadata))
    }

    /// Swaps the artifact behind `token` for `source`, published as `file_name`.
    ///
    /// The new file is renamed into place before the previous one is deleted, so the token
    /// resolves to some file at every instant.
    pub async fn replace(&self, token: &Token, source: &Path, file_name: &str) -> Result<Artifact> {
        let (artifact, previous) = self.install_replacement(token, source, file_name).await?;
        if let Some(previous) = previous {
            self.retire(&previous).await;
        }
        Ok(artifact)
    }

    /// First half of [`ArtifactStore::replace`]: puts the new file in place and returns the
    /// path of the file it supersedes, which is still on disk.
    pub(crate) async fn install_replacement(
        &self,
        token: &Token,
        source: &Path,
        file_name: &str,
    ) -> Result<(Artifact, Option<PathBuf>)> {
        if !is_plain_file_name(file_name) {
            return Err(Error::Storage(format!(
                "Nombre de archivo invalido para reemplazo: {file_name:?}"
            )));
        }

        let namespace = self.namespace(token);
        let current = match retrievable_files(&namespace).await {
            Ok(files) => newest(files),
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(error) => {
                return Err(Error::storage(
                    "No se pudo leer la carpeta de descarga",
                    error,
                ));
            }
        };
        let (previous_path, _) = current.ok_or(Error::ArtifactMissing)?;

        let staging = self.stage(&namespace, source, file_name).await?;
        sync_file(&staging).await?;

        let target = namespace.join(file_name);
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|error| Error::storage("No se pudo publicar el archivo convertido", error))?;

        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|error| Error::storage("No se pudo leer el archivo convertido", error))?;
        let artifact = describe(token, target.clone(), &metadata);

        let previous = (previous_path != target).then_some(previous_path);
        Ok((artifact, previous))
    }

    /// Second half of [`ArtifactStore::replace`]. A failure here only leaves an extra file that
    /// the sweep will reap.
    pub(crate) async fn retire(&self, previous: &Path) {
        if let Err(error) = tokio::fs::remove_file(previous).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("No se pudo eliminar el archivo reemplazado {:?}: {error}", previous);
        }
    }

    /// Drops a whole namespace after a failed operation. Never fails.
    pub async fn discard(&self, token: &Token) {
        let namespace = self.namespace(token);
        match tokio::fs::remove_dir_all(&namespace).await {
            Ok(()) => debug!("Namespace {token} descartado"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo limpiar carpeta temporal {:?}: {error}", namespace),
        }
    }

    pub async fn sweep(&self, max_age: Duration) -> SweepReport {
        self.sweep_at(SystemTime::now(), max_age).await
    }

    /// Removes every file at least `max_age` old as of `now`, then every namespace that is
    /// empty and either emptied by this pass or itself at least `max_age` old.
    pub async fn sweep_at(&self, now: SystemTime, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                report.fail(&self.root, error);
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    report.fail(&self.root, error);
                    break;
                }
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    report.fail(&path, error);
                    continue;
                }
            };

            if metadata.is_dir() {
                sweep_namespace(&path, &metadata, now, max_age, &mut report).await;
                continue;
            }

            match age_of(&metadata, now) {
                Ok(age) if age >= max_age => match tokio::fs::remove_file(&path).await {
                    Ok(()) => report.removed_files.push(path),
                    Err(error) if error.kind() == ErrorKind::NotFound => {}
                    Err(error) => report.fail(&path, error),
                },
                Ok(_) => {}
                Err(error) => report.fail(&path, error),
            }
        }

        if !report.removed_files.is_empty() || !report.removed_namespaces.is_empty() {
            info!(
                "Limpieza: {} archivo(s) y {} carpeta(s) eliminadas, {} error(es)",
                report.removed_files.len(),
                report.removed_namespaces.len(),
                report.failures.len()
            );
        }

        report
    }

    /// Location inside the namespace where a replacement can be written without becoming
    /// retrievable before [`ArtifactStore::replace`] publishes it.
    pub fn staging_path(&self, token: &Token, file_name: &str) -> PathBuf {
        self.namespace(token).join(format!("{STAGING_PREFIX}{file_name}"))
    }

    fn namespace(&self, token: &Token) -> PathBuf {
        self.root.join(token.as_str())
    }

    async fn stage(&self, namespace: &Path, source: &Path, file_name: &str) -> Result<PathBuf> {
        let canonical_namespace = tokio::fs::canonicalize(namespace)
            .await
            .map_err(|error| Error::storage("No se pudo resolver la carpeta de descarga", error))?;
        let source_parent = match source.parent() {
            Some(parent) => tokio::fs::canonicalize(parent).await.ok(),
            None => None,
        };

        if source_parent.as_deref() == Some(canonical_namespace.as_path()) {
            return Ok(source.to_path_buf());
        }

        let staging = namespace.join(format!("{STAGING_PREFIX}{file_name}"));
        tokio::fs::copy(source, &staging)
            .await
            .map_err(|error| Error::storage("No se pudo copiar el archivo convertido", error))?;
        if let Err(error) = tokio::fs::remove_file(source).await {
            debug!("No se pudo eliminar el origen {:?}: {error}", source);
        }

        Ok(staging)
    }
}

async fn sweep_namespace(
    namespace: &Path,
    namespace_metadata: &Metadata,
    now: SystemTime,
    max_age: Duration,
    report: &mut SweepReport,
) {
    let mut entries = match tokio::fs::read_dir(namespace).await {
        Ok(entries) => entries,
        // Discarded concurrently.
        Err(error) if error.kind() == ErrorKind::NotFound => return,
        Err(error) => {
            report.fail(namespace, error);
            return;
        }
    };

    let mut remaining = 0usize;
    let mut removed_any = false;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                report.fail(namespace, error);
                return;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                remaining += 1;
                report.fail(&path, error);
                continue;
            }
        };

        let age = match age_of(&metadata, now) {
            Ok(age) => age,
            Err(error) => {
                remaining += 1;
                report.fail(&path, error);
                continue;
            }
        };

        if age < max_age {
            remaining += 1;
            continue;
        }

        let removal = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match removal {
            Ok(()) => {
                removed_any = true;
                report.removed_files.push(path);
            }
            Err(error) if error.kind() == ErrorKind::NotFound => removed_any = true,
            Err(error) => {
                remaining += 1;
                report.fail(&path, error);
            }
        }
    }

    if remaining > 0 {
        return;
    }

    let expired = removed_any
        || age_of(namespace_metadata, now).is_ok_and(|age| age >= max_age);
    if !expired {
        return;
    }

    match tokio::fs::remove_dir(namespace).await {
        Ok(()) => report.removed_namespaces.push(namespace.to_path_buf()),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) if error.kind() == ErrorKind::DirectoryNotEmpty => {
            debug!("{:?} recibio archivos durante la limpieza; se conserva", namespace);
        }
        Err(error) => report.fail(namespace, error),
    }
}

fn age_of(metadata: &Metadata, now: SystemTime) -> std::io::Result<Duration> {
    let modified_at = metadata.modified()?;
    Ok(now.duration_since(modified_at).unwrap_or_default())
}

fn describe(token: &Token, path: PathBuf, metadata: &Metadata) -> Artifact {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());
    Artifact {
        token: token.clone(),
        path,
        file_name,
        size_bytes: metadata.len(),
    }
}

/// Regular files a client may download: no staging files, no yt-dlp leftovers, no symlinks.
async fn retrievable_files(dir: &Path) -> std::io::Result<Vec<(PathBuf, Metadata)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_retrievable_name(name) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => return Err(error),
        };
        if metadata.is_file() {
            files.push((entry.path(), metadata));
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn newest(files: Vec<(PathBuf, Metadata)>) -> Option<(PathBuf, Metadata)> {
    files.into_iter().max_by(|a, b| {
        let a_time = a.1.modified().ok();
        let b_time = b.1.modified().ok();
        a_time.cmp(&b_time).then_with(|| a.0.cmp(&b.0))
    })
}

fn is_retrievable_name(name: &str) -> bool {
    !name.starts_with(STAGING_PREFIX)
        && !TRANSIENT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_plain_file_name(name: &str) -> bool {
    is_retrievable_name(name)
        && !name.is_empty()
        && !name.contains(['/', '\\', '\0'])
        && Path::new(name).file_name().is_some_and(|file| file == name)
}

async fn sync_file(path: &Path) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|error| Error::storage("No se pudo abrir el archivo convertido", error))?;
    file.sync_all()
        .await
        .map_err(|error| Error::storage("No se pudo sincronizar el archivo convertido", error))
}
