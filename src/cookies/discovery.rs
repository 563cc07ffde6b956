use parking_lot::RwLock;
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{io::AsyncReadExt, time::Instant};
use tracing::{debug, info, warn};

/// Cabecera que escribe cualquier exportador de cookies compatible con yt-dlp
const NETSCAPE_HEADER: &str = "Netscape HTTP Cookie File";
const HEADER_SCAN_BYTES: u64 = 2048;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cookies directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("no cookie files in {}", .0.display())]
    NoArtifacts(PathBuf),
    #[error("failed to scan cookies directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A cookie file the extractor can authenticate with.
///
/// `name` (the file basename) is the routing key for health state; `path` is
/// what gets handed to the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct CookieArtifact {
    pub name: String,
    pub path: PathBuf,
}

impl CookieArtifact {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for CookieArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

struct Listing {
    scanned_at: Instant,
    artifacts: Vec<CookieArtifact>,
}

/// Memoized listing of the cookies directory.
///
/// Each worker keeps its own copy and rescans once it is older than
/// `rescan_every`. Brief staleness is fine: a removed file just fails one
/// attempt, an added one shows up on the next rescan.
pub struct ArtifactDirectory {
    dir: PathBuf,
    rescan_every: Duration,
    listing: RwLock<Option<Listing>>,
}

impl ArtifactDirectory {
    pub fn new(dir: impl Into<PathBuf>, rescan_every: Duration) -> Self {
        Self {
            dir: dir.into(),
            rescan_every,
            listing: RwLock::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the current artifacts, rescanning if the memo is cold or stale.
    pub async fn list(&self) -> Result<Vec<CookieArtifact>, DiscoveryError> {
        if let Some(artifacts) = self.fresh_listing() {
            return Ok(artifacts);
        }

        let artifacts = self.scan().await?;
        *self.listing.write() = Some(Listing {
            scanned_at: Instant::now(),
            artifacts: artifacts.clone(),
        });
        Ok(artifacts)
    }

    /// Fuerza un reescaneo en la próxima llamada a `list`
    pub fn invalidate(&self) {
        *self.listing.write() = None;
    }

    fn fresh_listing(&self) -> Option<Vec<CookieArtifact>> {
        let guard = self.listing.read();
        guard
            .as_ref()
            .filter(|listing| listing.scanned_at.elapsed() < self.rescan_every)
            .map(|listing| listing.artifacts.clone())
    }

    async fn scan(&self) -> Result<Vec<CookieArtifact>, DiscoveryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DiscoveryError::MissingDirectory(self.dir.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        let mut valid = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // metadata sigue enlaces simbólicos (volúmenes de secretos)
            if !tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            let artifact = CookieArtifact::new(name, path);
            if looks_like_cookie_file(&artifact.path).await {
                valid.push(artifact.clone());
            }
            files.push(artifact);
        }

        // Compatibilidad: si nada tiene cabecera Netscape, se usan todos
        let mut artifacts = if valid.is_empty() {
            if !files.is_empty() {
                warn!("⚠️ Ningún archivo de cookies tiene cabecera Netscape, usando los {} archivos", files.len());
            }
            files
        } else {
            valid
        };

        if artifacts.is_empty() {
            return Err(DiscoveryError::NoArtifacts(self.dir.clone()));
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        info!("🍪 {} archivos de cookies disponibles en {}", artifacts.len(), self.dir.display());
        Ok(artifacts)
    }
}

/// Busca la cabecera Netscape en los primeros bytes del archivo.
/// Un archivo ilegible simplemente no cuenta como válido.
async fn looks_like_cookie_file(path: &Path) -> bool {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            debug!("No se pudo abrir {}: {}", path.display(), e);
            return false;
        }
    };

    let mut head = Vec::with_capacity(HEADER_SCAN_BYTES as usize);
    if let Err(e) = file.take(HEADER_SCAN_BYTES).read_to_end(&mut head).await {
        debug!("No se pudo leer {}: {}", path.display(), e);
        return false;
    }
    String::from_utf8_lossy(&head).contains(NETSCAPE_HEADER)
}
