//! yt-dlp wrapper: metadata queries and downloads into an artifact namespace.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatDescriptor>,
    pub entries: Option<Vec<Option<MediaInfo>>>,
}

impl MediaInfo {
    /// Playlist results collapse to their first available entry.
    pub fn into_single(self) -> MediaInfo {
        match self.entries {
            Some(entries) => entries.into_iter().flatten().next().unwrap_or_default(),
            None => self,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatDescriptor {
    #[serde(default)]
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub fps: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn query(&self, url: &str) -> Result<MediaInfo>;

    /// Downloads `url` with the given yt-dlp format selector into `target_dir`.
    async fn download(&self, url: &str, selector: &str, target_dir: &Path) -> Result<MediaInfo>;
}

pub struct YtDlp {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn query_args(url: &str) -> Vec<String> {
        vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ]
    }

    fn download_args(url: &str, selector: &str, target_dir: &Path) -> Vec<String> {
        let output_template = format!("{}/%(title).150B.%(ext)s", target_dir.to_string_lossy());

        vec![
            "-J".to_string(),
            "--no-simulate".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            // Retention is measured from mtime; it must be the local write time.
            "--no-mtime".to_string(),
            "-f".to_string(),
            selector.to_string(),
            "-o".to_string(),
            output_template,
            url.to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<Output> {
        debug!("yt-dlp {:?}", args);
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                Error::ExtractionFailed(
                    "La operacion con yt-dlp excedio el tiempo limite. Intenta con otra URL o formato."
                        .to_string(),
                )
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    Error::ExtractionFailed(
                        "yt-dlp no esta instalado en el sistema. Instala yt-dlp y reinicia el backend."
                            .to_string(),
                    )
                } else {
                    Error::ExtractionFailed(format!("No se pudo ejecutar yt-dlp: {error}"))
                }
            })?;

        if !output.status.success() {
            return Err(Error::ExtractionFailed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn query(&self, url: &str) -> Result<MediaInfo> {
        let output = self.run(Self::query_args(url)).await?;
        parse_info(&output.stdout)
    }

    async fn download(&self, url: &str, selector: &str, target_dir: &Path) -> Result<MediaInfo> {
        let output = self
            .run(Self::download_args(url, selector, target_dir))
            .await?;
        parse_info(&output.stdout)
    }
}

fn parse_info(stdout: &[u8]) -> Result<MediaInfo> {
    let text = String::from_utf8_lossy(stdout);
    let json = text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .next_back()
        .ok_or_else(|| Error::ExtractionFailed("yt-dlp no devolvio metadatos.".to_string()))?;

    let info: MediaInfo = serde_json::from_str(json).map_err(|error| {
        Error::ExtractionFailed(format!("No se pudo interpretar JSON de yt-dlp: {error}"))
    })?;

    Ok(info.into_single())
}

/// Last non-empty stderr line, which is where yt-dlp puts its `ERROR:` summary.
fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp no pudo completar la operacion")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_video_metadata() {
        let stdout = br#"{"id":"abc123","title":"Demo","uploader":"Someone","duration":61.5,
            "thumbnail":"https://i.example/abc.jpg",
            "formats":[{"format_id":"18","ext":"mp4","resolution":"640x360","vcodec":"avc1","acodec":"mp4a","fps":30,"filesize":1048576}]}"#;
        let flattened = String::from_utf8_lossy(stdout).replace('\n', "");

        let info = parse_info(flattened.as_bytes()).unwrap();

        assert_eq!(info.id.as_deref(), Some("abc123"));
        assert_eq!(info.uploader.as_deref(), Some("Someone"));
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].fps, Some(30.0));
        assert_eq!(info.formats[0].filesize, Some(1_048_576.0));
    }

    #[test]
    fn playlist_results_use_first_entry() {
        let stdout = br#"{"id":"PL1","title":"List","entries":[null,{"id":"first","title":"First"},{"id":"second"}]}"#;

        let info = parse_info(stdout).unwrap();

        assert_eq!(info.id.as_deref(), Some("first"));
        assert_eq!(info.title.as_deref(), Some("First"));
    }

    #[test]
    fn ignores_progress_noise_before_json() {
        let stdout = b"[download] 100% of 1.00MiB\n{\"id\":\"x\",\"formats\":[]}\n";
        let info = parse_info(stdout).unwrap();
        assert_eq!(info.id.as_deref(), Some("x"));
    }

    #[test]
    fn missing_json_is_an_extraction_failure() {
        let error = parse_info(b"").unwrap_err();
        assert!(matches!(error, Error::ExtractionFailed(_)));
    }

    #[test]
    fn error_message_is_last_stderr_line_verbatim() {
        let stderr = b"WARNING: something\nERROR: [youtube] zzz: Video unavailable\n\n";
        assert_eq!(
            run_error_message(stderr),
            "ERROR: [youtube] zzz: Video unavailable"
        );
    }

    #[test]
    fn download_args_target_the_namespace() {
        let args = YtDlp::download_args(
            "https://youtu.be/abc",
            "bestaudio/best",
            Path::new("/srv/downloads/tok"),
        );

        let selector_at = args.iter().position(|arg| arg == "-f").unwrap();
        assert_eq!(args[selector_at + 1], "bestaudio/best");
        assert!(args.contains(&"/srv/downloads/tok/%(title).150B.%(ext)s".to_string()));
        assert!(args.contains(&"--no-simulate".to_string()));
        assert!(args.contains(&"--no-mtime".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }

    #[test]
    fn query_args_do_not_download() {
        let args = YtDlp::query_args("https://youtu.be/abc");
        assert!(args.contains(&"-J".to_string()));
        assert!(!args.contains(&"--no-simulate".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_extraction_failure() {
        let extractor = YtDlp::new("/nonexistent/yt-dlp-binary", Duration::from_secs(5));
        let error = extractor.query("https://youtu.be/abc").await.unwrap_err();
        assert!(matches!(error, Error::ExtractionFailed(message) if message.contains("yt-dlp")));
    }
}
