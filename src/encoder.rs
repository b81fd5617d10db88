//! ffmpeg wrapper producing audio-only MP3 files.

use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use crate::error::{Error, Result};

pub const SAMPLE_RATE_HZ: u32 = 44_100;
pub const CHANNELS: u32 = 2;
pub const BITRATE: &str = "192k";

#[async_trait]
pub trait AudioEncoder: Send + Sync {
    /// Whether the encoder can run on this host.
    fn available(&self) -> bool;

    async fn transcode_to_audio(&self, input: &Path, output: &Path) -> Result<()>;
}

pub struct Ffmpeg {
    binary: PathBuf,
    timeout: Duration,
    available: bool,
}

impl Ffmpeg {
    /// Looks the binary up once; the result is reported by [`AudioEncoder::available`].
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        let binary = binary.into();
        let available = which::which(&binary).is_ok();

        Self {
            binary,
            timeout,
            available,
        }
    }

    fn transcode_args(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_owned());
        args.extend(
            [
                "-map".to_string(),
                "0:a:0".to_string(),
                "-vn".to_string(),
                "-ar".to_string(),
                SAMPLE_RATE_HZ.to_string(),
                "-ac".to_string(),
                CHANNELS.to_string(),
                "-b:a".to_string(),
                BITRATE.to_string(),
                "-f".to_string(),
                "mp3".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl AudioEncoder for Ffmpeg {
    fn available(&self) -> bool {
        self.available
    }

    async fn transcode_to_audio(&self, input: &Path, output: &Path) -> Result<()> {
        debug!("ffmpeg {:?} -> {:?}", input, output);
        let command_future = Command::new(&self.binary)
            .args(Self::transcode_args(input, output))
            .kill_on_drop(true)
            .output();

        let result = timeout(self.timeout, command_future).await.map_err(|_| {
            Error::EncodingFailed(format!(
                "FFmpeg excedio el tiempo limite ({:?}).",
                self.timeout
            ))
        })?;

        let output = match result {
            Ok(output) => output,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(Error::EncoderUnavailable);
            }
            Err(error) => {
                return Err(Error::EncodingFailed(format!(
                    "No se pudo ejecutar FFmpeg: {error}"
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::EncodingFailed(stderr));
        }

        Ok(())
    }
}
