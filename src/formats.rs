//! Simplified stream listing returned by `/api/info`.

use std::cmp::Reverse;

use serde::Serialize;

use crate::extractor::FormatDescriptor;

pub const UNKNOWN: &str = "Unknown";

/// A number yt-dlp may or may not know; serialized as the number or as `"Unknown"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Measure {
    Known(f64),
    Unknown(&'static str),
}

impl From<Option<f64>> for Measure {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Measure::Unknown(UNKNOWN), Measure::Known)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamView {
    pub format_id: String,
    pub resolution: String,
    pub ext: String,
    pub fps: Measure,
    pub size_mb: Measure,
    pub vcodec: String,
    pub acodec: String,
}

/// Formats carrying both video and audio, highest vertical resolution first.
///
/// A codec only counts as absent when yt-dlp reports the literal `"none"`. The sort is stable,
/// so formats with equal (or unparseable) resolution keep yt-dlp's order.
pub fn stream_views(formats: &[FormatDescriptor]) -> Vec<StreamView> {
    let mut views: Vec<StreamView> = formats
        .iter()
        .filter(|format| format.vcodec.as_deref() != Some("none"))
        .filter(|format| format.acodec.as_deref() != Some("none"))
        .map(|format| StreamView {
            format_id: format.format_id.clone(),
            resolution: text_or_unknown(format.resolution.as_deref()),
            ext: format.ext.clone().unwrap_or_else(|| "mp4".to_string()),
            fps: Measure::from(format.fps),
            size_mb: Measure::from(format.filesize.or(format.filesize_approx).map(bytes_to_mb)),
            vcodec: text_or_unknown(format.vcodec.as_deref()),
            acodec: text_or_unknown(format.acodec.as_deref()),
        })
        .collect();

    views.sort_by_key(|view| Reverse(resolution_height(&view.resolution)));
    views
}

/// `"1280x720"` and `"720p"` give 720; anything else gives 0.
pub fn resolution_height(resolution: &str) -> u32 {
    let resolution = resolution.trim();

    if let Some((_, height)) = resolution.split_once('x') {
        return height.trim().parse().unwrap_or(0);
    }

    resolution
        .strip_suffix('p')
        .and_then(|height| height.trim().parse().ok())
        .unwrap_or(0)
}

/// Resolution label of `format_id` within `formats`, for event logging.
pub fn selected_resolution(formats: &[FormatDescriptor], format_id: &str) -> String {
    formats
        .iter()
        .find(|format| format.format_id == format_id)
        .map(|format| text_or_unknown(format.resolution.as_deref()))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Bytes to MiB, rounded to two decimals.
pub fn bytes_to_mb(bytes: f64) -> f64 {
    (bytes / 1_048_576.0 * 100.0).round() / 100.0
}

fn text_or_unknown(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, resolution: Option<&str>) -> FormatDescriptor {
        FormatDescriptor {
            format_id: id.to_string(),
            resolution: resolution.map(ToString::to_string),
            vcodec: Some("avc1".to_string()),
            acodec: Some("mp4a".to_string()),
            ..FormatDescriptor::default()
        }
    }

    #[test]
    fn parses_resolution_heights() {
        assert_eq!(resolution_height("1280x720"), 720);
        assert_eq!(resolution_height("1080p"), 1080);
        assert_eq!(resolution_height("unknown"), 0);
        assert_eq!(resolution_height("Unknown"), 0);
        assert_eq!(resolution_height("audio only"), 0);
        assert_eq!(resolution_height("widex"), 0);
        assert_eq!(resolution_height(""), 0);
    }

    #[test]
    fn unknown_resolution_sorts_last() {
        let formats = vec![format("a", Some("unknown")), format("b", Some("1280x720"))];

        let ids: Vec<_> = stream_views(&formats)
            .into_iter()
            .map(|view| view.format_id)
            .collect();

        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn sorts_descending_and_keeps_ties_in_order() {
        let formats = vec![
            format("low", Some("640x360")),
            format("first-hd", Some("1920x1080")),
            format("missing", None),
            format("second-hd", Some("1080p")),
        ];

        let ids: Vec<_> = stream_views(&formats)
            .into_iter()
            .map(|view| view.format_id)
            .collect();

        assert_eq!(ids, vec!["first-hd", "second-hd", "low", "missing"]);
    }

    #[test]
    fn skips_video_only_and_audio_only_formats() {
        let mut video_only = format("v", Some("1920x1080"));
        video_only.acodec = Some("none".to_string());
        let mut audio_only = format("a", Some("audio only"));
        audio_only.vcodec = Some("none".to_string());
        let undeclared = FormatDescriptor {
            format_id: "u".to_string(),
            ..FormatDescriptor::default()
        };

        let views = stream_views(&[video_only, audio_only, undeclared]);

        assert_eq!(views.len(), 1);
        assert_eq!(views[0].format_id, "u");
        assert_eq!(views[0].resolution, UNKNOWN);
        assert_eq!(views[0].ext, "mp4");
        assert_eq!(views[0].vcodec, UNKNOWN);
    }

    #[test]
    fn size_prefers_exact_then_approximate() {
        let mut exact = format("exact", None);
        exact.filesize = Some(5_242_880.0);
        exact.filesize_approx = Some(1.0);
        let mut approx = format("approx", None);
        approx.filesize_approx = Some(1_572_864.0);
        let unknown = format("unknown", None);

        let views = stream_views(&[exact, approx, unknown]);

        assert_eq!(views[0].size_mb, Measure::Known(5.0));
        assert_eq!(views[1].size_mb, Measure::Known(1.5));
        assert_eq!(views[2].size_mb, Measure::Unknown(UNKNOWN));
    }

    #[test]
    fn measures_serialize_as_number_or_unknown() {
        assert_eq!(serde_json::to_value(Measure::Known(29.97)).unwrap(), 29.97);
        assert_eq!(
            serde_json::to_value(Measure::Unknown(UNKNOWN)).unwrap(),
            "Unknown"
        );
    }

    #[test]
    fn selected_resolution_falls_back_to_unknown() {
        let formats = vec![format("22", Some("1280x720"))];
        assert_eq!(selected_resolution(&formats, "22"), "1280x720");
        assert_eq!(selected_resolution(&formats, "bestaudio/best"), UNKNOWN);
    }

    #[test]
    fn rounds_megabytes_to_two_decimals() {
        assert_eq!(bytes_to_mb(1_234_567.0), 1.18);
        assert_eq!(bytes_to_mb(0.0), 0.0);
    }
}
