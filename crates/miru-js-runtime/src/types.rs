//! Typed results returned by extension calls.
//!
//! Values leave the script as JSON and are decoded into these structures,
//! so the field names follow what extensions actually return.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Listing and detail
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of a `latest` or `search` listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub update: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeGroup {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub urls: Vec<Episode>,
}

/// Result of `detail(url)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub episodes: Vec<EpisodeGroup>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// A filter definition returned by `createFilter`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
    #[serde(rename = "default", default)]
    pub default_option: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtitle {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// Video watch result. `kind` is `hls`, `mp4`, `magnet`, `torrent`, ...
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BangumiWatch {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub subtitles: Vec<Subtitle>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(rename = "audioTrack", default)]
    pub audio_track: String,
    /// Handle returned by the torrent client for magnet/torrent results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent: Option<serde_json::Value>,
}

impl BangumiWatch {
    pub fn is_torrent_like(&self) -> bool {
        matches!(self.kind.as_str(), "magnet" | "torrent")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MangaWatch {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FikushonWatch {
    #[serde(default)]
    pub content: Vec<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
}

/// Watch result, shaped by the package's declared content kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum WatchResult {
    Manga(MangaWatch),
    Bangumi(BangumiWatch),
    Fikushon(FikushonWatch),
    Other(serde_json::Value),
}
