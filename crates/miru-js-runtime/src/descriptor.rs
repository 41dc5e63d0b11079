//! Extension descriptors.
//!
//! An extension is a single UTF-8 script named `<package-id>.js` whose
//! header carries `@key value` metadata lines:
//!
//! ```javascript
//! // ==MiruExtension==
//! // @name         Demo
//! // @version      v0.0.1
//! // @package      demo.pkg
//! // @type         bangumi
//! // @api          2
//! // @webSite      https://example.com
//! // ==/MiruExtension==
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;

fn metadata_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@(\w+)\s+(.*)").expect("metadata regex"))
}

/// Script API generation an extension is written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ApiVersion {
    /// Class based: `class X extends Extension { ... }`, called via `ext.*`.
    #[default]
    #[serde(rename = "1")]
    V1,
    /// Bare top-level functions: `async function latest(page) { ... }`.
    #[serde(rename = "2")]
    V2,
}

impl ApiVersion {
    fn parse(value: &str) -> Result<Self, MetadataError> {
        match value.trim() {
            "" | "1" => Ok(Self::V1),
            "2" => Ok(Self::V2),
            other => Err(MetadataError::UnsupportedApi(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an extension serves; selects the shape of `watch` results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Manga,
    Bangumi,
    #[serde(alias = "fiction")]
    Fikushon,
    #[default]
    #[serde(other)]
    Other,
}

impl ContentKind {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "manga" => Self::Manga,
            "bangumi" => Self::Bangumi,
            "fikushon" | "fiction" => Self::Fikushon,
            _ => Self::Other,
        }
    }
}

/// Parsed metadata plus raw source for one extension file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    #[serde(rename = "package")]
    pub package_id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub license: String,
    pub lang: String,
    pub icon: String,
    #[serde(rename = "webSite")]
    pub website: String,
    pub description: String,
    pub tags: Vec<String>,
    pub nsfw: bool,
    pub api: ApiVersion,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    /// File the descriptor was read from, e.g. `demo.pkg.js`.
    #[serde(skip)]
    pub file_name: String,
    #[serde(skip)]
    pub source: Arc<str>,
}

impl ExtensionDescriptor {
    /// Parse the metadata header of `source` read from `file_name`.
    ///
    /// Unknown tags are ignored. A declared package that does not match
    /// the file name is rejected.
    pub fn parse(source: &str, file_name: &str) -> Result<Self, MetadataError> {
        let mut descriptor = Self {
            package_id: String::new(),
            name: String::new(),
            version: String::new(),
            author: String::new(),
            license: String::new(),
            lang: String::new(),
            icon: String::new(),
            website: String::new(),
            description: String::new(),
            tags: Vec::new(),
            nsfw: false,
            api: ApiVersion::V1,
            kind: ContentKind::Other,
            file_name: file_name.to_string(),
            source: Arc::from(source),
        };
        let mut api = String::new();

        for caps in metadata_regex().captures_iter(source) {
            let value = caps[2].trim().to_string();
            match &caps[1] {
                "name" => descriptor.name = value,
                "version" => descriptor.version = value,
                "author" => descriptor.author = value,
                "license" => descriptor.license = value,
                "lang" => descriptor.lang = value,
                "icon" => descriptor.icon = value,
                "package" => descriptor.package_id = value,
                "webSite" | "website" => descriptor.website = value,
                "description" => descriptor.description = value,
                "api" => api = value,
                "type" => descriptor.kind = ContentKind::parse(&value),
                "nsfw" => descriptor.nsfw = value.eq_ignore_ascii_case("true"),
                "tags" => {
                    descriptor.tags = value
                        .split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                }
                _ => {}
            }
        }

        if descriptor.package_id.is_empty() {
            return Err(MetadataError::MissingTag("package"));
        }
        if format!("{}.js", descriptor.package_id) != file_name {
            return Err(MetadataError::FilenameMismatch {
                file_name: file_name.to_string(),
                package: descriptor.package_id,
            });
        }
        descriptor.api = ApiVersion::parse(&api)?;
        if descriptor.name.is_empty() {
            descriptor.name = descriptor.package_id.clone();
        }

        Ok(descriptor)
    }

    /// Stand-in for a file whose metadata was rejected; carries only the
    /// identity it is registered under.
    pub fn placeholder(package_id: &str, file_name: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            name: package_id.to_string(),
            version: String::new(),
            author: String::new(),
            license: String::new(),
            lang: String::new(),
            icon: String::new(),
            website: String::new(),
            description: String::new(),
            tags: Vec::new(),
            nsfw: false,
            api: ApiVersion::V1,
            kind: ContentKind::Other,
            file_name: file_name.to_string(),
            source: Arc::from(""),
        }
    }

    /// The package id a file declares, even when the rest of its metadata is
    /// unusable.
    pub fn declared_package(source: &str) -> Option<String> {
        metadata_regex()
            .captures_iter(source)
            .find(|caps| &caps[1] == "package")
            .map(|caps| caps[2].trim().to_string())
            .filter(|p| !p.is_empty())
    }
}

/// Whether a path looks like an extension script (`*.js`, not hidden).
pub fn is_extension_file(path: &Path) -> bool {
    match file_name_of(path) {
        Some(name) => name.ends_with(".js") && name.len() > 3 && !name.starts_with('.'),
        None => false,
    }
}

pub(crate) fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// `demo.pkg.js` -> `demo.pkg`
pub(crate) fn file_stem_of(file_name: &str) -> &str {
    file_name.strip_suffix(".js").unwrap_or(file_name)
}

/// A listed extension: descriptor without source, plus health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionInfo {
    #[serde(flatten)]
    pub descriptor: ExtensionDescriptor,
    /// Empty when healthy.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(rename = "loadedAt")]
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

impl ExtensionInfo {
    pub fn is_healthy(&self) -> bool {
        self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = r#"// ==MiruExtension==
// @name         Demo Source
// @version      v0.0.2
// @author       someone
// @lang         en
// @license      MIT
// @icon         https://example.com/icon.png
// @package      demo.pkg
// @type         bangumi
// @webSite      https://example.com
// @description  A demo
// @tags         anime, english ,
// @api          2
// ==/MiruExtension==
async function latest(page) { return []; }
"#;

    #[test]
    fn parses_all_known_tags() {
        let d = ExtensionDescriptor::parse(HEADER, "demo.pkg.js").unwrap();
        assert_eq!(d.package_id, "demo.pkg");
        assert_eq!(d.name, "Demo Source");
        assert_eq!(d.version, "v0.0.2");
        assert_eq!(d.author, "someone");
        assert_eq!(d.website, "https://example.com");
        assert_eq!(d.api, ApiVersion::V2);
        assert_eq!(d.kind, ContentKind::Bangumi);
        assert_eq!(d.tags, vec!["anime", "english"]);
        assert!(d.source.contains("async function latest"));
    }

    #[test]
    fn rejects_filename_mismatch() {
        let err = ExtensionDescriptor::parse(HEADER, "wrong.js").unwrap_err();
        assert_eq!(
            err,
            MetadataError::FilenameMismatch {
                file_name: "wrong.js".to_string(),
                package: "demo.pkg".to_string(),
            }
        );
        assert!(err.to_string().contains("does not match the file name"));
    }

    #[test]
    fn missing_package_is_rejected() {
        let err = ExtensionDescriptor::parse("// @name x\n", "x.js").unwrap_err();
        assert_eq!(err, MetadataError::MissingTag("package"));
    }

    #[test]
    fn api_defaults_to_v1_and_rejects_unknown() {
        let d = ExtensionDescriptor::parse("// @package a.b\n", "a.b.js").unwrap();
        assert_eq!(d.api, ApiVersion::V1);
        assert_eq!(d.name, "a.b");
        assert_eq!(d.kind, ContentKind::Other);

        let err = ExtensionDescriptor::parse("// @package a.b\n// @api 3\n", "a.b.js").unwrap_err();
        assert_eq!(err, MetadataError::UnsupportedApi("3".to_string()));
    }

    #[test]
    fn fiction_is_an_alias() {
        let d = ExtensionDescriptor::parse("// @package a.b\n// @type fiction\n", "a.b.js").unwrap();
        assert_eq!(d.kind, ContentKind::Fikushon);
    }

    #[test]
    fn declared_package_survives_mismatch() {
        assert_eq!(ExtensionDescriptor::declared_package(HEADER).as_deref(), Some("demo.pkg"));
        assert_eq!(ExtensionDescriptor::declared_package("// nothing"), None);
    }

    #[test]
    fn info_serializes_original_field_names() {
        let d = ExtensionDescriptor::parse(HEADER, "demo.pkg.js").unwrap();
        let json = serde_json::to_value(ExtensionInfo {
            descriptor: d,
            error: String::new(),
            loaded_at: chrono::Utc::now(),
        })
        .unwrap();
        assert_eq!(json["package"], "demo.pkg");
        assert_eq!(json["webSite"], "https://example.com");
        assert_eq!(json["type"], "bangumi");
        assert_eq!(json["api"], "2");
        assert!(json.get("error").is_none());
        assert!(json.get("source").is_none());
    }

    #[test]
    fn extension_file_filter() {
        assert!(is_extension_file(Path::new("/x/demo.pkg.js")));
        assert!(is_extension_file(Path::new("wrong.js")));
        assert!(!is_extension_file(Path::new("/x/readme.md")));
        assert!(!is_extension_file(Path::new("/x/.hidden.js")));
        assert_eq!(file_stem_of("demo.pkg.js"), "demo.pkg");
    }
}
