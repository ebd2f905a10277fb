//! Records exchanged with the plugin adapter.
//!
//! The adapter normalizes plugin output before it crosses the await
//! protocol, so these parse strictly apart from optional fields.

use serde::{Deserialize, Serialize};

/// A listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginNovel {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub cover: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginNovelDetails {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "one")]
    pub total_chapter_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginChapter {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub release_time: Option<String>,
}

/// One page of a paginated chapter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterPage {
    pub chapters: Vec<PluginChapter>,
    #[serde(default = "one")]
    pub total_pages: u32,
    #[serde(default = "one")]
    pub current_page: u32,
}

impl ChapterPage {
    pub(crate) fn empty(page: u32) -> Self {
        Self {
            chapters: Vec::new(),
            total_pages: 1,
            current_page: page,
        }
    }
}

fn one() -> u32 {
    1
}

/// Plugin identity, read once at load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub site: String,
    pub version: String,
    pub lang: String,
    pub icon: String,
}

impl PluginMetadata {
    /// Metadata used when the plugin reports nothing usable.
    pub fn fallback(plugin_id: &str) -> Self {
        Self {
            id: plugin_id.to_string(),
            name: "Unknown".to_string(),
            site: String::new(),
            version: "1.0.0".to_string(),
            lang: "en".to_string(),
            icon: String::new(),
        }
    }
}

/// What the loaded plugin implements, probed once at load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub has_search: bool,
    pub has_popular: bool,
    pub has_latest: bool,
    pub has_filters: bool,
    /// Declared parameter count of `popularNovels`.
    pub popular_arity: u32,
    pub latest_arity: u32,
    pub has_parse_novel: bool,
    pub has_parse_chapter: bool,
    pub has_parse_page: bool,
}

/// Reply of `__folio.install`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LoadInfo {
    pub metadata: PluginMetadata,
    pub capabilities: Capabilities,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_defaults() {
        let details: PluginNovelDetails = serde_json::from_str(r#"{"name":"N","url":"/n"}"#).unwrap();

        assert_eq!(details.total_chapter_pages, 1);
        assert!(details.genres.is_empty());
        assert_eq!(details.author, None);
    }

    #[test]
    fn test_capabilities_from_script_shape() {
        let caps: Capabilities =
            serde_json::from_str(r#"{"hasSearch":true,"popularArity":2,"hasParsePage":true}"#).unwrap();

        assert!(caps.has_search);
        assert_eq!(caps.popular_arity, 2);
        assert!(!caps.has_latest);
        assert!(caps.has_parse_page);
    }
}
