//! Flattened, read-only channel directory.
//!
//! Groups are flattened into one ordered list; a channel's position in that
//! list is its index everywhere else (last-channel persistence, client
//! commands, navigation).  Wraparound is left to callers.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::protocol::Channel;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to read channel file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid channel file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ChannelDirectory {
    channels: Vec<Channel>,
    index: HashMap<String, usize>,
}

impl ChannelDirectory {
    /// Build a directory from channels in display order.  Channels without
    /// URLs are dropped; a repeated name contributes its URLs to the first
    /// channel of that name so names stay unique.
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut dir = Self::default();
        for channel in channels {
            if channel.urls.is_empty() {
                tracing::debug!("channel '{}' has no urls, skipping", channel.name);
                continue;
            }
            match dir.index.get(&channel.name) {
                Some(&idx) => {
                    let existing = &mut dir.channels[idx];
                    for url in channel.urls {
                        if !existing.urls.contains(&url) {
                            existing.urls.push(url);
                        }
                    }
                }
                None => {
                    dir.index.insert(channel.name.clone(), dir.channels.len());
                    dir.channels.push(channel);
                }
            }
        }
        dir
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Channel> {
        self.channels.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Flattened indices of the channels whose name is in `favorites`, in
    /// directory order.
    pub fn favorite_indices(&self, favorites: &BTreeSet<String>) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| favorites.contains(&c.name))
            .map(|(idx, _)| idx)
            .collect()
    }
}

// ── TOML channel loader ───────────────────────────────────────────────────────

/// Matches the `[[group]]` / `[[group.channel]]` tables of a channel file.
#[derive(Debug, serde::Deserialize)]
struct TomlChannelFile {
    #[serde(default)]
    group: Vec<TomlGroup>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlGroup {
    name: String,
    #[serde(default)]
    channel: Vec<TomlChannel>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlChannel {
    name: String,
    urls: Vec<String>,
}

pub fn load_directory_from_toml(path: &Path) -> Result<ChannelDirectory, DirectoryError> {
    let content = std::fs::read_to_string(path)?;
    parse_directory_from_toml_str(&content)
}

pub fn parse_directory_from_toml_str(content: &str) -> Result<ChannelDirectory, DirectoryError> {
    let file: TomlChannelFile = toml::from_str(content)?;
    let channels = file.group.into_iter().flat_map(|g| {
        let group = g.name;
        g.channel.into_iter().map(move |c| Channel {
            name: c.name,
            urls: c.urls,
            group: group.clone(),
        })
    });
    Ok(ChannelDirectory::new(channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[group]]
        name = "News"

        [[group.channel]]
        name = "CCTV-13"
        urls = ["http://a.example/13.m3u8", "http://b.example:8080/13.m3u8"]

        [[group.channel]]
        name = "Empty"
        urls = []

        [[group]]
        name = "Sports"

        [[group.channel]]
        name = "CCTV-5"
        urls = ["http://a.example/5.m3u8"]

        [[group.channel]]
        name = "CCTV-13"
        urls = ["http://c.example/13.flv", "http://a.example/13.m3u8"]
    "#;

    #[test]
    fn test_flattens_groups_in_order() {
        let dir = parse_directory_from_toml_str(SAMPLE).unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.get(0).unwrap().name, "CCTV-13");
        assert_eq!(dir.get(0).unwrap().group, "News");
        assert_eq!(dir.get(1).unwrap().name, "CCTV-5");
        assert_eq!(dir.index_of("CCTV-5"), Some(1));
        assert!(dir.get(2).is_none());
    }

    #[test]
    fn test_duplicate_names_merge_urls() {
        let dir = parse_directory_from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            dir.get(0).unwrap().urls,
            vec![
                "http://a.example/13.m3u8",
                "http://b.example:8080/13.m3u8",
                "http://c.example/13.flv",
            ]
        );
    }

    #[test]
    fn test_favorite_indices_follow_directory_order() {
        let dir = ChannelDirectory::new(["A", "F1", "B", "F2"].iter().map(|n| Channel {
            name: n.to_string(),
            urls: vec![format!("http://h/{n}")],
            group: String::new(),
        }));
        let favorites: BTreeSet<String> = ["F2", "F1", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(dir.favorite_indices(&favorites), vec![1, 3]);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let err = parse_directory_from_toml_str("[[group]]\nchannel = 3").unwrap_err();
        assert!(matches!(err, DirectoryError::Toml(_)));
    }
}
