//! Hosts that have delivered frames at least once.
//!
//! A host stays trusted until it fails or the user switches away from it;
//! entries never expire on their own.

use std::collections::BTreeSet;

/// `host[:port]` of a stream URL.  The port is only present when it differs
/// from the scheme default.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct PlayableHostCache {
    hosts: BTreeSet<String>,
}

impl PlayableHostCache {
    pub fn new(hosts: BTreeSet<String>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &BTreeSet<String> {
        &self.hosts
    }

    pub fn contains_url(&self, url: &str) -> bool {
        host_of(url).is_some_and(|h| self.hosts.contains(&h))
    }

    /// Index of the first URL whose host is trusted.
    pub fn first_playable(&self, urls: &[String]) -> Option<usize> {
        urls.iter().position(|u| self.contains_url(u))
    }

    /// Returns true if the cache changed.
    pub fn insert_url(&mut self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => self.hosts.insert(host),
            None => false,
        }
    }

    /// Returns true if the cache changed.
    pub fn evict_url(&mut self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => self.hosts.remove(&host),
            None => false,
        }
    }
}
