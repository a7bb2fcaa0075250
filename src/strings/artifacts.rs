use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// URL fragment of the command-and-control endpoint used by this family.
pub const CNC_PATTERN: &str = "5050/index.php";
pub const DOWNLOAD_PATTERN: &str = "iso";

static RE_HTTP: Lazy<Regex> = Lazy::new(|| Regex::new(r"http://[^\s]+").expect("valid http regex"));
static RE_HTTPS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[^\s]+").expect("valid https regex"));

/// Unique URLs in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UrlSet {
    urls: Vec<String>,
    #[serde(skip)]
    seen: HashSet<String>,
}

impl UrlSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the URL was already present.
    pub fn insert(&mut self, url: impl Into<String>) -> bool {
        let url = url.into();
        if self.seen.contains(&url) {
            return false;
        }
        self.seen.insert(url.clone());
        self.urls.push(url);
        true
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.urls.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.urls
    }

    pub fn into_vec(self) -> Vec<String> {
        self.urls
    }
}

impl FromIterator<String> for UrlSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = UrlSet::new();
        for url in iter {
            set.insert(url);
        }
        set
    }
}

/// Collect every `http://` and `https://` token from `strings`.
pub fn find_urls<S: AsRef<str>>(strings: &[S]) -> UrlSet {
    let mut set = UrlSet::new();
    for s in strings {
        let s = s.as_ref();
        for m in RE_HTTP.find_iter(s).chain(RE_HTTPS.find_iter(s)) {
            set.insert(m.as_str());
        }
    }
    set
}

/// First URL containing `pattern` anywhere in its text.
pub fn find_url_containing<'a>(urls: &'a [String], pattern: &str) -> Option<&'a str> {
    urls.iter().map(String::as_str).find(|url| url.contains(pattern))
}

pub fn find_cnc_url(urls: &[String]) -> Option<&str> {
    find_url_containing(urls, CNC_PATTERN)
}

/// Case-sensitive, like the C&C match.
pub fn find_download_url<'a>(urls: &'a [String], pattern: &str) -> Option<&'a str> {
    find_url_containing(urls, pattern)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtefactKind {
    Url,
    CncUrl,
    DownloadUrl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlArtefact {
    pub kind: ArtefactKind,
    pub url: String,
}

/// Tag each URL with its role. A URL matching both patterns is reported as
/// the C&C endpoint.
pub fn classify_urls(urls: &[String], cnc_pattern: &str, download_pattern: &str) -> Vec<UrlArtefact> {
    let cnc = find_url_containing(urls, cnc_pattern);
    let download = find_url_containing(urls, download_pattern);
    urls.iter()
        .map(|url| {
            let kind = if Some(url.as_str()) == cnc {
                ArtefactKind::CncUrl
            } else if Some(url.as_str()) == download {
                ArtefactKind::DownloadUrl
            } else {
                ArtefactKind::Url
            };
            UrlArtefact {
                kind,
                url: url.clone(),
            }
        })
        .collect()
}
