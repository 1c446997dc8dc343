//! Species name catalogues.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use indexmap::IndexSet;
use regex::Regex;
use thiserror::Error;

/// Default species catalogue page.
pub const DEFAULT_CATALOGUE_URL: &str = "https://oceana.org/ocean-fishes/";

/// Errors surfaced by name providers.
#[derive(Debug, Error)]
pub enum NameSourceError {
    /// The catalogue could not be reached.
    #[error("catalogue unreachable: {0}")]
    Unreachable(String),
    /// The catalogue answered but its content was unusable.
    #[error("malformed catalogue: {0}")]
    Malformed(String),
    /// Local file failure.
    #[error("io error reading {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Supplies the finite, ordered pool of species names. Called once at startup.
#[async_trait]
pub trait NameProvider: Send + Sync {
    /// Returns the candidate names, in catalogue order.
    async fn names(&self) -> Result<Vec<String>, NameSourceError>;
}

/// Fixed in-code list.
#[derive(Debug, Clone, Default)]
pub struct StaticNames {
    names: Vec<String>,
}

impl StaticNames {
    /// Wraps the given names.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// A small offline catalogue of reef species.
    #[must_use]
    pub fn reef_species() -> Self {
        Self::new([
            "Atlantic Cod",
            "Blue Tang",
            "Clownfish",
            "Great Barracuda",
            "Grouper",
            "Lionfish",
            "Moorish Idol",
            "Napoleon Wrasse",
            "Parrotfish",
            "Queen Angelfish",
            "Sailfish",
            "Scorpionfish",
            "Spotted Eagle Ray",
            "Stonefish",
            "Yellowfin Tuna",
        ])
    }
}

#[async_trait]
impl NameProvider for StaticNames {
    async fn names(&self) -> Result<Vec<String>, NameSourceError> {
        Ok(self.names.clone())
    }
}

/// One name per line. Blank lines and `#` comments are skipped.
#[derive(Debug, Clone)]
pub struct FileNames {
    path: PathBuf,
}

impl FileNames {
    /// Reads names from `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl NameProvider for FileNames {
    async fn names(&self) -> Result<Vec<String>, NameSourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| NameSourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(dedup(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_owned),
        ))
    }
}

/// Scrapes species headings from an HTML catalogue page.
#[derive(Debug, Clone)]
pub struct HttpNames {
    url: String,
    timeout: Duration,
}

impl HttpNames {
    /// Fetches from `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(15),
        }
    }

    /// Overrides the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpNames {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOGUE_URL)
    }
}

#[async_trait]
impl NameProvider for HttpNames {
    async fn names(&self) -> Result<Vec<String>, NameSourceError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| NameSourceError::Unreachable(err.to_string()))?;
        let body = client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| NameSourceError::Unreachable(err.to_string()))?
            .text()
            .await
            .map_err(|err| NameSourceError::Unreachable(err.to_string()))?;
        parse_catalogue(&body)
    }
}

/// Extracts `<h2 class="... tb-heading ...">Name</h2>` headings.
pub fn parse_catalogue(html: &str) -> Result<Vec<String>, NameSourceError> {
    let heading = Regex::new(r#"(?is)<h2[^>]*class="[^"]*\btb-heading\b[^"]*"[^>]*>(.*?)</h2>"#)
        .map_err(|err| NameSourceError::Malformed(err.to_string()))?;
    let tags = Regex::new(r"(?s)<[^>]*>").map_err(|err| NameSourceError::Malformed(err.to_string()))?;
    let names = dedup(heading.captures_iter(html).filter_map(|caps| {
        let text = tags.replace_all(&caps[1], "");
        let text = decode_entities(text.trim());
        (!text.is_empty()).then_some(text)
    }));
    if names.is_empty() {
        return Err(NameSourceError::Malformed("no species headings found".into()));
    }
    Ok(names)
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&#8217;", "'")
        .replace("&#039;", "'")
        .replace("&nbsp;", " ")
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    names.collect::<IndexSet<_>>().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_catalogue_headings() {
        let html = r#"
            <div class="tb-grid-column"><h2 class="tb-heading has-text">Atlantic Cod</h2></div>
            <div class="tb-grid-column"><h2 class="tb-heading"><a href="/x">Blue&nbsp;Marlin</a></h2></div>
            <div class="tb-grid-column"><h2 class="other">Not a fish</h2></div>
            <div class="tb-grid-column"><h2 class="tb-heading">Atlantic Cod</h2></div>
        "#;
        let names = parse_catalogue(html).unwrap();
        assert_eq!(names, vec!["Atlantic Cod", "Blue Marlin"]);
    }

    #[test]
    fn empty_catalogue_is_an_error() {
        assert!(matches!(
            parse_catalogue("<html></html>"),
            Err(NameSourceError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn file_names_skip_comments_and_duplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fish.txt");
        std::fs::write(&path, "# reef\nGrouper\n\n  Lionfish \nGrouper\n").unwrap();
        let names = FileNames::new(&path).names().await.unwrap();
        assert_eq!(names, vec!["Grouper", "Lionfish"]);
    }

    #[tokio::test]
    async fn missing_file_reports_path() {
        let err = FileNames::new("/nonexistent/fish.txt")
            .names()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fish.txt"));
    }

    #[tokio::test]
    async fn static_names_are_returned_in_order() {
        let names = StaticNames::new(["b", "a"]).names().await.unwrap();
        assert_eq!(names, vec!["b", "a"]);
        assert!(StaticNames::reef_species().names().await.unwrap().len() >= 10);
    }
}
