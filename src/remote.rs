//! Remote catalog fetching and parsing.
//!
//! The transport hands back raw JSON payloads; this module turns them into a
//! `Catalog` snapshot (replaced wholesale by the sync service), a language
//! list, or a category list. Field parsing is tolerant: unknown fields are
//! ignored and missing optionals default, so a slightly newer server does
//! not break the reader.

use crate::book::{Book, Catalog, Favicon};
use crate::error::CoreError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Filter parameters forwarded to the catalog server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogQuery {
    pub languages: Vec<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub query: String,
}

/// The network collaborator. Implementations block; the sync service calls
/// them from worker threads and the results come back as events.
pub trait CatalogTransport: Send + Sync {
    fn fetch_catalog(&self, query: &CatalogQuery) -> Result<String, CoreError>;
    fn fetch_languages(&self) -> Result<String, CoreError>;
    fn fetch_categories(&self) -> Result<String, CoreError>;
    /// Base URL books in this catalog are served from.
    fn source_url(&self) -> String;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FeedBook {
    id: String,
    title: String,
    description: String,
    date: String,
    language: String,
    tags: Vec<String>,
    size: u64,
    url: String,
    favicon_url: Option<String>,
    favicon_data: Option<String>,
}

impl Default for FeedBook {
    fn default() -> Self {
        FeedBook {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            date: String::new(),
            language: String::new(),
            tags: Vec::new(),
            size: 0,
            url: String::new(),
            favicon_url: None,
            favicon_data: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(default)]
    books: Vec<FeedBook>,
}

/// Parse a catalog feed into a fresh snapshot. Records without an id are
/// dropped; they cannot be addressed and would collide in the map.
pub fn parse_feed(content: &str) -> Result<Catalog, CoreError> {
    let feed: Feed = serde_json::from_str(content).map_err(|err| {
        CoreError::transport("the catalog feed could not be parsed", err.to_string())
    })?;

    let mut catalog = Catalog::new();
    let mut skipped = 0usize;
    for entry in feed.books {
        if entry.id.is_empty() {
            skipped += 1;
            continue;
        }
        let favicon = match (entry.favicon_data, entry.favicon_url) {
            (Some(data), _) if !data.is_empty() => Some(Favicon::Data(data)),
            (_, Some(url)) if !url.is_empty() => Some(Favicon::Url(url)),
            _ => None,
        };
        catalog.upsert(Book {
            id: entry.id,
            title: entry.title,
            description: entry.description,
            date: entry.date,
            tags: entry.tags,
            language: entry.language,
            size: entry.size,
            favicon,
            path: None,
            download_id: String::new(),
            url: entry.url,
        });
    }
    if skipped > 0 {
        debug!(skipped, "Dropped feed records without an id");
    }
    info!(books = catalog.len(), "Parsed remote catalog feed");
    Ok(catalog)
}

/// `(code, self-name)` pairs advertised by the server.
pub fn parse_languages(content: &str) -> Result<Vec<(String, String)>, CoreError> {
    #[derive(Deserialize)]
    struct LanguageEntry {
        code: String,
        #[serde(default)]
        name: String,
    }

    let entries: Vec<LanguageEntry> = serde_json::from_str(content).map_err(|err| {
        CoreError::transport("the language feed could not be parsed", err.to_string())
    })?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.code.is_empty())
        .map(|e| {
            let name = if e.name.is_empty() { e.code.clone() } else { e.name };
            (e.code, name)
        })
        .collect())
}

pub fn parse_categories(content: &str) -> Result<Vec<String>, CoreError> {
    let categories: Vec<String> = serde_json::from_str(content).map_err(|err| {
        CoreError::transport("the category feed could not be parsed", err.to_string())
    })?;
    Ok(categories.into_iter().filter(|c| !c.is_empty()).collect())
}

/// Default transport: a blocking HTTP client against a catalog server.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, CoreError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| {
                CoreError::transport("could not set up the catalog client", err.to_string())
            })?;
        Ok(HttpTransport {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn get(&self, path: &str, params: &[(&str, String)]) -> Result<String, CoreError> {
        let url = format!("{}{path}", self.base_url);
        let request = self.client.get(&url).query(
            &params
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .collect::<Vec<_>>(),
        );
        let response = request.send().map_err(|err| {
            CoreError::transport("could not reach the catalog server", err.to_string())
        })?;
        let response = response.error_for_status().map_err(|err| {
            CoreError::transport("the catalog server refused the request", err.to_string())
        })?;
        response.text().map_err(|err| {
            CoreError::transport("the catalog response could not be read", err.to_string())
        })
    }
}

impl CatalogTransport for HttpTransport {
    fn fetch_catalog(&self, query: &CatalogQuery) -> Result<String, CoreError> {
        self.get(
            "/catalog/books",
            &[
                ("lang", query.languages.join(",")),
                ("category", query.categories.join(",")),
                ("tag", query.tags.join(",")),
                ("q", query.query.clone()),
            ],
        )
    }

    fn fetch_languages(&self) -> Result<String, CoreError> {
        self.get("/catalog/languages", &[])
    }

    fn fetch_categories(&self) -> Result<String, CoreError> {
        self.get("/catalog/categories", &[])
    }

    fn source_url(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_parsing_builds_a_catalog_keyed_by_id() {
        let content = r#"{
            "books": [
                {"id": "a", "title": "Atlas", "size": 42, "url": "http://example.org/a.zim"},
                {"id": "b", "title": "Birds", "language": "eng", "tags": ["_category:nature"]}
            ]
        }"#;

        let catalog = parse_feed(content).expect("feed parses");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("a").map(|b| b.size), Some(42));
        assert_eq!(
            catalog.get("b").and_then(|b| b.category()),
            Some("nature")
        );
    }

    #[test]
    fn feed_parsing_tolerates_unknown_fields_and_drops_idless_records() {
        let content = r#"{
            "books": [
                {"id": "a", "title": "Atlas", "flavour": "maxi", "articleCount": 9000},
                {"title": "Nameless"}
            ]
        }"#;

        let catalog = parse_feed(content).expect("feed parses");
        assert_eq!(catalog.len(), 1);
        assert!(catalog.contains("a"));
    }

    #[test]
    fn feed_parsing_rejects_garbage() {
        let err = parse_feed("not json at all").expect_err("must fail");
        assert!(matches!(err, CoreError::Transport { .. }));
    }

    #[test]
    fn favicon_prefers_inline_data_over_a_url() {
        let content = r#"{
            "books": [
                {"id": "a", "favicon_data": "aWNvbg==", "favicon_url": "http://example.org/i.png"},
                {"id": "b", "favicon_url": "http://example.org/i.png"}
            ]
        }"#;

        let catalog = parse_feed(content).expect("feed parses");
        assert_eq!(
            catalog.get("a").and_then(|b| b.favicon.clone()),
            Some(Favicon::Data("aWNvbg==".to_string()))
        );
        assert_eq!(
            catalog.get("b").and_then(|b| b.favicon.clone()),
            Some(Favicon::Url("http://example.org/i.png".to_string()))
        );
    }

    #[test]
    fn languages_default_their_name_to_the_code() {
        let content = r#"[{"code": "eng", "name": "English"}, {"code": "fra"}]"#;
        let languages = parse_languages(content).expect("languages parse");
        assert_eq!(
            languages,
            vec![
                ("eng".to_string(), "English".to_string()),
                ("fra".to_string(), "fra".to_string())
            ]
        );
    }

    #[test]
    fn categories_drop_empty_entries() {
        let content = r#"["wikipedia", "", "nature"]"#;
        let categories = parse_categories(content).expect("categories parse");
        assert_eq!(categories, ["wikipedia", "nature"]);
    }
}
