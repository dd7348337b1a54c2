//! Web tools: search and page scraping, with a TTL result cache.
//!
//! Results are cached keyed by a hash of the normalised query plus the
//! parameters, so a model re-asking the same question within the TTL never
//! pays for a second upstream call.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::llm::ToolDefinition;
use crate::tools::context::{Tool, ToolContext, ToolError};

const MAX_QUERY_LENGTH: usize = 500;
const MAX_SCRAPE_CHARS: usize = 40_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Upstream search provider.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<SearchResult>, ToolError>;
}

/// Upstream page fetcher.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, ToolError>;
}

/// Search provider speaking the common JSON search-API shape
/// (`POST {endpoint} {api_key, query, max_results}` → `{results: [...]}`).
pub struct HttpSearchApi {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSearchApi {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl SearchApi for HttpSearchApi {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ToolError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ToolError::Execution("no search api key configured".into()))?;

        let body = json!({
            "api_key": api_key,
            "query": query,
            "max_results": max_results,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("search request failed: {e}")))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Execution(format!("bad search response: {e}")))?;

        let results = payload
            .get("results")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(SearchResult {
                            title: item.get("title")?.as_str()?.to_string(),
                            url: item.get("url")?.as_str()?.to_string(),
                            snippet: item
                                .get("content")
                                .or_else(|| item.get("snippet"))
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(results)
    }
}

/// Plain GET fetcher.
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, ToolError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("fetch failed: {e}")))?;
        response
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("fetch body failed: {e}")))
    }
}

fn cache_key(query: &str, max_results: usize) -> String {
    let normalized: String = query
        .trim()
        .to_lowercase()
        .chars()
        .take(MAX_QUERY_LENGTH)
        .collect();
    let hash = rapidhash::v3::rapidhash_v3(normalized.as_bytes());
    format!("{hash:016x}:{max_results}")
}

/// ASCII case-insensitive prefix check at a byte offset.
fn starts_ci(haystack: &str, at: usize, needle: &str) -> bool {
    haystack
        .as_bytes()
        .get(at..at + needle.len())
        .map(|slice| slice.eq_ignore_ascii_case(needle.as_bytes()))
        .unwrap_or(false)
}

/// Crude tag stripper for scraped pages; drops script/style bodies and
/// collapses whitespace.
fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices().peekable();
    let mut skip_until: Option<&'static str> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(end_tag) = skip_until {
            if starts_ci(html, i, end_tag) {
                skip_until = None;
                for _ in 0..end_tag.len() - 1 {
                    chars.next();
                }
            }
            continue;
        }
        if c == '<' {
            if starts_ci(html, i, "<script") {
                skip_until = Some("</script>");
                continue;
            }
            if starts_ci(html, i, "<style") {
                skip_until = Some("</style>");
                continue;
            }
            // Skip to the closing bracket of the tag.
            for (_, tc) in chars.by_ref() {
                if tc == '>' {
                    break;
                }
            }
            text.push(' ');
            continue;
        }
        text.push(c);
    }

    let mut collapsed = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_space {
                collapsed.push(' ');
                last_space = true;
            }
        } else {
            collapsed.push(c);
            last_space = false;
        }
    }
    collapsed.trim().to_string()
}

/// `web_search` with a moka TTL cache in front of the provider.
pub struct WebSearchTool {
    api: Arc<dyn SearchApi>,
    cache: Cache<String, Arc<Vec<SearchResult>>>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(api: Arc<dyn SearchApi>, cache_ttl: Duration, max_results: usize) -> Self {
        Self {
            api,
            cache: Cache::builder()
                .max_capacity(1024)
                .time_to_live(cache_ttl)
                .build(),
            max_results,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_search".into(),
            description: "Search the web. Returns titles, urls and snippets.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query"},
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of results"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'query' must be a string".into()))?;
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_results)
            .clamp(1, 20);

        let key = cache_key(query, max_results);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(json!({
                "query": query,
                "results": cached.as_ref(),
                "cached": true,
            }));
        }

        let results = Arc::new(self.api.search(query, max_results).await?);
        self.cache.insert(key, results.clone()).await;
        Ok(json!({
            "query": query,
            "results": results.as_ref(),
            "cached": false,
        }))
    }
}

/// `web_scrape` with the same cache treatment, keyed by url.
pub struct WebScrapeTool {
    fetcher: Arc<dyn PageFetcher>,
    cache: Cache<String, Arc<String>>,
}

impl WebScrapeTool {
    pub fn new(fetcher: Arc<dyn PageFetcher>, cache_ttl: Duration) -> Self {
        Self {
            fetcher,
            cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(cache_ttl)
                .build(),
        }
    }
}

#[async_trait]
impl Tool for WebScrapeTool {
    fn name(&self) -> &str {
        "web_scrape"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_scrape".into(),
            description: "Fetch a web page and return its visible text.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "Page url (http or https)"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = args["url"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'url' must be a string".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "url must start with http:// or https://".into(),
            ));
        }

        let key = cache_key(url, 1);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(json!({"url": url, "text": cached.as_ref(), "cached": true}));
        }

        let html = self.fetcher.fetch(url).await?;
        let mut text = strip_html(&html);
        if text.chars().count() > MAX_SCRAPE_CHARS {
            text = text.chars().take(MAX_SCRAPE_CHARS).collect();
            text.push_str(" …");
        }
        let text = Arc::new(text);
        self.cache.insert(key, text.clone()).await;
        Ok(json!({"url": url, "text": text.as_ref(), "cached": false}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::SqliteStore;
    use crate::test_utils::test_tool_context;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSearchApi {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SearchApi for CountingSearchApi {
        async fn search(
            &self,
            query: &str,
            _max_results: usize,
        ) -> Result<Vec<SearchResult>, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SearchResult {
                title: format!("About {query}"),
                url: "https://example.com".into(),
                snippet: "snippet".into(),
            }])
        }
    }

    struct CountingFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PageFetcher for CountingFetcher {
        async fn fetch(&self, _url: &str) -> Result<String, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("<html><head><style>p{color:red}</style></head>\
                <body><h1>Title</h1><script>alert(1)</script><p>Hello   world</p></body></html>"
                .into())
        }
    }

    async fn ctx() -> ToolContext {
        let store = Arc::new(SqliteStore::connect(":memory:".into()).await.unwrap());
        let broker = Arc::new(MemoryBroker::new());
        test_tool_context(store, broker).await
    }

    // ── web_search caching ─────────────────────────────────────────────────

    #[tokio::test]
    async fn repeated_searches_hit_the_cache() {
        let api = Arc::new(CountingSearchApi {
            calls: AtomicU32::new(0),
        });
        let tool = WebSearchTool::new(api.clone(), Duration::from_secs(900), 5);
        let ctx = ctx().await;

        let first = tool.call(json!({"query": "rust agents"}), &ctx).await.unwrap();
        assert_eq!(first["cached"], false);
        let second = tool.call(json!({"query": "rust agents"}), &ctx).await.unwrap();
        assert_eq!(second["cached"], true);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1, "one upstream call");
    }

    #[tokio::test]
    async fn query_normalisation_shares_cache_entries() {
        let api = Arc::new(CountingSearchApi {
            calls: AtomicU32::new(0),
        });
        let tool = WebSearchTool::new(api.clone(), Duration::from_secs(900), 5);
        let ctx = ctx().await;

        tool.call(json!({"query": "Rust Agents"}), &ctx).await.unwrap();
        tool.call(json!({"query": "  rust agents  "}), &ctx).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_max_results_use_separate_entries() {
        let api = Arc::new(CountingSearchApi {
            calls: AtomicU32::new(0),
        });
        let tool = WebSearchTool::new(api.clone(), Duration::from_secs(900), 5);
        let ctx = ctx().await;

        tool.call(json!({"query": "x", "max_results": 3}), &ctx).await.unwrap();
        tool.call(json!({"query": "x", "max_results": 7}), &ctx).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    // ── web_scrape ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn scrape_strips_markup_and_caches() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let tool = WebScrapeTool::new(fetcher.clone(), Duration::from_secs(900));
        let ctx = ctx().await;

        let result = tool
            .call(json!({"url": "https://example.com/page"}), &ctx)
            .await
            .unwrap();
        let text = result["text"].as_str().unwrap();
        assert_eq!(text, "Title Hello world");
        assert!(!text.contains("alert"), "script bodies must be dropped");
        assert!(!text.contains("color"), "style bodies must be dropped");

        tool.call(json!({"url": "https://example.com/page"}), &ctx)
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scrape_rejects_non_http_urls() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let tool = WebScrapeTool::new(fetcher, Duration::from_secs(900));
        let ctx = ctx().await;
        assert!(
            tool.call(json!({"url": "file:///etc/passwd"}), &ctx)
                .await
                .is_err()
        );
    }

    // ── strip_html ─────────────────────────────────────────────────────────

    #[test]
    fn strip_html_collapses_whitespace() {
        assert_eq!(strip_html("<p>a</p>\n\n<p>b   c</p>"), "a b c");
    }

    #[test]
    fn strip_html_handles_plain_text() {
        assert_eq!(strip_html("no markup here"), "no markup here");
    }
}
