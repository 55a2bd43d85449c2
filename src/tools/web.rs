use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{parse_args, Tool, ToolContext};
use crate::{http_agent, truncate_with_marker, validate_screenshot_url};

const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";
const WEB_TIMEOUT_SECS: u64 = 30;
const MAX_SEARCH_RESULTS: usize = 10;
const DEFAULT_FETCH_CHARS: usize = 50_000;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; icron/0.1)";

static DROP_BLOCKS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|noscript|head|svg)\b.*?</(script|style|noscript|head|svg)\s*>").ok());
static BLOCK_BREAKS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*(br|/p|/div|/li|/h[1-6]|/tr|/section|/article)\s*/?>").ok());
static TAGS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").ok());
static SPACES: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").ok());
static BLANK_LINES: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n\s*\n+").ok());
static TITLE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok());

fn replace(re: &LazyLock<Option<Regex>>, text: &str, with: &str) -> String {
    match re.as_ref() {
        Some(re) => re.replace_all(text, with).into_owned(),
        None => text.to_string(),
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Readable text from an HTML document: scripts and styles dropped, tags stripped,
/// whitespace collapsed.
pub(crate) fn html_to_text(html: &str) -> String {
    let text = replace(&DROP_BLOCKS, html, " ");
    let text = replace(&BLOCK_BREAKS, &text, "\n");
    let text = replace(&TAGS, &text, "");
    let text = decode_entities(&text);
    let text = replace(&SPACES, &text, " ");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    replace(&BLANK_LINES, &lines.join("\n"), "\n\n").trim().to_string()
}

fn page_title(html: &str) -> Option<String> {
    let caps = TITLE.as_ref()?.captures(html)?;
    let title = decode_entities(caps.get(1)?.as_str().trim());
    (!title.is_empty()).then_some(title)
}

/// Render Brave's `web.results` as a numbered list.
pub(crate) fn format_brave_results(query: &str, body: &serde_json::Value, count: usize) -> String {
    let results = body
        .pointer("/web/results")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if results.is_empty() {
        return format!("No results for: {query}");
    }
    let mut lines = vec![format!("Results for: {query}\n")];
    for (i, item) in results.iter().take(count).enumerate() {
        let title = item.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let url = item.get("url").and_then(|v| v.as_str()).unwrap_or("");
        lines.push(format!("{}. {}\n   {url}", i + 1, html_to_text(title)));
        if let Some(desc) = item.get("description").and_then(|v| v.as_str()) {
            lines.push(format!("   {}", html_to_text(desc)));
        }
    }
    lines.join("\n")
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    count: Option<usize>,
}

pub(crate) struct WebSearchTool {
    api_key: String,
    max_results: usize,
}

impl WebSearchTool {
    pub(crate) fn new(api_key: &str, max_results: usize) -> Self {
        Self {
            api_key: api_key.to_string(),
            max_results: max_results.clamp(1, MAX_SEARCH_RESULTS),
        }
    }
}

impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs, and snippets."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "count": {"type": "integer", "description": "Results (1-10)"}
            },
            "required": ["query"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: SearchArgs = parse_args(args)?;
        if self.api_key.is_empty() {
            return Err("Error: BRAVE_API_KEY not configured".into());
        }
        let count = parsed.count.unwrap_or(self.max_results).clamp(1, MAX_SEARCH_RESULTS);
        let url = format!(
            "{BRAVE_SEARCH_URL}?q={}&count={count}",
            urlencoding::encode(&parsed.query)
        );
        let response = http_agent(WEB_TIMEOUT_SECS)
            .get(&url)
            .set("Accept", "application/json")
            .set("X-Subscription-Token", &self.api_key)
            .call()
            .map_err(|e| format!("Error: web search failed: {e}"))?;
        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| format!("Error: web search returned invalid JSON: {e}"))?;
        Ok(format_brave_results(&parsed.query, &body, count))
    }
}

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
    #[serde(default, rename = "maxChars")]
    max_chars: Option<usize>,
}

pub(crate) struct WebFetchTool;

impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and extract its readable text content."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL to fetch"},
                "maxChars": {"type": "integer", "description": "Maximum characters of text to return"}
            },
            "required": ["url"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: FetchArgs = parse_args(args)?;
        let url = validate_screenshot_url(&parsed.url).map_err(|e| format!("Error: URL validation failed - {e}"))?;
        let response = http_agent(WEB_TIMEOUT_SECS)
            .get(url.as_str())
            .set("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| format!("Error fetching {url}: {e}"))?;
        let final_url = response.get_url().to_string();
        let is_html = response.content_type().contains("html");
        let body = response
            .into_string()
            .map_err(|e| format!("Error reading {url}: {e}"))?;
        let (title, text) = if is_html {
            (page_title(&body), html_to_text(&body))
        } else {
            (None, body)
        };
        let limit = parsed.max_chars.unwrap_or(DEFAULT_FETCH_CHARS).max(100);
        let mut out = format!("URL: {final_url}\n");
        if let Some(title) = title {
            out.push_str(&format!("Title: {title}\n"));
        }
        out.push('\n');
        out.push_str(&truncate_with_marker(&text, limit));
        Ok(out)
    }
}
