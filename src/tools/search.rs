//! Web search tool
//!
//! Lets the model look up current information via Google Custom Search or
//! Serper, whichever is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::Tool;
use crate::{Error, Result};

const GOOGLE_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";

/// Search provider configuration
#[derive(Debug, Clone)]
pub enum SearchProvider {
    /// Google Custom Search JSON API
    Google {
        /// API key
        api_key: String,
        /// Search engine id
        cx: String,
    },
    /// Serper (Google) Search API
    Serper {
        /// API key for Serper
        api_key: String,
    },
}

/// Web search tool
pub struct WebSearchTool {
    provider: SearchProvider,
    client: reqwest::Client,
}

/// Search result from web search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Result snippet
    pub snippet: String,
}

/// Google Custom Search response
#[derive(Debug, Deserialize)]
struct GoogleSearchResponse {
    #[serde(default)]
    items: Vec<GoogleItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleItem {
    #[serde(default)]
    snippet: String,
}

/// Serper API response
#[derive(Debug, Deserialize)]
struct SerperSearchResponse {
    organic: Option<Vec<SerperResult>>,
}

#[derive(Debug, Deserialize)]
struct SerperResult {
    #[serde(default)]
    snippet: String,
}

/// Serper API request body
#[derive(Debug, Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
}

impl WebSearchTool {
    /// Create a web search tool for the given provider
    #[must_use]
    pub fn new(provider: SearchProvider) -> Self {
        Self {
            provider,
            client: reqwest::Client::new(),
        }
    }

    /// Pick a provider from credentials, preferring Google
    #[must_use]
    pub fn from_keys(
        google_api_key: Option<&str>,
        google_cx: Option<&str>,
        serper_api_key: Option<&str>,
    ) -> Option<Self> {
        let provider = match (google_api_key, google_cx, serper_api_key) {
            (Some(api_key), Some(cx), _) => SearchProvider::Google {
                api_key: api_key.to_string(),
                cx: cx.to_string(),
            },
            (_, _, Some(api_key)) => SearchProvider::Serper {
                api_key: api_key.to_string(),
            },
            _ => return None,
        };
        Some(Self::new(provider))
    }

    /// Perform a web search
    ///
    /// # Errors
    ///
    /// Returns error if the search request fails or response parsing fails
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        tracing::info!(query, "searching the web");
        match &self.provider {
            SearchProvider::Google { api_key, cx } => self.search_google(api_key, cx, query).await,
            SearchProvider::Serper { api_key } => self.search_serper(api_key, query).await,
        }
    }

    async fn search_google(&self, api_key: &str, cx: &str, query: &str) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .get(GOOGLE_ENDPOINT)
            .query(&[("key", api_key), ("cx", cx), ("q", query)])
            .send()
            .await?;

        let response = response.error_for_status().map_err(Error::Http)?;
        let body: GoogleSearchResponse = response.json().await?;

        Ok(body
            .items
            .into_iter()
            .map(|item| SearchResult { snippet: item.snippet })
            .collect())
    }

    async fn search_serper(&self, api_key: &str, query: &str) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .post(SERPER_ENDPOINT)
            .header("X-API-KEY", api_key)
            .json(&SerperRequest { q: query })
            .send()
            .await?;

        let response = response.error_for_status().map_err(Error::Http)?;
        let body: SerperSearchResponse = response.json().await?;

        Ok(body
            .organic
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchResult { snippet: r.snippet })
            .collect())
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "webSearch"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name(),
            "description": "Search google for current information",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            }
        })
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        let args: SearchArgs =
            serde_json::from_value(arguments).map_err(|e| Error::Tool(format!("invalid search arguments: {e}")))?;
        let results = self.search(&args.query).await?;
        Ok(json!({ "results": results }))
    }
}
