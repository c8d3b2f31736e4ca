//! Web search tool backed by the Tavily search API.
//!
//! Network-scoped; available only when `TAVILY_API_KEY` is set. Results are
//! returned as structured JSON so downstream steps can splice titles, URLs,
//! or the synthesized answer via placeholders.

use super::{ArgKind, Tool, ToolContext, ToolOutcome, ToolSchema, ToolScope};
use crate::error::ErrorKind;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const SEARCH_URL: &str = "https://api.tavily.com/search";
const DEFAULT_MAX_RESULTS: u32 = 5;

#[derive(Debug, Deserialize)]
struct WebSearchInput {
    query: String,
    max_results: Option<u32>,
}

pub struct WebSearchTool {
    client: Client,
    api_key: Option<String>,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(25))
            .build()
            .unwrap_or_default();
        Self { client, api_key }
    }

    pub fn from_env() -> Self {
        let api_key = match std::env::var("TAVILY_API_KEY") {
            Ok(key) if !key.is_empty() => {
                tracing::info!("Tavily API key found, web search available");
                Some(key)
            }
            _ => {
                tracing::debug!("TAVILY_API_KEY not set, web search will report errors");
                None
            }
        };
        Self::new(api_key)
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> String {
        "Search the web and return ranked results with titles, URLs, content snippets, and a synthesized answer when available.".to_string()
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .arg("query", ArgKind::String, true, "Search query")
            .arg(
                "max_results",
                ArgKind::Number,
                false,
                "Maximum number of results (default 5)",
            )
    }

    fn scope(&self) -> ToolScope {
        ToolScope::network()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let input: WebSearchInput = match serde_json::from_value(args) {
            Ok(i) => i,
            Err(e) => {
                return ToolOutcome::failure(ErrorKind::InvalidArguments, e.to_string());
            }
        };

        let Some(api_key) = &self.api_key else {
            return ToolOutcome::failure(
                ErrorKind::ToolFailed,
                "web search is not configured (TAVILY_API_KEY is unset)",
            );
        };

        let request = SearchRequest {
            api_key: api_key.clone(),
            query: input.query.clone(),
            search_depth: "basic",
            include_answer: true,
            max_results: input.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
        };

        let send = self.client.post(SEARCH_URL).json(&request).send();
        let response = tokio::select! {
            r = send => r,
            () = ctx.cancel.cancelled() => {
                return ToolOutcome::failure(ErrorKind::TaskCancelled, "search cancelled");
            }
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return ToolOutcome::failure(ErrorKind::ToolFailed, format!("search failed: {e}"));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return ToolOutcome::failure(
                ErrorKind::ToolFailed,
                format!("search failed with status {status}: {body}"),
            );
        }

        let parsed: SearchResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return ToolOutcome::failure(
                    ErrorKind::ToolFailed,
                    format!("failed to decode search response: {e}"),
                );
            }
        };

        let results: Vec<Value> = parsed
            .results
            .into_iter()
            .map(|r| {
                json!({
                    "title": r.title,
                    "url": r.url,
                    "content": r.content,
                })
            })
            .collect();

        ToolOutcome::success(json!({
            "query": input.query,
            "answer": parsed.answer,
            "results": results,
        }))
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    api_key: String,
    query: String,
    search_depth: &'static str,
    include_answer: bool,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}
