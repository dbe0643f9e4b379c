//! GraphQL page source.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use super::{PageQuery, PageSource};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// HTTP client for a Unirep subgraph endpoint.
#[derive(Clone)]
pub struct GraphqlClient {
    client: Client,
    url: String,
    max_retries: u32,
}

impl GraphqlClient {
    /// Build a client for `url`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent("unisync-indexer/subgraph")
            .build()
            .context("Failed to build subgraph HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Render the GraphQL document for one page.
    pub fn render(query: &PageQuery) -> String {
        let schema = query.schema;
        let mut filters = Vec::new();
        if let Some(id) = query.attester_id {
            filters.push(format!("attesterId: \"{}\"", id));
        }
        if let Some(extra) = schema.base_filter() {
            filters.push(extra.to_string());
        }
        let filter = if filters.is_empty() {
            String::new()
        } else {
            format!("where: {{ {} }}", filters.join(" "))
        };

        format!(
            "{{ {name} (first: {first} skip: {skip} orderBy: {order} orderDirection: {dir} {filter}) {{ {fields} }} }}",
            name = schema.name(),
            first = query.first,
            skip = query.skip,
            order = query.order.field,
            dir = if query.order.descending { "desc" } else { "asc" },
            filter = filter,
            fields = schema.fields().join(" "),
        )
    }

    async fn request(&self, document: &str) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "query": document }))
            .send()
            .await
            .context("Failed to reach subgraph")?;

        if !response.status().is_success() {
            bail!("Subgraph returned HTTP {}", response.status());
        }

        let body: Value = response
            .json()
            .await
            .context("Invalid subgraph response JSON")?;
        if let Some(errors) = body.get("errors") {
            bail!("Subgraph query failed: {}", errors);
        }
        Ok(body)
    }
}

#[async_trait]
impl PageSource for GraphqlClient {
    async fn page(&self, query: &PageQuery) -> Result<Vec<Value>> {
        let document = Self::render(query);
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;

        let body = loop {
            match self.request(&document).await {
                Ok(body) => break body,
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Subgraph request for {} failed (attempt {}), retrying in {:?}: {:#}",
                        query.schema.name(),
                        attempt,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        };

        match body.pointer(&format!("/data/{}", query.schema.name())) {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => bail!("Subgraph response missing {}", query.schema.name()),
        }
    }
}
