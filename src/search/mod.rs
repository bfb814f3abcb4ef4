use crate::repository::ToolRepository;
use crate::tools::{Tool, ToolSearchStrategy};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Default search: case-insensitive substring match on name and description.
/// Name hits rank ahead of description-only hits; within a band, ties keep
/// registration order. An empty query returns everything (up to `limit`).
pub struct SubstringSearch {
    tool_repository: Arc<dyn ToolRepository>,
}

impl SubstringSearch {
    pub fn new(repo: Arc<dyn ToolRepository>) -> Self {
        Self {
            tool_repository: repo,
        }
    }
}

#[async_trait]
impl ToolSearchStrategy for SubstringSearch {
    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>> {
        let tools = self.tool_repository.get_tools().await?;
        let query = query.trim().to_lowercase();

        let mut ranked = if query.is_empty() {
            tools
        } else {
            let mut name_hits = Vec::new();
            let mut description_hits = Vec::new();
            for tool in tools {
                if tool.name.to_lowercase().contains(&query) {
                    name_hits.push(tool);
                } else if tool.description.to_lowercase().contains(&query) {
                    description_hits.push(tool);
                }
            }
            name_hits.extend(description_hits);
            name_hits
        };

        if limit > 0 && ranked.len() > limit {
            ranked.truncate(limit);
        }
        Ok(ranked)
    }
}
