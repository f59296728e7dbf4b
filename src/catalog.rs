//! Catálogo de documentos: la fuente de la jerarquía que alimenta el índice
//! del árbol. De momento sólo existe `MockCatalog`, con datos en memoria;
//! un backend real implementaría `DocumentSource`.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use chrono::{DateTime, TimeZone, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{
    models::{DocumentNode, NodeContent, NodeMetadata, NodeType},
    tree_index::{find_node_by_id, flatten_tree},
};

const EMBEDDING_DIMENSIONS: usize = 768;

/// Texto completo de un documento junto con su embedding.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentText {
    pub id: String,
    pub content: String,
    pub embeddings: Vec<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    Date,
    Name,
    Size,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filtros opcionales de búsqueda.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSort {
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: String,
    pub filters: SearchFilters,
    pub sort: Option<SearchSort>,
}

/// Colaborador que entrega la jerarquía de documentos.
pub trait DocumentSource: Send + Sync {
    fn list_documents(&self) -> Vec<DocumentNode>;

    fn find_document(&self, id: &str) -> Option<DocumentNode>;

    fn document_content(&self, id: &str) -> Option<DocumentText>;

    fn search(&self, query: &SearchQuery) -> Vec<DocumentNode>;

    fn suggestions(&self, partial: &str) -> Vec<String>;
}

/// Catálogo en memoria con los datos de ejemplo.
#[derive(Debug, Clone)]
pub struct MockCatalog {
    roots: Vec<DocumentNode>,
    suggestions: Vec<String>,
}

impl Default for MockCatalog {
    fn default() -> Self {
        Self::new(mock_documents())
    }
}

impl MockCatalog {
    pub fn new(roots: Vec<DocumentNode>) -> Self {
        Self {
            roots,
            suggestions: [
                "Getting Started",
                "Authentication",
                "API Reference",
                "Documentation",
                "TypeScript",
                "React Components",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl DocumentSource for MockCatalog {
    fn list_documents(&self) -> Vec<DocumentNode> {
        self.roots.clone()
    }

    fn find_document(&self, id: &str) -> Option<DocumentNode> {
        find_node_by_id(&self.roots, id).cloned()
    }

    fn document_content(&self, id: &str) -> Option<DocumentText> {
        let node = find_node_by_id(&self.roots, id)?;
        let content = node
            .content
            .as_ref()
            .and_then(|c| c.full.clone().or_else(|| c.full_text.clone()))
            .unwrap_or_else(|| {
                format!(
                    "# Full content for document {}\n\nThis would be the complete document content...",
                    node.id
                )
            });
        Some(DocumentText {
            id: node.id.clone(),
            content,
            embeddings: pseudo_embedding(&node.id, EMBEDDING_DIMENSIONS),
        })
    }

    fn search(&self, query: &SearchQuery) -> Vec<DocumentNode> {
        let needle = query.text.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut results: Vec<DocumentNode> = flatten_tree(&self.roots)
            .into_iter()
            .filter(|node| node.is_document())
            .filter(|node| matches_text(node, &needle))
            .filter(|node| matches_filters(node, &query.filters))
            .cloned()
            .collect();

        if let Some(sort) = &query.sort {
            sort_results(&mut results, sort);
        }
        results
    }

    fn suggestions(&self, partial: &str) -> Vec<String> {
        let needle = partial.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.suggestions
            .iter()
            .filter(|s| s.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }
}

fn matches_text(node: &DocumentNode, needle: &str) -> bool {
    node.name.to_lowercase().contains(needle)
        || node
            .preview()
            .is_some_and(|p| p.to_lowercase().contains(needle))
        || node.tags().iter().any(|t| t.to_lowercase().contains(needle))
}

fn matches_filters(node: &DocumentNode, filters: &SearchFilters) -> bool {
    let type_ok = filters.node_type.map_or(true, |t| node.node_type == t);
    let tags_ok = filters.tags.iter().all(|wanted| {
        node.tags()
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(wanted))
    });
    type_ok && tags_ok
}

fn sort_results(results: &mut [DocumentNode], sort: &SearchSort) {
    let meta = |n: &DocumentNode| n.metadata.clone();
    results.sort_by(|a, b| {
        let ordering = match sort.sort_by {
            SortBy::Relevance => {
                let score = |n: &DocumentNode| meta(n).and_then(|m| m.relevance_score).unwrap_or(0.0);
                score(a).total_cmp(&score(b))
            }
            SortBy::Date => {
                let date = |n: &DocumentNode| meta(n).map(|m| m.last_modified);
                date(a).cmp(&date(b))
            }
            SortBy::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortBy::Size => {
                let size = |n: &DocumentNode| meta(n).map(|m| m.size).unwrap_or(0);
                size(a).cmp(&size(b))
            }
        };
        match sort.sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Vector determinista derivado del id: el mismo id produce siempre el
/// mismo embedding.
fn pseudo_embedding(seed: &str, dimensions: usize) -> Vec<f32> {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let mut rng = ChaCha8Rng::seed_from_u64(hasher.finish());
    (0..dimensions).map(|_| rng.gen::<f32>()).collect()
}

fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

fn metadata(size: u64, modified: DateTime<Utc>, doc_type: &str, tags: &[&str], usage: u64) -> Option<NodeMetadata> {
    Some(NodeMetadata {
        size,
        last_modified: modified,
        document_type: doc_type.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        usage_count: usage,
        relevance_score: None,
    })
}

fn preview(text: &str) -> Option<NodeContent> {
    Some(NodeContent {
        preview: Some(text.to_string()),
        ..Default::default()
    })
}

/// Jerarquía de ejemplo servida mientras no hay backend real.
pub fn mock_documents() -> Vec<DocumentNode> {
    let mut getting_started =
        DocumentNode::document("2", "Getting Started.md", "/docs/getting-started.md").with_parent("1");
    getting_started.metadata = metadata(1024, date(2024, 1, 15), "markdown", &["documentation", "guide"], 45);
    getting_started.content =
        preview("This guide will help you get started with the Interactive Knowledge Tree...");

    let mut auth = DocumentNode::document("4", "Authentication.md", "/docs/api/auth.md").with_parent("3");
    auth.metadata = metadata(2048, date(2024, 1, 20), "markdown", &["api", "authentication"], 23);
    auth.content = preview("Learn how to authenticate with the API using JWT tokens...");

    let mut api = DocumentNode::folder("3", "API Reference", "/docs/api", vec![auth]).with_parent("1");
    api.metadata = metadata(2048, date(2024, 1, 20), "folder", &["api"], 23);

    let mut root = DocumentNode::folder("1", "Project Documentation", "/docs", vec![getting_started, api]);
    root.metadata = metadata(3072, date(2024, 1, 20), "folder", &["documentation"], 68);

    vec![root]
}
