//! Modelos de dominio (nodos del árbol de documentos y su metadata).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tipo de nodo dentro del árbol: carpeta o documento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Folder,
    Document,
}

/// Metadatos de un nodo (tamaño, fechas, etiquetas, uso).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default)]
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub document_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

/// Contenido opcional: vista previa, texto completo y embeddings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<f32>>,
}

impl NodeContent {
    /// El texto más completo disponible: `full`, luego `fullText`, luego `preview`.
    pub fn best_text(&self) -> Option<&str> {
        self.full
            .as_deref()
            .or(self.full_text.as_deref())
            .or(self.preview.as_deref())
    }
}

/// Nodo del árbol de conocimiento. Las carpetas son dueñas de sus hijos;
/// `parent_id` es sólo una referencia para búsquedas. Los hijos van en `Arc`
/// para que el índice del árbol los comparta sin copiar subárboles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Arc<DocumentNode>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<NodeContent>,
}

impl DocumentNode {
    pub fn folder(id: &str, name: &str, path: &str, children: Vec<DocumentNode>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            node_type: NodeType::Folder,
            path: path.to_string(),
            parent_id: None,
            children: Some(children.into_iter().map(Arc::new).collect()),
            metadata: None,
            content: None,
        }
    }

    pub fn document(id: &str, name: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            node_type: NodeType::Document,
            path: path.to_string(),
            parent_id: None,
            children: None,
            metadata: None,
            content: None,
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn is_document(&self) -> bool {
        self.node_type == NodeType::Document
    }

    /// `true` si el nodo tiene al menos un hijo.
    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn children(&self) -> &[Arc<DocumentNode>] {
        self.children.as_deref().unwrap_or(&[])
    }

    pub fn tags(&self) -> &[String] {
        self.metadata.as_ref().map(|m| m.tags.as_slice()).unwrap_or(&[])
    }

    pub fn preview(&self) -> Option<&str> {
        self.content.as_ref().and_then(|c| c.preview.as_deref())
    }
}
