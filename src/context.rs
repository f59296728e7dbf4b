//! Gestor de contexto para el LLM: clasifica ids de nodos en incluidos,
//! fijados (pinned) y excluidos, y lleva la cuenta de tokens.
//!
//! Reglas:
//!   - `pinned ⊆ included`.
//!   - `included ∩ excluded = ∅` (y por tanto también `pinned ∩ excluded`).
//!   - `token_usage.current` es siempre la suma del desglose.
//!
//! Ninguna operación falla ni comprueba que el id exista en el árbol: la
//! selección debe sobrevivir a una recarga de la jerarquía.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::{tokens, tree_index::TreeIndex};

pub const DEFAULT_TOKEN_LIMIT: u64 = 8000;

/// Estado lógico de un id dentro del contexto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    Untouched,
    Included,
    IncludedAndPinned,
    Excluded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub pinned: u64,
    pub selected: u64,
    pub conversation: u64,
}

impl TokenBreakdown {
    pub fn total(&self) -> u64 {
        self.pinned
            .saturating_add(self.selected)
            .saturating_add(self.conversation)
    }
}

/// Actualización parcial del desglose; los campos ausentes no cambian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BreakdownUpdate {
    pub pinned: Option<u64>,
    pub selected: Option<u64>,
    pub conversation: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub current: u64,
    pub limit: u64,
    pub breakdown: TokenBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub total_nodes: usize,
    pub pinned_count: usize,
    pub included_count: usize,
    pub excluded_count: usize,
    pub token_usage: u64,
    pub token_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Text,
}

/// Elemento exportado para el ensamblador de prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    pub id: String,
    pub name: String,
    pub path: String,
    pub status: NodeStatus,
    pub token_usage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ContextExport {
    Items(Vec<ContextItem>),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ContextState {
    included: HashSet<String>,
    pinned: HashSet<String>,
    excluded: HashSet<String>,
    token_usage: TokenUsage,
}

impl Default for ContextState {
    fn default() -> Self {
        Self::with_token_limit(DEFAULT_TOKEN_LIMIT)
    }
}

impl ContextState {
    pub fn with_token_limit(limit: u64) -> Self {
        Self {
            included: HashSet::new(),
            pinned: HashSet::new(),
            excluded: HashSet::new(),
            token_usage: TokenUsage {
                current: 0,
                limit,
                breakdown: TokenBreakdown::default(),
            },
        }
    }

    pub fn included_nodes(&self) -> &HashSet<String> {
        &self.included
    }

    pub fn pinned_nodes(&self) -> &HashSet<String> {
        &self.pinned
    }

    pub fn excluded_nodes(&self) -> &HashSet<String> {
        &self.excluded
    }

    pub fn token_usage(&self) -> &TokenUsage {
        &self.token_usage
    }

    pub fn status(&self, id: &str) -> NodeStatus {
        if self.excluded.contains(id) {
            NodeStatus::Excluded
        } else if self.pinned.contains(id) {
            NodeStatus::IncludedAndPinned
        } else if self.included.contains(id) {
            NodeStatus::Included
        } else {
            NodeStatus::Untouched
        }
    }

    // --- Inclusión ---

    pub fn include_node(&mut self, id: &str) {
        self.included.insert(id.to_string());
        self.excluded.remove(id);
    }

    /// Si ya estaba incluido, lo saca del contexto (también del pin, para
    /// no dejar un nodo fijado fuera de los incluidos).
    pub fn toggle_included(&mut self, id: &str) {
        if self.included.remove(id) {
            self.pinned.remove(id);
        } else {
            self.include_node(id);
        }
    }

    // --- Exclusión ---

    pub fn exclude_node(&mut self, id: &str) {
        self.excluded.insert(id.to_string());
        self.included.remove(id);
        self.pinned.remove(id);
    }

    pub fn toggle_excluded(&mut self, id: &str) {
        if !self.excluded.remove(id) {
            self.exclude_node(id);
        }
    }

    pub fn remove_from_excluded(&mut self, id: &str) {
        self.excluded.remove(id);
    }

    // --- Pin ---

    pub fn pin_node(&mut self, id: &str) {
        self.pinned.insert(id.to_string());
        self.include_node(id);
    }

    pub fn unpin_node(&mut self, id: &str) {
        self.pinned.remove(id);
    }

    pub fn toggle_pinned(&mut self, id: &str) {
        if !self.pinned.remove(id) {
            self.pin_node(id);
        }
    }

    /// Vacía los tres conjuntos y pone a cero el desglose. El límite se
    /// mantiene.
    pub fn clear_context(&mut self) {
        self.included.clear();
        self.pinned.clear();
        self.excluded.clear();
        self.token_usage.breakdown = TokenBreakdown::default();
        self.token_usage.current = 0;
    }

    // --- Tokens ---

    pub fn set_token_limit(&mut self, limit: u64) {
        self.token_usage.limit = limit;
    }

    pub fn update_token_usage(&mut self, update: BreakdownUpdate) {
        let breakdown = &mut self.token_usage.breakdown;
        if let Some(pinned) = update.pinned {
            breakdown.pinned = pinned;
        }
        if let Some(selected) = update.selected {
            breakdown.selected = selected;
        }
        if let Some(conversation) = update.conversation {
            breakdown.conversation = conversation;
        }
        self.token_usage.current = breakdown.total();
    }

    pub fn is_within_token_limit(&self) -> bool {
        self.token_usage.current <= self.token_usage.limit
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.token_usage.limit.saturating_sub(self.token_usage.current)
    }

    /// Porcentaje de uso del límite (0-100, saturado).
    pub fn usage_percentage(&self) -> u8 {
        if self.token_usage.limit == 0 {
            return 100;
        }
        (self.token_usage.current.saturating_mul(100) / self.token_usage.limit).min(100) as u8
    }

    // --- Lecturas derivadas ---

    /// Ids en el contexto (incluidos ∪ fijados), ordenados.
    pub fn get_context_nodes(&self) -> BTreeSet<&str> {
        self.included
            .iter()
            .chain(self.pinned.iter())
            .map(String::as_str)
            .collect()
    }

    /// `total_nodes` cuenta ids distintos: un nodo fijado cuenta una vez.
    pub fn get_context_summary(&self) -> ContextSummary {
        ContextSummary {
            total_nodes: self.get_context_nodes().len(),
            pinned_count: self.pinned.len(),
            included_count: self.included.len(),
            excluded_count: self.excluded.len(),
            token_usage: self.token_usage.current,
            token_limit: self.token_usage.limit,
        }
    }

    /// Elementos del contexto que todavía existen en el árbol: primero los
    /// fijados y luego los incluidos, cada grupo ordenado por id.
    pub fn context_items(&self, tree: &TreeIndex) -> Vec<ContextItem> {
        let mut items: Vec<ContextItem> = self
            .get_context_nodes()
            .into_iter()
            .filter_map(|id| {
                let node = tree.lookup(id)?;
                let token_usage = node
                    .content
                    .as_ref()
                    .and_then(|c| c.best_text())
                    .map(tokens::estimate_tokens)
                    .unwrap_or(0);
                Some(ContextItem {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    path: node.path.clone(),
                    status: self.status(id),
                    token_usage,
                })
            })
            .collect();
        items.sort_by_key(|item| (item.status != NodeStatus::IncludedAndPinned, item.id.clone()));
        items
    }

    pub fn export(&self, tree: &TreeIndex, format: ExportFormat) -> ContextExport {
        let items = self.context_items(tree);
        match format {
            ExportFormat::Json => ContextExport::Items(items),
            ExportFormat::Text => ContextExport::Text(
                items
                    .iter()
                    .map(|item| format!("{} ({})", item.name, item.path))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
        }
    }
}
