//! Índice del árbol de documentos: búsqueda O(1) por id y estado de UI
//! (nodos expandidos, seleccionados y enfocado).
//!
//! El mapa `id -> nodo` es una caché derivada: se reconstruye entera con
//! cada jerarquía nueva y comparte los nodos (`Arc`) con la jerarquía, sin
//! copiar subárboles. Los conjuntos de UI pueden contener ids que ya no
//! existen; se filtran al leer.

use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::models::DocumentNode;

#[derive(Debug, Clone, Default)]
pub struct TreeIndex {
    roots: Vec<Arc<DocumentNode>>,
    nodes_by_id: HashMap<String, Arc<DocumentNode>>,
    /// Id del nodo cuyo `children` contiene a cada id no raíz.
    owners: HashMap<String, String>,
    expanded: HashSet<String>,
    selected: HashSet<String>,
    focused: Option<String>,
}

impl TreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_roots(roots: Vec<DocumentNode>) -> Self {
        let mut index = Self::new();
        index.rebuild(roots);
        index
    }

    /// Sustituye la jerarquía completa. Recorrido en pre-orden; ante ids
    /// duplicados gana el último visitado. El estado de UI se conserva.
    pub fn rebuild(&mut self, roots: Vec<DocumentNode>) {
        fn visit(
            nodes: &[Arc<DocumentNode>],
            owner: Option<&str>,
            by_id: &mut HashMap<String, Arc<DocumentNode>>,
            owners: &mut HashMap<String, String>,
        ) {
            for node in nodes {
                if let Some(previous) = by_id.insert(node.id.clone(), Arc::clone(node)) {
                    warn!(
                        "Id duplicado '{}' en el árbol: '{}' sustituye a '{}'.",
                        node.id, node.path, previous.path
                    );
                }
                match owner {
                    Some(owner) => owners.insert(node.id.clone(), owner.to_string()),
                    None => owners.remove(&node.id),
                };
                visit(node.children(), Some(&node.id), by_id, owners);
            }
        }

        self.roots = roots.into_iter().map(Arc::new).collect();
        self.nodes_by_id.clear();
        self.owners.clear();
        visit(&self.roots, None, &mut self.nodes_by_id, &mut self.owners);
        debug!("Índice reconstruido con {} nodos.", self.nodes_by_id.len());
    }

    pub fn roots(&self) -> &[Arc<DocumentNode>] {
        &self.roots
    }

    pub fn lookup(&self, id: &str) -> Option<&DocumentNode> {
        self.nodes_by_id.get(id).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.nodes_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_by_id.is_empty()
    }

    // --- Expansión ---

    pub fn is_expanded(&self, id: &str) -> bool {
        self.expanded.contains(id)
    }

    pub fn expanded_nodes(&self) -> &HashSet<String> {
        &self.expanded
    }

    pub fn expand_node(&mut self, id: &str) {
        self.expanded.insert(id.to_string());
    }

    pub fn collapse_node(&mut self, id: &str) {
        self.expanded.remove(id);
    }

    pub fn toggle_expanded(&mut self, id: &str) {
        toggle(&mut self.expanded, id);
    }

    /// Expande todos los nodos con al menos un hijo.
    pub fn expand_all(&mut self) {
        let ids = self
            .nodes_by_id
            .values()
            .filter(|node| node.has_children())
            .map(|node| node.id.clone());
        self.expanded.extend(ids);
    }

    pub fn collapse_all(&mut self) {
        self.expanded.clear();
    }

    // --- Selección ---

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.contains(id)
    }

    pub fn selected_nodes(&self) -> &HashSet<String> {
        &self.selected
    }

    pub fn select_node(&mut self, id: &str) {
        self.selected.insert(id.to_string());
    }

    pub fn select_nodes<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id: String = id.into();
            self.select_node(&id);
        }
    }

    pub fn deselect_node(&mut self, id: &str) {
        self.selected.remove(id);
    }

    pub fn deselect_all(&mut self) {
        self.selected.clear();
    }

    pub fn toggle_selected(&mut self, id: &str) {
        toggle(&mut self.selected, id);
    }

    // --- Foco ---

    pub fn set_focused_node(&mut self, id: Option<&str>) {
        self.focused = id.map(str::to_string);
    }

    pub fn focused_node(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    // --- Lecturas derivadas ---

    /// Documentos seleccionados que siguen existiendo; las carpetas y los
    /// ids obsoletos se descartan. Orden estable por id.
    pub fn get_selected_documents(&self) -> Vec<&DocumentNode> {
        let mut docs: Vec<&DocumentNode> = self
            .selected
            .iter()
            .filter_map(|id| self.lookup(id))
            .filter(|node| node.is_document())
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    /// Hijos del nodo sólo si existe, tiene hijos y está expandido.
    pub fn get_expanded_children(&self, id: &str) -> &[Arc<DocumentNode>] {
        match self.nodes_by_id.get(id) {
            Some(node) if self.expanded.contains(id) => node.children(),
            _ => &[],
        }
    }

    /// Cadena de ids desde la raíz hasta `id`, según qué nodo contiene a
    /// cuál en `children` (`parent_id` no se consulta). Vacía si el id no
    /// existe.
    pub fn node_path(&self, id: &str) -> Vec<String> {
        if !self.nodes_by_id.contains_key(id) {
            return Vec::new();
        }
        let mut path = vec![id.to_string()];
        let mut current = self.owners.get(id);
        while let Some(owner) = current {
            // Ids duplicados pueden encadenar dueños en ciclo.
            if path.contains(owner) {
                break;
            }
            path.push(owner.clone());
            current = self.owners.get(owner);
        }
        path.reverse();
        path
    }
}

fn toggle(set: &mut HashSet<String>, id: &str) {
    if !set.remove(id) {
        set.insert(id.to_string());
    }
}

/// Aplana el bosque en pre-orden.
pub fn flatten_tree<N: Borrow<DocumentNode>>(roots: &[N]) -> Vec<&DocumentNode> {
    fn traverse<'a>(node: &'a DocumentNode, out: &mut Vec<&'a DocumentNode>) {
        out.push(node);
        for child in node.children() {
            traverse(child, out);
        }
    }

    let mut out = Vec::new();
    for root in roots {
        let root: &DocumentNode = root.borrow();
        traverse(root, &mut out);
    }
    out
}

/// Búsqueda en profundidad sobre la jerarquía, sin índice.
pub fn find_node_by_id<'a, N: Borrow<DocumentNode>>(roots: &'a [N], id: &str) -> Option<&'a DocumentNode> {
    roots.iter().find_map(|root| {
        let node: &DocumentNode = root.borrow();
        if node.id == id {
            Some(node)
        } else {
            find_node_by_id(node.children(), id)
        }
    })
}

/// Ids que aparecen más de una vez, en orden de primera repetición.
pub fn find_duplicate_ids<N: Borrow<DocumentNode>>(roots: &[N]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for node in flatten_tree(roots) {
        if !seen.insert(node.id.as_str()) && !duplicates.contains(&node.id) {
            duplicates.push(node.id.clone());
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Vec<DocumentNode> {
        vec![DocumentNode::folder(
            "1",
            "Project Documentation",
            "/docs",
            vec![DocumentNode::document("2", "Getting Started.md", "/docs/getting-started.md").with_parent("1")],
        )]
    }

    #[test]
    fn lookup_and_expanded_children_follow_expansion() {
        let mut tree = TreeIndex::from_roots(sample_tree());

        assert_eq!(tree.lookup("2").map(|n| n.name.as_str()), Some("Getting Started.md"));
        assert!(tree.get_expanded_children("1").is_empty());

        tree.toggle_expanded("1");
        let children = tree.get_expanded_children("1");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "2");

        tree.collapse_all();
        assert!(tree.get_expanded_children("1").is_empty());
    }

    #[test]
    fn rebuild_replaces_previous_mapping() {
        let mut tree = TreeIndex::from_roots(vec![DocumentNode::document("a", "A", "/a")]);
        tree.rebuild(vec![DocumentNode::document("b", "B", "/b")]);

        assert!(tree.lookup("a").is_none());
        assert!(tree.lookup("b").is_some());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn duplicate_ids_keep_last_visited() {
        let roots = vec![
            DocumentNode::folder("1", "Raíz", "/", vec![DocumentNode::document("x", "primero", "/primero")]),
            DocumentNode::document("x", "segundo", "/segundo"),
        ];
        assert_eq!(find_duplicate_ids(&roots), vec!["x".to_string()]);

        let tree = TreeIndex::from_roots(roots);
        assert_eq!(tree.lookup("x").map(|n| n.name.as_str()), Some("segundo"));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn toggles_accept_unknown_ids() {
        let mut tree = TreeIndex::new();
        tree.toggle_selected("fantasma");
        tree.toggle_expanded("fantasma");
        assert!(tree.is_selected("fantasma"));
        assert!(tree.is_expanded("fantasma"));

        tree.toggle_selected("fantasma");
        assert!(!tree.is_selected("fantasma"));
        assert!(tree.get_expanded_children("fantasma").is_empty());
    }

    #[test]
    fn selected_documents_skip_folders_and_stale_ids() {
        let mut tree = TreeIndex::from_roots(sample_tree());
        tree.select_nodes(["1", "2", "borrado"]);

        let docs = tree.get_selected_documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "2");

        // La selección sobrevive a una recarga que elimina el nodo.
        tree.rebuild(vec![]);
        assert!(tree.is_selected("2"));
        assert!(tree.get_selected_documents().is_empty());
    }

    #[test]
    fn expand_all_only_marks_nodes_with_children() {
        let mut roots = sample_tree();
        roots.push(DocumentNode::folder("3", "Vacía", "/vacia", vec![]));
        let mut tree = TreeIndex::from_roots(roots);

        tree.expand_all();
        assert!(tree.is_expanded("1"));
        assert!(!tree.is_expanded("2"));
        assert!(!tree.is_expanded("3"));
    }

    #[test]
    fn node_path_walks_parent_references() {
        let roots = vec![DocumentNode::folder(
            "1",
            "docs",
            "/docs",
            vec![DocumentNode::folder(
                "3",
                "api",
                "/docs/api",
                vec![DocumentNode::document("4", "auth", "/docs/api/auth.md").with_parent("3")],
            )
            .with_parent("1")],
        )];
        let tree = TreeIndex::from_roots(roots);

        assert_eq!(tree.node_path("4"), vec!["1", "3", "4"]);
        assert!(tree.node_path("nada").is_empty());
    }

    #[test]
    fn node_path_ignores_missing_parent_references() {
        // Jerarquía válida sin `parentId` en ningún nodo.
        let roots = vec![DocumentNode::folder(
            "1",
            "docs",
            "/docs",
            vec![DocumentNode::folder("3", "api", "/docs/api", vec![DocumentNode::document("4", "auth", "/auth.md")])],
        )];
        let mut tree = TreeIndex::from_roots(roots);

        assert_eq!(tree.node_path("4"), vec!["1", "3", "4"]);
        assert_eq!(tree.node_path("1"), vec!["1"]);

        // Un `parentId` incorrecto tampoco altera la cadena.
        tree.rebuild(vec![DocumentNode::folder(
            "1",
            "docs",
            "/docs",
            vec![DocumentNode::document("2", "guía", "/guia.md").with_parent("9")],
        )]);
        assert_eq!(tree.node_path("2"), vec!["1", "2"]);
        assert!(tree.node_path("4").is_empty());
    }

    #[test]
    fn index_shares_nodes_with_hierarchy() {
        let tree = TreeIndex::from_roots(sample_tree());
        let child = &tree.roots()[0].children()[0];
        let indexed = tree.lookup("2").unwrap();
        assert!(std::ptr::eq(&**child, indexed));
    }

    #[test]
    fn focus_and_find_helpers() {
        let roots = sample_tree();
        assert_eq!(flatten_tree(&roots).iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), ["1", "2"]);
        assert!(find_node_by_id(&roots, "2").is_some());
        assert!(find_node_by_id(&roots, "9").is_none());

        let mut tree = TreeIndex::from_roots(roots);
        tree.set_focused_node(Some("2"));
        assert_eq!(tree.focused_node(), Some("2"));
        tree.set_focused_node(None);
        assert_eq!(tree.focused_node(), None);
    }
}
