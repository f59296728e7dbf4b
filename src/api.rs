use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post, put, MethodRouter},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    catalog::{DocumentText, SearchFilters, SearchQuery, SearchSort},
    context::{BreakdownUpdate, ContextExport, ContextState, ContextSummary, ExportFormat, TokenUsage},
    error::{panic_response, ApiError, ApiResponse, ApiResult},
    extract::{AppJson, AppPath, AppQuery},
    models::{DocumentNode, NodeType},
    session::Session,
    tokens,
    tree_index::find_duplicate_ids,
};

const DEFAULT_PAGE_SIZE: usize = 10;
const EXCERPT_LENGTH: usize = 120;

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    #[serde(rename = "type")]
    node_type: Option<NodeType>,
    /// Lista separada por comas.
    tags: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Deserialize)]
pub struct AdvancedSearchPayload {
    query: Option<String>,
    #[serde(default)]
    filters: SearchFilters,
    sort: Option<SearchSort>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Deserialize)]
pub struct SuggestionParams {
    q: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdsPayload {
    #[serde(default)]
    node_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusPayload {
    node_id: Option<String>,
}

#[derive(Deserialize)]
pub struct TokenLimitPayload {
    limit: u64,
}

#[derive(Deserialize)]
pub struct EstimatePayload {
    text: String,
}

#[derive(Deserialize)]
pub struct ExportParams {
    format: Option<ExportFormat>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    session_id: Uuid,
    created_at: DateTime<Utc>,
    node_count: usize,
    token_limit: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeView {
    roots: Vec<Arc<DocumentNode>>,
    node_count: usize,
    expanded_nodes: Vec<String>,
    selected_nodes: Vec<String>,
    focused_node: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    node: DocumentNode,
    ancestors: Vec<String>,
    /// Tamaño legible ("1 KB").
    size_label: Option<String>,
    excerpt: Option<String>,
    expanded: bool,
    selected: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextView {
    included_nodes: Vec<String>,
    pinned_nodes: Vec<String>,
    excluded_nodes: Vec<String>,
    token_usage: TokenUsage,
    summary: ContextSummary,
    within_limit: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenView {
    token_usage: TokenUsage,
    within_limit: bool,
    remaining: u64,
    usage_percentage: u8,
}

#[derive(Serialize)]
pub struct ExportView {
    format: ExportFormat,
    context: ContextExport,
}

/// Transiciones del gestor de contexto expuestas como rutas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextAction {
    Include,
    Exclude,
    Pin,
    Unpin,
    ToggleIncluded,
    TogglePinned,
    ToggleExcluded,
    RemoveExcluded,
}

impl ContextAction {
    fn apply(self, ctx: &mut ContextState, id: &str) {
        match self {
            Self::Include => ctx.include_node(id),
            Self::Exclude => ctx.exclude_node(id),
            Self::Pin => ctx.pin_node(id),
            Self::Unpin => ctx.unpin_node(id),
            Self::ToggleIncluded => ctx.toggle_included(id),
            Self::TogglePinned => ctx.toggle_pinned(id),
            Self::ToggleExcluded => ctx.toggle_excluded(id),
            Self::RemoveExcluded => ctx.remove_from_excluded(id),
        }
    }
}

/// Acciones de UI sobre el árbol de una sesión.
#[derive(Debug, Clone, Copy)]
enum TreeAction {
    Expand,
    Collapse,
    ToggleExpanded,
    ToggleSelected,
    Select,
    Deselect,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api", get(api_info_handler))
        .route("/api/documents", get(list_documents_handler))
        .route("/api/documents/:id", get(get_document_handler))
        .route("/api/documents/:id/content", post(document_content_handler))
        .route("/api/search", get(search_handler))
        .route("/api/search/advanced", post(advanced_search_handler))
        .route("/api/search/suggestions", get(suggestions_handler))
        .route("/api/tokens/estimate", post(estimate_tokens_handler))
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/:sid", delete(delete_session_handler))
        .route("/api/sessions/:sid/tree", get(get_tree_handler).put(set_tree_handler))
        .route("/api/sessions/:sid/tree/reload", post(reload_tree_handler))
        .route("/api/sessions/:sid/tree/expand", tree_action_route(TreeAction::Expand))
        .route("/api/sessions/:sid/tree/collapse", tree_action_route(TreeAction::Collapse))
        .route("/api/sessions/:sid/tree/toggle-expanded", tree_action_route(TreeAction::ToggleExpanded))
        .route("/api/sessions/:sid/tree/toggle-selected", tree_action_route(TreeAction::ToggleSelected))
        .route("/api/sessions/:sid/tree/select", tree_action_route(TreeAction::Select))
        .route("/api/sessions/:sid/tree/deselect", tree_action_route(TreeAction::Deselect))
        .route("/api/sessions/:sid/tree/expand-all", post(expand_all_handler))
        .route("/api/sessions/:sid/tree/collapse-all", post(collapse_all_handler))
        .route("/api/sessions/:sid/tree/deselect-all", post(deselect_all_handler))
        .route("/api/sessions/:sid/tree/focus", put(focus_handler))
        .route("/api/sessions/:sid/tree/selected", get(selected_documents_handler))
        .route("/api/sessions/:sid/tree/nodes/:id", get(tree_node_handler))
        .route("/api/sessions/:sid/tree/nodes/:id/children", get(expanded_children_handler))
        .route(
            "/api/sessions/:sid/context",
            get(get_context_handler).delete(clear_context_handler),
        )
        .route("/api/sessions/:sid/context/include", context_action_route(ContextAction::Include))
        .route("/api/sessions/:sid/context/exclude", context_action_route(ContextAction::Exclude))
        .route("/api/sessions/:sid/context/pin", context_action_route(ContextAction::Pin))
        .route("/api/sessions/:sid/context/unpin", context_action_route(ContextAction::Unpin))
        .route("/api/sessions/:sid/context/toggle-included", context_action_route(ContextAction::ToggleIncluded))
        .route("/api/sessions/:sid/context/toggle-pinned", context_action_route(ContextAction::TogglePinned))
        .route("/api/sessions/:sid/context/toggle-excluded", context_action_route(ContextAction::ToggleExcluded))
        .route("/api/sessions/:sid/context/remove-excluded", context_action_route(ContextAction::RemoveExcluded))
        .route("/api/sessions/:sid/context/tokens", patch(update_tokens_handler))
        .route("/api/sessions/:sid/context/tokens/limit", put(token_limit_handler))
        .route("/api/sessions/:sid/context/export", get(export_context_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

/// Router completo con health check, 404 JSON y las capas HTTP:
/// captura de pánicos, trazas, compresión gzip y CORS.
pub fn build_app(app_state: AppState) -> Result<Router> {
    let cors = cors_layer(&app_state.config.frontend_url)?;
    let expose_details = !app_state.config.is_production();

    Ok(Router::new()
        .route("/health", get(health_handler))
        .merge(create_router(app_state))
        .fallback(not_found_handler)
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn std::any::Any + Send + 'static>| panic_response(expose_details, panic),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors))
}

/// Con un origen concreto se permiten credenciales; con `*` no, porque
/// los navegadores rechazan esa combinación.
fn cors_layer(frontend_url: &str) -> Result<CorsLayer> {
    if frontend_url == "*" {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    let origin = HeaderValue::from_str(frontend_url)
        .map_err(|_| anyhow!("FRONTEND_URL no es un origen válido: {frontend_url}"))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]))
}

fn context_action_route(action: ContextAction) -> MethodRouter<AppState> {
    post(
        move |state: State<AppState>, sid: AppPath<Uuid>, payload: AppJson<NodeIdsPayload>| {
            context_action_handler(state, sid, payload, action)
        },
    )
}

fn tree_action_route(action: TreeAction) -> MethodRouter<AppState> {
    post(
        move |state: State<AppState>, sid: AppPath<Uuid>, payload: AppJson<NodeIdsPayload>| {
            tree_action_handler(state, sid, payload, action)
        },
    )
}

// --- Utilidades de sesión ---

fn read_session<R>(state: &AppState, sid: Uuid, f: impl FnOnce(&Session) -> R) -> Result<R, ApiError> {
    state
        .sessions
        .with_session(&sid, f)
        .ok_or(ApiError::SessionNotFound(sid))
}

fn write_session<R>(state: &AppState, sid: Uuid, f: impl FnOnce(&mut Session) -> R) -> Result<R, ApiError> {
    state
        .sessions
        .with_session_mut(&sid, f)
        .ok_or(ApiError::SessionNotFound(sid))
}

fn require_node_ids(payload: &NodeIdsPayload) -> Result<(), ApiError> {
    if payload.node_ids.is_empty() {
        return Err(ApiError::bad_request("MISSING_NODE_IDS", "Se requiere al menos un id en 'nodeIds'."));
    }
    Ok(())
}

fn sorted(ids: &HashSet<String>) -> Vec<String> {
    let mut ids: Vec<String> = ids.iter().cloned().collect();
    ids.sort();
    ids
}

fn tree_view(session: &Session) -> TreeView {
    let tree = &session.tree;
    TreeView {
        roots: tree.roots().to_vec(),
        node_count: tree.len(),
        expanded_nodes: sorted(tree.expanded_nodes()),
        selected_nodes: sorted(tree.selected_nodes()),
        focused_node: tree.focused_node().map(str::to_string),
    }
}

fn context_view(ctx: &ContextState) -> ContextView {
    ContextView {
        included_nodes: sorted(ctx.included_nodes()),
        pinned_nodes: sorted(ctx.pinned_nodes()),
        excluded_nodes: sorted(ctx.excluded_nodes()),
        token_usage: *ctx.token_usage(),
        summary: ctx.get_context_summary(),
        within_limit: ctx.is_within_token_limit(),
    }
}

fn token_view(ctx: &ContextState) -> TokenView {
    TokenView {
        token_usage: *ctx.token_usage(),
        within_limit: ctx.is_within_token_limit(),
        remaining: ctx.remaining_tokens(),
        usage_percentage: ctx.usage_percentage(),
    }
}

fn paginate(results: Vec<DocumentNode>, offset: usize, limit: usize) -> Vec<DocumentNode> {
    results.into_iter().skip(offset).take(limit).collect()
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

#[axum::debug_handler]
async fn not_found_handler() -> ApiError {
    ApiError::RouteNotFound
}

#[axum::debug_handler]
async fn api_info_handler(State(state): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::ok(json!({
        "message": "Knowledge Tree API is running",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "environment": state.config.environment.as_str(),
        "activeSessions": state.sessions.len(),
    })))
}

#[axum::debug_handler]
async fn list_documents_handler(State(state): State<AppState>) -> ApiResult<Vec<DocumentNode>> {
    Ok(Json(ApiResponse::ok(state.catalog.list_documents())))
}

#[axum::debug_handler]
async fn get_document_handler(
    State(state): State<AppState>,
    AppPath(id): AppPath<String>,
) -> ApiResult<DocumentNode> {
    let document = state
        .catalog
        .find_document(&id)
        .ok_or(ApiError::DocumentNotFound(id))?;
    Ok(Json(ApiResponse::ok(document)))
}

#[axum::debug_handler]
async fn document_content_handler(
    State(state): State<AppState>,
    AppPath(id): AppPath<String>,
) -> ApiResult<DocumentText> {
    let content = state
        .catalog
        .document_content(&id)
        .ok_or(ApiError::DocumentNotFound(id))?;
    Ok(Json(ApiResponse::ok(content)))
}

#[axum::debug_handler]
async fn search_handler(
    State(state): State<AppState>,
    AppQuery(params): AppQuery<SearchParams>,
) -> ApiResult<Vec<DocumentNode>> {
    let text = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("MISSING_QUERY", "Se requiere una consulta de búsqueda."))?;

    let filters = SearchFilters {
        node_type: params.node_type,
        tags: params
            .tags
            .map(|tags| {
                tags.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    };
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0);

    let query = SearchQuery {
        text: text.clone(),
        filters: filters.clone(),
        sort: None,
    };
    let results = state.catalog.search(&query);
    let total = results.len();
    debug!("Búsqueda '{}': {} resultados.", text, total);

    Ok(Json(ApiResponse::ok(paginate(results, offset, limit)).with_meta(json!({
        "total": total,
        "limit": limit,
        "offset": offset,
        "query": text,
        "filters": filters,
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}

#[axum::debug_handler]
async fn advanced_search_handler(
    State(state): State<AppState>,
    AppJson(payload): AppJson<AdvancedSearchPayload>,
) -> ApiResult<Vec<DocumentNode>> {
    let text = payload
        .query
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("MISSING_QUERY", "Se requiere una consulta de búsqueda."))?;
    let limit = payload.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = payload.offset.unwrap_or(0);

    let query = SearchQuery {
        text: text.clone(),
        filters: payload.filters.clone(),
        sort: payload.sort.clone(),
    };
    let results = state.catalog.search(&query);
    let total = results.len();

    Ok(Json(ApiResponse::ok(paginate(results, offset, limit)).with_meta(json!({
        "total": total,
        "limit": limit,
        "offset": offset,
        "query": text,
        "filters": payload.filters,
        "sort": payload.sort,
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}

#[axum::debug_handler]
async fn suggestions_handler(
    State(state): State<AppState>,
    AppQuery(params): AppQuery<SuggestionParams>,
) -> ApiResult<Vec<String>> {
    let partial = params.q.unwrap_or_default();
    let suggestions = state.catalog.suggestions(&partial);
    Ok(Json(ApiResponse::ok(suggestions).with_meta(json!({
        "query": partial,
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}

#[axum::debug_handler]
async fn estimate_tokens_handler(AppJson(payload): AppJson<EstimatePayload>) -> ApiResult<serde_json::Value> {
    let estimated = tokens::estimate_tokens(&payload.text);
    Ok(Json(ApiResponse::ok(json!({
        "tokens": estimated,
        "characters": payload.text.chars().count(),
    }))))
}

// --- Sesiones ---

#[axum::debug_handler]
async fn create_session_handler(State(state): State<AppState>) -> impl IntoResponse {
    let token_limit = state.config.default_token_limit;
    let sid = state
        .sessions
        .create(state.catalog.list_documents(), token_limit);
    let info = state.sessions.with_session(&sid, |s| SessionInfo {
        session_id: s.id,
        created_at: s.created_at,
        node_count: s.tree.len(),
        token_limit: s.context.token_usage().limit,
    });
    (StatusCode::CREATED, Json(ApiResponse::ok(info)))
}

#[axum::debug_handler]
async fn delete_session_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<serde_json::Value> {
    if !state.sessions.remove(&sid) {
        return Err(ApiError::SessionNotFound(sid));
    }
    Ok(Json(ApiResponse::ok(json!({ "message": "Sesión eliminada." }))))
}

// --- Árbol ---

#[axum::debug_handler]
async fn get_tree_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<TreeView> {
    let view = read_session(&state, sid, tree_view)?;
    Ok(Json(ApiResponse::ok(view)))
}

/// Sustituye la jerarquía de la sesión. Los ids duplicados se rechazan
/// aquí; el índice por sí solo se quedaría con el último.
#[axum::debug_handler]
async fn set_tree_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
    AppJson(nodes): AppJson<Vec<DocumentNode>>,
) -> ApiResult<TreeView> {
    let duplicates = find_duplicate_ids(&nodes);
    if !duplicates.is_empty() {
        return Err(ApiError::bad_request(
            "DUPLICATE_ID",
            format!("Ids duplicados en la jerarquía: {}", duplicates.join(", ")),
        ));
    }

    let view = write_session(&state, sid, |session| {
        session.tree.rebuild(nodes);
        tree_view(session)
    })?;
    info!("Sesión {sid}: árbol sustituido ({} nodos).", view.node_count);
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn reload_tree_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<TreeView> {
    let nodes = state.catalog.list_documents();
    let view = write_session(&state, sid, |session| {
        session.tree.rebuild(nodes);
        if session.tree.is_empty() {
            warn!("Sesión {sid}: el catálogo devolvió un árbol vacío.");
        }
        tree_view(session)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

async fn tree_action_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
    AppJson(payload): AppJson<NodeIdsPayload>,
    action: TreeAction,
) -> ApiResult<TreeView> {
    require_node_ids(&payload)?;
    let view = write_session(&state, sid, |session| {
        let tree = &mut session.tree;
        let ids = &payload.node_ids;
        match action {
            TreeAction::Expand => ids.iter().for_each(|id| tree.expand_node(id)),
            TreeAction::Collapse => ids.iter().for_each(|id| tree.collapse_node(id)),
            TreeAction::ToggleExpanded => ids.iter().for_each(|id| tree.toggle_expanded(id)),
            TreeAction::ToggleSelected => ids.iter().for_each(|id| tree.toggle_selected(id)),
            TreeAction::Select => tree.select_nodes(ids.iter().cloned()),
            TreeAction::Deselect => ids.iter().for_each(|id| tree.deselect_node(id)),
        }
        tree_view(session)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn expand_all_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<TreeView> {
    let view = write_session(&state, sid, |session| {
        session.tree.expand_all();
        tree_view(session)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn collapse_all_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<TreeView> {
    let view = write_session(&state, sid, |session| {
        session.tree.collapse_all();
        tree_view(session)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn deselect_all_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<TreeView> {
    let view = write_session(&state, sid, |session| {
        session.tree.deselect_all();
        tree_view(session)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn focus_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
    AppJson(payload): AppJson<FocusPayload>,
) -> ApiResult<TreeView> {
    let view = write_session(&state, sid, |session| {
        session.tree.set_focused_node(payload.node_id.as_deref());
        tree_view(session)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn selected_documents_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<Vec<DocumentNode>> {
    let docs = read_session(&state, sid, |session| {
        session
            .tree
            .get_selected_documents()
            .into_iter()
            .cloned()
            .collect::<Vec<_>>()
    })?;
    Ok(Json(ApiResponse::ok(docs)))
}

#[axum::debug_handler]
async fn tree_node_handler(
    State(state): State<AppState>,
    AppPath((sid, id)): AppPath<(Uuid, String)>,
) -> ApiResult<NodeView> {
    let view = read_session(&state, sid, |session| {
        let tree = &session.tree;
        tree.lookup(&id).map(|node| NodeView {
            node: node.clone(),
            ancestors: tree.node_path(&id),
            size_label: node.metadata.as_ref().map(|m| tokens::format_bytes(m.size)),
            excerpt: node.preview().map(|p| tokens::truncate_text(p, EXCERPT_LENGTH)),
            expanded: tree.is_expanded(&id),
            selected: tree.is_selected(&id),
        })
    })?
    .ok_or(ApiError::NodeNotFound(id))?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn expanded_children_handler(
    State(state): State<AppState>,
    AppPath((sid, id)): AppPath<(Uuid, String)>,
) -> ApiResult<Vec<Arc<DocumentNode>>> {
    let children = read_session(&state, sid, |session| session.tree.get_expanded_children(&id).to_vec())?;
    Ok(Json(ApiResponse::ok(children)))
}

// --- Contexto ---

#[axum::debug_handler]
async fn get_context_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<ContextView> {
    let view = read_session(&state, sid, |session| context_view(&session.context))?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn clear_context_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
) -> ApiResult<ContextView> {
    let view = write_session(&state, sid, |session| {
        session.context.clear_context();
        context_view(&session.context)
    })?;
    info!("Sesión {sid}: contexto vaciado.");
    Ok(Json(ApiResponse::ok(view)))
}

async fn context_action_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
    AppJson(payload): AppJson<NodeIdsPayload>,
    action: ContextAction,
) -> ApiResult<ContextView> {
    require_node_ids(&payload)?;
    let view = write_session(&state, sid, |session| {
        for id in &payload.node_ids {
            action.apply(&mut session.context, id);
        }
        context_view(&session.context)
    })?;
    debug!("Sesión {sid}: {:?} sobre {:?}.", action, payload.node_ids);
    Ok(Json(ApiResponse::ok(view).with_meta(json!({
        "action": action,
        "nodeIds": payload.node_ids,
    }))))
}

#[axum::debug_handler]
async fn update_tokens_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
    AppJson(update): AppJson<BreakdownUpdate>,
) -> ApiResult<TokenView> {
    let view = write_session(&state, sid, |session| {
        session.context.update_token_usage(update);
        token_view(&session.context)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn token_limit_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
    AppJson(payload): AppJson<TokenLimitPayload>,
) -> ApiResult<TokenView> {
    if payload.limit == 0 {
        return Err(ApiError::bad_request("INVALID_LIMIT", "El límite de tokens debe ser mayor que cero."));
    }
    let view = write_session(&state, sid, |session| {
        session.context.set_token_limit(payload.limit);
        token_view(&session.context)
    })?;
    Ok(Json(ApiResponse::ok(view)))
}

#[axum::debug_handler]
async fn export_context_handler(
    State(state): State<AppState>,
    AppPath(sid): AppPath<Uuid>,
    AppQuery(params): AppQuery<ExportParams>,
) -> ApiResult<ExportView> {
    let format = params.format.unwrap_or(ExportFormat::Json);
    let context = read_session(&state, sid, |session| session.context.export(&session.tree, format))?;
    Ok(Json(ApiResponse::ok(ExportView { format, context })))
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .ok()
        .and_then(|mut sender| sender.take());
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::MockCatalog, config::AppConfig};
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let state = AppState::new(AppConfig::default(), Arc::new(MockCatalog::default()), None);
        build_app(state).expect("app")
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body bytes");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn new_session(app: &Router) -> String {
        let (status, body) = call(app, "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["nodeCount"], 4);
        body["data"]["sessionId"].as_str().expect("session id").to_string()
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let app = test_app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, "GET", "/nada", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn service_info_and_token_estimate() {
        let app = test_app();
        let (status, body) = call(&app, "GET", "/api", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["environment"], "development");
        assert_eq!(body["data"]["activeSessions"], 0);

        let (_, body) = call(&app, "POST", "/api/tokens/estimate", Some(json!({"text": "hola mundo"}))).await;
        assert_eq!(body["data"]["tokens"], 3);
        assert_eq!(body["data"]["characters"], 10);
    }

    #[tokio::test]
    async fn documents_lookup_and_content() {
        let app = test_app();
        let (status, body) = call(&app, "GET", "/api/documents", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], "1");
        assert_eq!(body["data"][0]["children"][0]["parentId"], "1");

        let (status, body) = call(&app, "GET", "/api/documents/4", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "Authentication.md");

        let (status, body) = call(&app, "GET", "/api/documents/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, body) = call(&app, "POST", "/api/documents/2/content", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["embeddings"].as_array().map(Vec::len), Some(768));
    }

    #[tokio::test]
    async fn search_requires_query_and_paginates() {
        let app = test_app();
        for uri in ["/api/search", "/api/search?q=", "/api/search?q=%20"] {
            let (status, body) = call(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["error"]["code"], "MISSING_QUERY");
        }

        let (status, body) = call(&app, "GET", "/api/search?q=a&limit=1&offset=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 2);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

        let (_, body) = call(&app, "GET", "/api/search?q=a&tags=api", None).await;
        assert_eq!(body["data"][0]["id"], "4");

        let (status, body) = call(
            &app,
            "POST",
            "/api/search/advanced",
            Some(json!({"query": "a", "sort": {"sortBy": "name", "sortOrder": "asc"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], "4");
        assert_eq!(body["data"][1]["id"], "2");

        let (_, body) = call(&app, "GET", "/api/search/suggestions?q=api", None).await;
        assert_eq!(body["data"], json!(["API Reference"]));
    }

    #[tokio::test]
    async fn context_actions_follow_state_machine() {
        let app = test_app();
        let sid = new_session(&app).await;
        let base = format!("/api/sessions/{sid}/context");

        call(&app, "POST", &format!("{base}/include"), Some(json!({"nodeIds": ["2"]}))).await;
        let (status, body) =
            call(&app, "POST", &format!("{base}/toggle-pinned"), Some(json!({"nodeIds": ["2"]}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["includedNodes"], json!(["2"]));
        assert_eq!(body["data"]["pinnedNodes"], json!(["2"]));
        assert_eq!(body["data"]["summary"]["totalNodes"], 1);
        assert_eq!(body["meta"]["action"], "toggle-pinned");

        let (_, body) = call(&app, "POST", &format!("{base}/exclude"), Some(json!({"nodeIds": ["2"]}))).await;
        assert_eq!(body["data"]["includedNodes"], json!([]));
        assert_eq!(body["data"]["pinnedNodes"], json!([]));
        assert_eq!(body["data"]["excludedNodes"], json!(["2"]));

        let (status, body) = call(&app, "POST", &format!("{base}/pin"), Some(json!({"nodeIds": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "MISSING_NODE_IDS");

        let (_, body) = call(&app, "DELETE", &base, None).await;
        assert_eq!(body["data"]["excludedNodes"], json!([]));
        assert_eq!(body["data"]["tokenUsage"]["current"], 0);
    }

    #[tokio::test]
    async fn token_accounting_and_export() {
        let app = test_app();
        let sid = new_session(&app).await;
        let base = format!("/api/sessions/{sid}/context");

        call(&app, "PATCH", &format!("{base}/tokens"), Some(json!({"pinned": 100}))).await;
        let (_, body) = call(&app, "PATCH", &format!("{base}/tokens"), Some(json!({"selected": 50}))).await;
        assert_eq!(body["data"]["tokenUsage"]["current"], 150);
        assert_eq!(
            body["data"]["tokenUsage"]["breakdown"],
            json!({"pinned": 100, "selected": 50, "conversation": 0})
        );
        assert_eq!(body["data"]["withinLimit"], true);

        let (status, body) = call(&app, "PUT", &format!("{base}/tokens/limit"), Some(json!({"limit": 0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_LIMIT");

        let (_, body) = call(&app, "PUT", &format!("{base}/tokens/limit"), Some(json!({"limit": 100}))).await;
        assert_eq!(body["data"]["withinLimit"], false);

        call(&app, "POST", &format!("{base}/pin"), Some(json!({"nodeIds": ["4"]}))).await;
        call(&app, "POST", &format!("{base}/include"), Some(json!({"nodeIds": ["2", "fantasma"]}))).await;

        let (_, body) = call(&app, "GET", &format!("{base}/export?format=text"), None).await;
        assert_eq!(
            body["data"]["context"],
            "Authentication.md (/docs/api/auth.md)\nGetting Started.md (/docs/getting-started.md)"
        );

        let (_, body) = call(&app, "GET", &format!("{base}/export"), None).await;
        assert_eq!(body["data"]["format"], "json");
        assert_eq!(body["data"]["context"][0]["status"], "includedAndPinned");
        assert_eq!(body["data"]["context"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn tree_actions_and_replacement() {
        let app = test_app();
        let sid = new_session(&app).await;
        let base = format!("/api/sessions/{sid}/tree");

        let (_, body) = call(&app, "GET", &format!("{base}/nodes/1/children"), None).await;
        assert_eq!(body["data"], json!([]));

        call(&app, "POST", &format!("{base}/toggle-expanded"), Some(json!({"nodeIds": ["1"]}))).await;
        let (_, body) = call(&app, "GET", &format!("{base}/nodes/1/children"), None).await;
        assert_eq!(body["data"].as_array().map(Vec::len), Some(2));

        let (_, body) = call(&app, "GET", &format!("{base}/nodes/4"), None).await;
        assert_eq!(body["data"]["ancestors"], json!(["1", "3", "4"]));
        assert_eq!(body["data"]["sizeLabel"], "2 KB");

        call(&app, "POST", &format!("{base}/collapse"), Some(json!({"nodeIds": ["1"]}))).await;
        let (_, body) = call(&app, "GET", &base, None).await;
        assert_eq!(body["data"]["expandedNodes"], json!([]));

        call(&app, "POST", &format!("{base}/select"), Some(json!({"nodeIds": ["1", "2", "zz"]}))).await;
        let (_, body) = call(&app, "GET", &format!("{base}/selected"), None).await;
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["data"][0]["id"], "2");

        let replacement = json!([{"id": "b", "name": "B", "type": "document", "path": "/b"}]);
        let (status, body) = call(&app, "PUT", &base, Some(replacement)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["nodeCount"], 1);
        let (status, _) = call(&app, "GET", &format!("{base}/nodes/1"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let duplicated = json!([
            {"id": "x", "name": "X", "type": "document", "path": "/x"},
            {"id": "x", "name": "X2", "type": "document", "path": "/x2"}
        ]);
        let (status, body) = call(&app, "PUT", &base, Some(duplicated)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "DUPLICATE_ID");
    }

    #[tokio::test]
    async fn ancestors_come_from_children_hierarchy() {
        let app = test_app();
        let sid = new_session(&app).await;
        let base = format!("/api/sessions/{sid}/tree");

        let hierarchy = json!([{
            "id": "1", "name": "docs", "type": "folder", "path": "/docs",
            "children": [{"id": "2", "name": "guía", "type": "document", "path": "/docs/guia.md"}]
        }]);
        let (status, _) = call(&app, "PUT", &base, Some(hierarchy)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", &format!("{base}/nodes/2"), None).await;
        assert_eq!(body["data"]["ancestors"], json!(["1", "2"]));
    }

    #[tokio::test]
    async fn malformed_requests_use_the_error_envelope() {
        let app = test_app();
        let (status, body) = call(&app, "GET", "/api/sessions/no-es-uuid/context", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_PATH");

        let sid = new_session(&app).await;
        let uri = format!("/api/sessions/{sid}/context/include");
        let (status, body) = call(&app, "POST", &uri, Some(json!({"nodeIds": "2"}))).await;
        assert!(status.is_client_error());
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_BODY");

        let (status, body) = call(&app, "GET", &format!("/api/sessions/{sid}/context/export?format=pdf"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_QUERY");
    }

    #[tokio::test]
    async fn cors_allows_credentials_and_responses_are_compressed() {
        let app = test_app();
        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/api/documents")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(preflight).await.expect("response");
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "http://localhost:3000");
        assert_eq!(headers["access-control-allow-credentials"], "true");

        let request = Request::builder()
            .uri("/api/documents")
            .header("accept-encoding", "gzip")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-encoding"], "gzip");
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let app = test_app();
        let uri = format!("/api/sessions/{}/context", Uuid::new_v4());
        let (status, body) = call(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "SESSION_NOT_FOUND");

        let sid = new_session(&app).await;
        let (status, _) = call(&app, "DELETE", &format!("/api/sessions/{sid}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "DELETE", &format!("/api/sessions/{sid}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
