//! Errores de la API y sobre común `{success, data, error, meta}`.

use std::any::Any;

use axum::{
    body::Body,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Sobre de todas las respuestas JSON.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl ApiResponse<()> {
    pub fn failure(code: &'static str, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
                details,
            }),
            meta: None,
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Documento no encontrado: {0}")]
    DocumentNotFound(String),
    #[error("Nodo no encontrado en el árbol de la sesión: {0}")]
    NodeNotFound(String),
    #[error("Sesión no encontrada: {0}")]
    SessionNotFound(Uuid),
    #[error("Ruta no encontrada")]
    RouteNotFound,
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },
    /// Petición que axum no pudo extraer (ruta, query o cuerpo mal formados).
    #[error("{message}")]
    Rejected {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::DocumentNotFound(_)
            | Self::NodeNotFound(_)
            | Self::SessionNotFound(_)
            | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Rejected { status, .. } => *status,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::DocumentNotFound(_) | Self::NodeNotFound(_) | Self::RouteNotFound => "NOT_FOUND",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::BadRequest { code, .. } | Self::Rejected { code, .. } => *code,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            code: "INVALID_BODY",
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            code: "INVALID_PATH",
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            code: "INVALID_QUERY",
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::failure(self.code(), self.to_string(), None);
        (self.status(), Json(body)).into_response()
    }
}

/// Convierte un pánico de un handler en un 500 con el sobre estándar. El
/// mensaje del pánico sólo se expone fuera de producción.
pub fn panic_response(expose_details: bool, panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "pánico sin mensaje".to_string());
    error!("Pánico atendiendo una petición: {}", message);

    let body = ApiResponse::failure(
        "INTERNAL_ERROR",
        "Error interno del servidor",
        expose_details.then_some(message),
    );
    let body = serde_json::to_vec(&body).unwrap_or_else(|_| {
        json!({"success": false, "error": {"code": "INTERNAL_ERROR"}})
            .to_string()
            .into_bytes()
    });

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
