// Módulos de la aplicación
mod api;
mod app_state;
mod catalog;
mod config;
mod context;
mod error;
mod extract;
mod models;
mod session;
mod tokens;
mod tree_index;

use crate::{app_state::AppState, catalog::MockCatalog};
use anyhow::Result;
use std::{sync::Arc, time::Instant};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env()?;
    info!(
        "Entorno '{}', límite de tokens por defecto {}.",
        cfg.environment.as_str(),
        cfg.default_token_limit
    );

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 3. Crear estado compartido: catálogo de documentos y registro de sesiones
    let catalog = Arc::new(MockCatalog::default());
    let app_state = AppState::new(cfg.clone(), catalog, Some(shutdown_tx));

    // Tarea de limpieza: descarta las sesiones inactivas.
    tokio::spawn({
        let sessions = app_state.sessions.clone();
        let ttl = cfg.session_ttl;
        let mut ticker = tokio::time::interval(cfg.session_sweep_interval);
        async move {
            loop {
                ticker.tick().await;
                let evicted = sessions.evict_idle(Instant::now(), ttl);
                if evicted > 0 {
                    info!("🧹 {} sesiones inactivas eliminadas.", evicted);
                }
            }
        }
    });

    // 4. Configurar el router de la API con sus capas HTTP
    let app = api::build_app(app_state)?;

    // 5. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr).await?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);
    info!("📊 Health check: http://{}/health", cfg.server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
