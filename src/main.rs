// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod context;
mod github;
mod indexer;
mod llm;
mod models;
mod session;

use crate::app_state::{AppState, IndexingStatus};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración (la ausencia de credenciales LLM falla aquí,
    //    en el arranque, no en la primera pregunta)
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");
    info!("Proveedor LLM activo: {:?}", cfg.llm_provider().unwrap());

    // 3. Inicializar los clientes de GitHub y de completions
    let github = github::GithubClient::from_config(&cfg);
    let completions = llm::CompletionManager::from_config(&cfg)
        .expect("Error inicializando el gestor de completions");

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 4. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        github,
        completions,
        status: Arc::new(Mutex::new(IndexingStatus::default())),
        session: Arc::new(Mutex::new(None)),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 5. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 6. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if webbrowser::open(&server_url).is_err() {
        info!(
            "No se pudo abrir el navegador. Por favor, accede a {} manualmente.",
            server_url
        );
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("El servidor ha terminado con error");

    info!("✅ Servidor cerrado correctamente.");
}
