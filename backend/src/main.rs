use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use plum_backend::batch::{BatchRunner, MemoryStore};
use plum_backend::classifier::ClassifierService;
use plum_backend::classifier::torch::TorchModelLoader;
use plum_backend::config::ServiceConfig;
use plum_backend::notify::BroadcastNotifier;
use plum_backend::registry::{JsonModelRegistry, ModelRegistry};
use plum_backend::routes::configure_routes;
use std::env;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

fn io_error(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, message)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv::dotenv().ok();

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = ServiceConfig::from_env().map_err(|e| io_error(e.to_string()))?;

    let registry: Arc<dyn ModelRegistry> = match &config.registry_path {
        Some(path) => Arc::new(JsonModelRegistry::open(path).map_err(|e| {
            io_error(format!("Failed to open model registry {}: {}", path.display(), e))
        })?),
        None => Arc::new(JsonModelRegistry::in_memory()),
    };

    let bind_address = config.bind_address();
    let classifier = Arc::new(ClassifierService::new(
        config,
        registry,
        Arc::new(TorchModelLoader::new()),
    ));

    // Serving starts even without a model; requests report it as unavailable.
    let preload = classifier.clone();
    let loaded = web::block(move || preload.lazy_load())
        .await
        .unwrap_or(false);
    if !loaded {
        log::warn!("No model preloaded at startup, classification will retry on first request");
    }

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(BroadcastNotifier::default());

    let mut notifications = notifier.subscribe();
    actix_web::rt::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    log::debug!("[{}] {}", notification.topic, notification.payload);
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Notification log lagged, skipped {} message(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let runner = Arc::new(BatchRunner::new(
        classifier.clone(),
        store.clone(),
        store.clone(),
        notifier,
    ));

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(web::Data::from(classifier.clone()))
            .app_data(web::Data::from(store.clone()))
            .app_data(web::Data::from(runner.clone()))
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
