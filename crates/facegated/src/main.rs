use anyhow::{Context, Result};
use facegate_core::{
    ArcFaceLoader, EmbeddingExtractor, FaceLocator, HttpFetcher, InferenceResource, SsdDetector,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod identity;
mod store;

use config::Config;
use dbus_interface::{FacegateService, BUS_NAME, OBJECT_PATH};
use engine::Authenticator;
use store::SqliteIdentityStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        "facegated starting"
    );

    let store = SqliteIdentityStore::open(&config.db_path).context("opening identity store")?;

    // The detector loads eagerly (fail fast); the embedding model is fetched
    // and loaded on first use.
    let detector =
        SsdDetector::load(&config.detector_model_path()).context("loading face detector")?;

    let pipeline = config.pipeline();
    let resource = Arc::new(InferenceResource::new(
        config.embedder_artifact(),
        Box::new(HttpFetcher::new(config.embedder_sha256.clone())),
        Box::new(ArcFaceLoader),
    ));

    let auth = Arc::new(Authenticator::new(
        FaceLocator::new(Box::new(detector), pipeline.confidence_floor),
        EmbeddingExtractor::new(resource),
        Arc::new(store),
        pipeline,
    ));

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacegateService::new(auth))?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        threshold = pipeline.similarity_threshold,
        max_samples = pipeline.max_samples,
        "facegated ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
