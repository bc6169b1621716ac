use anyhow::Result;
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

mod config;
mod error;
mod logging;
mod routes;
mod services;
pub mod models;

use services::{cases::CaseStore, rules::RuleStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    logging::init_logging()?;

    // Load configuration
    let config = config::load_config()?;
    tracing::info!(
        "Cases in {}, rules in {}, worksheet \"{}\"",
        config.upload_dir.display(),
        config.rule_dir.display(),
        config.worksheet_name
    );

    // Build our application state
    let addr = config.bind_addr;
    let max_file_size = config.max_file_size;
    let state = Arc::new(AppState::new(config));

    // Build our application with a route
    let app = Router::new()
        .merge(routes::routes())
        .layer(DefaultBodyLimit::max(max_file_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Run it
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// Application state
pub struct AppState {
    config: config::Config,
    cases: CaseStore,
    rules: RuleStore,
}

impl AppState {
    fn new(config: config::Config) -> Self {
        let cases = CaseStore::new(config.upload_dir.clone(), config.worksheet_name.clone());
        let rules = RuleStore::new(config.rule_dir.clone());
        Self { config, cases, rules }
    }

    pub fn config(&self) -> &config::Config {
        &self.config
    }
}
