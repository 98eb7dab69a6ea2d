mod config;
mod db;
mod event;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use crate::store::{MemStore, PgStore, Store};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let port: u16 = config::env_parse("PORT", 3000);

    // Resolve the backing store (non-fatal: demo data in memory if DATABASE_URL missing).
    let store: Arc<dyn Store> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = db::init_pool(&database_url)
                .await
                .expect("database init failed");
            tracing::info!("postgres store initialized");
            Arc::new(PgStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set — using in-memory store with demo data");
            Arc::new(MemStore::with_demo_data().await)
        }
    };

    let state = state::AppState::new(store);

    // Spawn background room sweeper.
    let _sweeper = services::hub::spawn_room_sweeper(state.hub.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "chatrelay listening");
    axum::serve(listener, app).await.expect("server failed");
}
