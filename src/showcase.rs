//! Read-only HTTP view over the stored providers.
//!
//! `GET /providers` returns every provider with its zone, source and
//! pictures as JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::schema::ShowcaseProvider;
use crate::store::ProviderStore;

#[derive(Clone)]
pub struct ShowcaseState {
    store: Arc<dyn ProviderStore>,
}

pub fn router(store: Arc<dyn ProviderStore>) -> Router {
    Router::new()
        .route("/providers", get(list_providers))
        .with_state(ShowcaseState { store })
}

pub async fn list_providers(
    State(state): State<ShowcaseState>,
) -> Result<Json<Vec<ShowcaseProvider>>, (StatusCode, String)> {
    state.store.list_providers().await.map(Json).map_err(|e| {
        log::error!("Listing providers failed: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, "store unavailable".to_string())
    })
}

pub async fn serve(store: Arc<dyn ProviderStore>, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("Showcase listening on {}", listener.local_addr()?);
    axum::serve(listener, router(store)).await?;
    Ok(())
}
