use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use modelops::{ModelMetadata, PredictError, PredictRequest, Prediction, Predictor};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AppConfig;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub predictor: Predictor,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub schema_version: String,
    pub features: Vec<String>,
}

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
}

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, error: impl ToString) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: error.to_string() }))
}

pub async fn get_health(State(st): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        schema_version: st.predictor.schema_version().to_string(),
        features: st.predictor.feature_columns().to_vec(),
    })
}

pub async fn get_model(State(st): State<SharedState>) -> Json<ModelMetadata> {
    Json(st.predictor.artifact().metadata.clone())
}

pub async fn post_predict(
    State(st): State<SharedState>,
    Json(req): Json<PredictRequest>,
) -> ApiResult<Prediction> {
    match st.predictor.predict(&req) {
        Ok(p) => {
            if !p.out_of_range.is_empty() {
                info!(columns=?p.out_of_range, "predict: values outside training range");
            }
            Ok(Json(p))
        }
        Err(e @ PredictError::SchemaMismatch(_)) => {
            warn!(error=%e, "predict: rejected");
            Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, e))
        }
        Err(e @ PredictError::InvalidInput(_)) => Err(api_error(StatusCode::BAD_REQUEST, e)),
        Err(e @ PredictError::Load(_)) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/model", get(get_model))
        .route("/predict", post(post_predict))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Loads the model under `MODEL_DIR` and serves it until the process stops.
pub async fn serve(cfg: &AppConfig) -> Result<()> {
    let predictor = Predictor::load(&cfg.model_dir)
        .with_context(|| format!("serve: loading model from {}", cfg.model_dir.display()))?;
    let app = router(Arc::new(AppState { predictor }));

    let addr = &cfg.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("serve: bind {addr}"))?;
    info!(addr=%addr, "serve: listening");
    axum::serve(listener, app).await.context("serve: server error")?;
    Ok(())
}
