//! Tuner host routes.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use super::{ApiError, AppContext};
use crate::tuners::{ChannelInfo, TunerHostSummary};

pub fn tuner_routes() -> Router<AppContext> {
    Router::new()
        .route("/tuners", get(list_tuners))
        .route("/tuners/:tuner_id/lineup", get(get_lineup))
}

async fn list_tuners(State(ctx): State<AppContext>) -> Json<Vec<TunerHostSummary>> {
    Json(ctx.tuners.summaries())
}

async fn get_lineup(
    State(ctx): State<AppContext>,
    Path(tuner_id): Path<String>,
) -> Result<Json<Vec<ChannelInfo>>, ApiError> {
    Ok(Json(ctx.tuners.lineup(&tuner_id).await?))
}
