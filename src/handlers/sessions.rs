use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Snapshot of every live AudioHook session.
pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.registry.sessions();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions,
        "registry": state.registry.stats()
    }))
}
