use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(serde_json::to_value(&config)?),
        "derived": {
            "window_threshold_bytes": config.audio.window_threshold_bytes()
        }
    })))
}

/// Apply a partial update. Only sessions created afterwards see the change.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(updated.clone())
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(serde_json::to_value(&updated)?)
    })))
}

/// API keys never leave the process.
fn redacted(mut config: serde_json::Value) -> serde_json::Value {
    if let Some(keys) = config.pointer_mut("/auth/api_keys") {
        let count = keys.as_array().map(Vec::len).unwrap_or(0);
        *keys = json!(format!("<{} configured>", count));
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    macro_rules! config_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/config", web::get().to(get_config))
                    .route("/config", web::put().to(update_config)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_update_and_read_back() {
        let state = AppState::from_config(AppConfig::default()).unwrap();
        let app = config_app!(state.clone());

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"audio": {"window_duration_ms": 2500}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().audio.window_duration_ms, 2500);

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["derived"]["window_threshold_bytes"], 20_000);
        assert_eq!(body["config"]["auth"]["api_keys"], "<0 configured>");
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = AppState::from_config(AppConfig::default()).unwrap();
        let app = config_app!(state.clone());

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"auth": {"enabled": true}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!state.get_config().auth.enabled);
    }
}
