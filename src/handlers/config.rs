use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

// The backend API key never appears in any response body.

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "backend": {
                "url": config.backend.url,
                "model": config.backend.model,
                "system_instruction": config.backend.system_instruction,
                "connect_timeout_secs": config.backend.connect_timeout_secs
            },
            "audio": {
                "input_sample_rate": config.audio.input_sample_rate,
                "output_sample_rate": config.audio.output_sample_rate,
                "channels": config.audio.channels,
                "bit_depth": config.audio.bit_depth
            },
            "performance": {
                "max_concurrent_sessions": config.performance.max_concurrent_sessions
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state.update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": {
            "server": {
                "host": current_config.server.host,
                "port": current_config.server.port
            },
            "backend": {
                "url": current_config.backend.url,
                "model": current_config.backend.model,
                "system_instruction": current_config.backend.system_instruction,
                "connect_timeout_secs": current_config.backend.connect_timeout_secs
            },
            "audio": {
                "input_sample_rate": current_config.audio.input_sample_rate,
                "output_sample_rate": current_config.audio.output_sample_rate,
                "channels": current_config.audio.channels,
                "bit_depth": current_config.audio.bit_depth
            },
            "performance": {
                "max_concurrent_sessions": current_config.performance.max_concurrent_sessions
            }
        }
    })))
}
