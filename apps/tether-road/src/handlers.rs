use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use tether_proto::{Role, ServerControl};
use tracing::{info, warn};

use crate::auth::{AuthError, LoginState};
use crate::metrics;
use crate::registry::DeviceCounts;
use crate::websocket::SignalingState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    status: &'static str,
    timestamp: String,
    device_counts: DeviceCounts,
}

pub async fn health_check(State(state): State<SignalingState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        device_counts: state.device_counts(),
    })
}

pub async fn prometheus_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_prometheus(),
    )
        .into_response()
}

#[derive(Debug)]
pub struct AuthErrorResponse {
    status: StatusCode,
    message: String,
}

impl From<AuthError> for AuthErrorResponse {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::ProviderNotConfigured | AuthError::UnknownProvider(_) => {
                StatusCode::NOT_FOUND
            }
            AuthError::InvalidState => StatusCode::BAD_REQUEST,
            AuthError::Http(_) | AuthError::Provider(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AuthErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Html(page("Login failed", &self.message))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginQuery {
    device_id: String,
    role: Role,
}

pub async fn start_login(
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
    State(state): State<SignalingState>,
) -> Result<Redirect, AuthErrorResponse> {
    let provider = state.auth.provider(&provider)?;
    let login = LoginState {
        device_id: query.device_id,
        role: query.role,
    };
    let url = provider.authorize_url(&login)?;
    info!(device = %login.device_id, role = %login.role, "starting provider login");
    Ok(Redirect::to(url.as_str()))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub async fn login_callback(
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
    State(state): State<SignalingState>,
) -> Result<Html<String>, AuthErrorResponse> {
    if let Some(error) = query.error {
        return Err(AuthError::Provider(error).into());
    }
    let login = LoginState::decode(query.state.as_deref().ok_or(AuthError::InvalidState)?)?;
    let code = query.code.ok_or(AuthError::InvalidState)?;

    let provider = state.auth.provider(&provider)?;
    let user = provider.exchange(&code).await?;
    let token = state.auth.tokens.issue(&user)?;
    info!(device = %login.device_id, subject = %user.id, "provider login complete");

    let delivered = state.push_to_device(
        &login.device_id,
        ServerControl::Authenticated {
            token,
            user: user.clone(),
        }
        .into(),
    );
    if !delivered {
        warn!(device = %login.device_id, "login finished for a device that is not connected");
    }
    state.attach_identity(&login.device_id, &user.id);

    Ok(Html(page(
        "Login complete",
        "You are signed in. You can close this window and return to your terminal.",
    )))
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        escape(body)
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
