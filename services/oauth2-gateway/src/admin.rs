//! Admin API for driving authentications
//!
//! Lets operators and sibling services trigger the same flow a chat
//! feature would, without a chat bridge in the loop.
//!
//! Endpoints:
//! - `POST /authenticate`: authenticate a user at a provider
//! - `DELETE /credentials/{provider}/{user_id}`: forget a stored credential
//! - `GET /providers`: registered providers and their URLs

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::routing::{delete, get, post};
use oauth2_flow::{Completion, Error, FlowRegistry};
use serde::Deserialize;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{info, warn};

use crate::metrics::record_admin_request;

type JsonResponse = (StatusCode, [(axum::http::HeaderName, &'static str); 1], String);

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    registry: Arc<FlowRegistry>,
}

impl AdminState {
    pub fn new(registry: Arc<FlowRegistry>) -> Self {
        Self { registry }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/authenticate", post(authenticate))
        .route("/credentials/{provider}/{user_id}", delete(delete_credential))
        .route("/providers", get(list_providers))
        .with_state(state)
}

fn respond(route: &'static str, status: StatusCode, body: serde_json::Value) -> JsonResponse {
    record_admin_request(route, status.as_u16());
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::UnregisteredProvider(_) => StatusCode::NOT_FOUND,
        Error::Delivery(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
struct AuthenticateRequest {
    provider: String,
    user_id: String,
}

/// POST /authenticate: obtain a client for `user_id` at `provider`.
///
/// A cached credential answers `authenticated` right away. Otherwise the
/// login prompt has been sent and the answer is `pending`; the eventual
/// outcome is logged when the user completes (or abandons) the login.
async fn authenticate(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AuthenticateRequest>,
) -> JsonResponse {
    const ROUTE: &str = "/authenticate";

    let (completion, mut rx) = Completion::channel();
    state
        .registry
        .authenticate(&body.provider, &body.user_id, completion)
        .await;

    match rx.try_recv() {
        Ok(Ok(client)) => {
            let credential = client.credential();
            respond(
                ROUTE,
                StatusCode::OK,
                serde_json::json!({
                    "status": "authenticated",
                    "provider": body.provider,
                    "user_id": body.user_id,
                    "token_type": credential.token_type,
                    "expires": credential.expires,
                }),
            )
        }
        Ok(Err(e)) => {
            warn!(
                provider = %body.provider,
                user_id = %body.user_id,
                error = %e,
                "authentication failed"
            );
            respond(
                ROUTE,
                error_status(&e),
                serde_json::json!({
                    "status": "error",
                    "error": e.to_string(),
                }),
            )
        }
        Err(TryRecvError::Empty) => {
            let provider = body.provider.clone();
            let user_id = body.user_id.clone();
            tokio::spawn(async move {
                match rx.await {
                    Ok(Ok(_)) => {
                        info!(provider = %provider, user_id = %user_id, "pending authentication completed")
                    }
                    Ok(Err(e)) => {
                        warn!(provider = %provider, user_id = %user_id, error = %e, "pending authentication failed")
                    }
                    Err(_) => {
                        warn!(provider = %provider, user_id = %user_id, "pending authentication dropped")
                    }
                }
            });
            respond(
                ROUTE,
                StatusCode::ACCEPTED,
                serde_json::json!({
                    "status": "pending",
                    "provider": body.provider,
                    "user_id": body.user_id,
                }),
            )
        }
        Err(TryRecvError::Closed) => respond(
            ROUTE,
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "status": "error",
                "error": "completion dropped without a result",
            }),
        ),
    }
}

/// DELETE /credentials/{provider}/{user_id}: remove a stored credential.
///
/// The next authentication for this user sends a fresh login prompt.
async fn delete_credential(
    State(state): State<AdminState>,
    Path((provider, user_id)): Path<(String, String)>,
) -> JsonResponse {
    const ROUTE: &str = "/credentials/{provider}/{user_id}";

    match state.registry.logout(&provider, &user_id).await {
        Ok(()) => {
            info!(provider = %provider, user_id = %user_id, "credential removed");
            respond(
                ROUTE,
                StatusCode::OK,
                serde_json::json!({
                    "provider": provider,
                    "user_id": user_id,
                    "status": "removed",
                }),
            )
        }
        Err(e) => {
            warn!(provider = %provider, user_id = %user_id, error = %e, "credential removal failed");
            respond(
                ROUTE,
                error_status(&e),
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// GET /providers: registered providers with their login and redirect URLs.
async fn list_providers(State(state): State<AdminState>) -> JsonResponse {
    let providers: Vec<serde_json::Value> = state
        .registry
        .providers()
        .iter()
        .filter_map(|name| state.registry.flow(name))
        .map(|flow| {
            serde_json::json!({
                "name": flow.name(),
                "login_url": flow.config().login_url(),
                "redirect_uri": flow.config().auth_url(),
                "pending": flow.pending().len(),
            })
        })
        .collect();

    respond(
        "/providers",
        StatusCode::OK,
        serde_json::json!({ "providers": providers }),
    )
}
