use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use devproxy_protocol::ProblemDetails;

use crate::AppState;

pub(crate) mod events;
pub(crate) mod heal;
pub(crate) mod knowledge;
pub(crate) mod meta;
pub(crate) mod routes;

/// RFC 7807 body with the given status.
pub(crate) fn problem(status: StatusCode, title: &str, detail: impl Into<String>) -> Response {
    let body = ProblemDetails::new(status.as_u16(), title).with_detail(detail);
    (status, Json(body)).into_response()
}

pub(crate) fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ProblemDetails::new(401, "Unauthorized")),
    )
        .into_response()
}

/// Admin gate shared by every mutating or session-revealing handler.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if crate::admin_ok(headers, state.settings().admin_token.as_deref()) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}
