// REST edit fallback.
//
// Clients without a live WebSocket session (or recovering from a
// dropped one) submit the same edit payload over plain HTTP. The edit
// takes the identical path as a live edit: merge into the pending
// buffer, arm the flush, broadcast the delta. The response carries an
// optimistic view of the document with everything still pending
// applied, so the fallback client sees the same state a subscriber
// would.

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use formsync_common::protocol::ws::LiveUpdate;
use formsync_common::types::{AccessLevel, EditRequest};

use crate::auth::capability::{CapabilityClaims, CapabilityError};
use crate::auth::extract_bearer_token;
use crate::error::{ErrorCode, RelayError};
use crate::flush::apply_pending;
use crate::state::AppState;

pub async fn submit_edit(
    State(state): State<AppState>,
    Path(form_id): Path<Uuid>,
    headers: HeaderMap,
    Json(update): Json<EditRequest>,
) -> Result<Json<Value>, RelayError> {
    let claims = authorize_edit(&state, &headers, form_id)?;

    if update.is_empty() {
        return Err(RelayError::new(
            ErrorCode::ValidationFailed,
            "edit carries no field updates",
        ));
    }

    let merged = state.queue.enqueue(form_id, update.clone()).await.map_err(|error| {
        warn!(form_id = %form_id, error = %error, "edit not recorded");
        RelayError::from_code(ErrorCode::BufferUnavailable)
    })?;

    state.flush.note_edit(form_id).await;
    state
        .registry
        .publish(
            form_id,
            LiveUpdate {
                resource_id: form_id,
                connection_id: claims.connection_id,
                delta: update,
            },
        )
        .await;

    let document = state
        .documents
        .get(form_id)
        .await
        .map_err(|error| {
            warn!(form_id = %form_id, error = %error, "document lookup failed");
            RelayError::from_code(ErrorCode::StoreUnavailable)
        })?
        .ok_or_else(|| RelayError::from_code(ErrorCode::NotFound))?;

    let (optimistic, _) = apply_pending(document, &merged);
    Ok(Json(json!({ "form": optimistic })))
}

fn authorize_edit(
    state: &AppState,
    headers: &HeaderMap,
    form_id: Uuid,
) -> Result<CapabilityClaims, RelayError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| {
            RelayError::new(ErrorCode::AuthInvalidToken, "missing bearer capability token")
        })?;

    let claims = state
        .tokens
        .validate(token, AccessLevel::EDIT_LEVELS)
        .map_err(capability_error_to_relay)?;

    if claims.resource_id != form_id {
        return Err(RelayError::from_code(ErrorCode::ResourceMismatch));
    }
    Ok(claims)
}

fn capability_error_to_relay(error: CapabilityError) -> RelayError {
    let code = match error {
        CapabilityError::InsufficientAccess { .. } => ErrorCode::AuthInsufficientAccess,
        CapabilityError::InvalidSignature | CapabilityError::MalformedClaims(_) => {
            ErrorCode::AuthInvalidToken
        }
        CapabilityError::Signing(_) => ErrorCode::InternalError,
    };
    RelayError::new(code, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;
    use tower::ServiceExt;

    use formsync_common::patch::ListPatch;
    use formsync_common::types::{FormDocument, FormItem, ResourceKind};

    const TEST_SECRET: &str = "formsync_test_secret_that_is_definitely_long_enough";

    fn router(state: AppState) -> Router {
        Router::new().route("/v1/forms/{form_id}/edits", post(submit_edit)).with_state(state)
    }

    fn token_for(state: &AppState, form_id: Uuid, level: AccessLevel) -> String {
        state
            .tokens
            .issue(form_id, ResourceKind::Form, Uuid::new_v4(), Uuid::new_v4(), level)
            .expect("token should issue")
    }

    fn doc(id: Uuid, questions: &[&str]) -> FormDocument {
        FormDocument {
            id,
            owner: Uuid::new_v4(),
            name: "untitled".to_string(),
            items: questions
                .iter()
                .map(|question| FormItem {
                    question: question.to_string(),
                    item_type: "text".to_string(),
                    options: Vec::new(),
                    text: String::new(),
                    required: false,
                    files: Vec::new(),
                })
                .collect(),
            multiple: false,
            public: AccessLevel::None,
            access: Vec::new(),
            tags: Vec::new(),
            categories: Vec::new(),
            files: Vec::new(),
            responses: 0,
            updated: Utc::now(),
        }
    }

    fn edit_request(form_id: Uuid, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/v1/forms/{form_id}/edits"))
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request should build")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be valid json")
    }

    #[tokio::test]
    async fn edit_returns_optimistically_merged_view() {
        let state = AppState::in_memory(TEST_SECRET).unwrap();
        let form_id = Uuid::new_v4();
        state.documents.insert(doc(form_id, &["a", "b", "c"])).await.unwrap();
        let token = token_for(&state, form_id, AccessLevel::Edit);

        let body = json!({
            "name": "renamed",
            "items": [ { "action": "move", "index": 0, "new_index": 2 } ]
        });
        let response =
            router(state.clone()).oneshot(edit_request(form_id, Some(&token), body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let parsed = body_json(response).await;
        assert_eq!(parsed["form"]["name"], "renamed");
        assert_eq!(parsed["form"]["items"][2]["question"], "a");

        // Stored document is untouched until the flush commits.
        let stored = state.documents.get(form_id).await.unwrap().unwrap();
        assert_eq!(stored.name, "untitled");
        let pending = state.queue.pending(form_id).await.unwrap().expect("buffer exists");
        assert_eq!(pending.items, vec![ListPatch::<FormItem>::Move { index: 0, new_index: 2 }]);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let state = AppState::in_memory(TEST_SECRET).unwrap();
        let form_id = Uuid::new_v4();

        let response = router(state)
            .oneshot(edit_request(form_id, None, json!({"name": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn view_token_is_forbidden() {
        let state = AppState::in_memory(TEST_SECRET).unwrap();
        let form_id = Uuid::new_v4();
        state.documents.insert(doc(form_id, &[])).await.unwrap();
        let token = token_for(&state, form_id, AccessLevel::View);

        let response = router(state.clone())
            .oneshot(edit_request(form_id, Some(&token), json!({"name": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(state.queue.pending(form_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_for_other_form_is_forbidden() {
        let state = AppState::in_memory(TEST_SECRET).unwrap();
        let form_id = Uuid::new_v4();
        let token = token_for(&state, Uuid::new_v4(), AccessLevel::Edit);

        let response = router(state)
            .oneshot(edit_request(form_id, Some(&token), json!({"name": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn empty_edit_is_bad_request() {
        let state = AppState::in_memory(TEST_SECRET).unwrap();
        let form_id = Uuid::new_v4();
        state.documents.insert(doc(form_id, &[])).await.unwrap();
        let token = token_for(&state, form_id, AccessLevel::Edit);

        let response = router(state)
            .oneshot(edit_request(form_id, Some(&token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_form_is_not_found() {
        let state = AppState::in_memory(TEST_SECRET).unwrap();
        let form_id = Uuid::new_v4();
        let token = token_for(&state, form_id, AccessLevel::Edit);

        let response = router(state)
            .oneshot(edit_request(form_id, Some(&token), json!({"name": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
