//! Success envelopes used by the resource routes.
//!
//! Projects and notifications answer `{message, code, data}`; tasks, comments
//! and status-change requests answer `{status: "success", message, data}`.
//! Errors always render through `AppError` as `{"error": ...}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};

/// `{message, code, data}`.
pub fn envelope<T: Serialize>(code: StatusCode, message: &str, data: T) -> Response {
    let body = json!({
        "message": message,
        "code": code.as_u16(),
        "data": data,
    });
    (code, Json(body)).into_response()
}

/// `{status: "success", message, data}`. `data` is left out when `None`.
pub fn success<T: Serialize>(code: StatusCode, message: &str, data: Option<T>) -> Response {
    let mut body = json!({
        "status": "success",
        "message": message,
    });
    if let (Some(data), Value::Object(map)) = (data, &mut body) {
        map.insert("data".to_string(), json!(data));
    }
    (code, Json(body)).into_response()
}

/// `{message}` with the given status.
pub fn message(code: StatusCode, message: &str) -> Response {
    (code, Json(json!({ "message": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_envelope_shape() {
        let response = envelope(StatusCode::CREATED, "Project created successfully", json!({"id": 1}));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            body(response).await,
            json!({"message": "Project created successfully", "code": 201, "data": {"id": 1}})
        );
    }

    #[tokio::test]
    async fn test_success_omits_missing_data() {
        let response = success::<Value>(StatusCode::OK, "Task deleted successfully.", None);
        assert_eq!(
            body(response).await,
            json!({"status": "success", "message": "Task deleted successfully."})
        );
    }
}
