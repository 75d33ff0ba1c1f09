use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("model '{0}' is not available from any backend")]
    ModelUnavailable(String),
    #[error("failed to load model '{model}': {cause}")]
    ModelLoadFailed { model: String, cause: String },
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn load_failed(model: &str, cause: impl ToString) -> Self {
        ServiceError::ModelLoadFailed {
            model: model.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ModelUnavailable(_)
            | ServiceError::ModelLoadFailed { .. }
            | ServiceError::GenerationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Cache(_) | ServiceError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_request_problems_map_to_4xx() {
        assert_eq!(
            ServiceError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::NotFound("Training task not found".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ModelUnavailable("ghost".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::load_failed("m", "disk full").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn load_failure_message_carries_cause() {
        let err = ServiceError::load_failed("tiny-gpt", "connection refused");
        assert_eq!(
            err.to_string(),
            "failed to load model 'tiny-gpt': connection refused"
        );
    }
}
