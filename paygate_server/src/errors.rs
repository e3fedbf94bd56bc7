use actix_web::{
    error::ResponseError,
    http::{header::ContentType, StatusCode},
    HttpResponse,
};
use paygate_engine::ConfirmationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Could not initialize server. {0}")]
    InitializeError(String),
    #[error("An error occurred on the backend of the server. {0}")]
    BackendError(String),
    #[error("Could not read request body: {0}")]
    InvalidRequestBody(String),
    #[error("An I/O error happened in the server. {0}")]
    IOError(#[from] std::io::Error),
    #[error("Invalid server configuration. {0}")]
    ConfigurationError(String),
    #[error("UnspecifiedError. {0}")]
    Unspecified(String),
    #[error("The data was not found. {0}")]
    NoRecordFound(String),
    #[error("Insufficient Permissions. {0}")]
    InsufficientPermissions(String),
    #[error("The request is not allowed in the session's current state. {0}")]
    InvalidStateTransition(String),
    #[error("The request was not sent from an authorised address.")]
    ForbiddenPeer,
    #[error("The upstream payment provider could not be reached. {0}")]
    ProviderUnavailable(String),
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequestBody(_) => StatusCode::BAD_REQUEST,
            Self::InitializeError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IOError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unspecified(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoRecordFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientPermissions(_) => StatusCode::FORBIDDEN,
            Self::InvalidStateTransition(_) => StatusCode::CONFLICT,
            Self::ForbiddenPeer => StatusCode::FORBIDDEN,
            Self::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .body(serde_json::json!({ "error": self.to_string() }).to_string())
    }
}

impl From<ConfirmationError> for ServerError {
    fn from(e: ConfirmationError) -> Self {
        match e {
            ConfirmationError::SessionNotFound(id) => Self::NoRecordFound(format!("Session {id}")),
            ConfirmationError::NotOwner(_) => Self::InsufficientPermissions(e.to_string()),
            ConfirmationError::CancelForbidden { .. } => Self::InvalidStateTransition(e.to_string()),
            ConfirmationError::ProviderError(p) => Self::ProviderUnavailable(p.to_string()),
            ConfirmationError::StorageError(s) => Self::BackendError(s.to_string()),
            ConfirmationError::OrderCreation(o) => Self::BackendError(o.to_string()),
        }
    }
}
