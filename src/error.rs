use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use log::error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access user store: {0}")]
    Io(#[from] std::io::Error),
    #[error("user store is corrupt: {0}")]
    Corrupt(serde_json::Error),
    #[error("failed to serialize user store: {0}")]
    Serialize(serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Please enter text or upload a file.")]
    NoContent,
    #[error("This content is too long to fit in a QR code.")]
    Encoding(#[from] qrcode::types::QrError),
    #[error("Please fill in the {0} field.")]
    MissingField(&'static str),
    #[error("Username already exists!")]
    DuplicateUser,
    #[error("Passwords do not match!")]
    PasswordMismatch,
    #[error("Invalid username or password!")]
    InvalidCredentials,
    #[error("QR code not found!")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Errors the user can correct; shown as a flash notice instead of a fault.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::NoContent
                | Error::Encoding(_)
                | Error::MissingField(_)
                | Error::DuplicateUser
                | Error::PasswordMismatch
                | Error::InvalidCredentials
                | Error::NotFound
        )
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NoContent | Error::Encoding(_) | Error::MissingField(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::DuplicateUser | Error::PasswordMismatch => StatusCode::CONFLICT,
            Error::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Store(_) | Error::Io(_) | Error::Image(_) | Error::Hash(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.is_user_facing() {
            return HttpResponse::build(self.status_code()).body(self.to_string());
        }
        error!("{:?}", self);
        let message = match self {
            Error::Store(_) => "Database error",
            _ => "Internal error",
        };
        HttpResponse::build(self.status_code()).body(message)
    }
}
