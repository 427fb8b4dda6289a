use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("API key (Terminal ID) is missing.")]
    MissingTerminalId,

    #[error("Terminal not found.")]
    TerminalNotFound,

    #[error("No lockers found in the terminal.")]
    LockersNotFound,

    #[error("No available locker of the requested size: {0}")]
    LockerNotAvailable(String),

    #[error("Locker details are missing for the available locker.")]
    LockerNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("User not verified.")]
    UserNotVerified,

    #[error("Order not found.")]
    OrderNotFound,

    #[error("You have an order in progress. Please complete it before placing a new one.")]
    OrderInProgress,

    #[error("Order status is invalid: {0}")]
    OrderStatusInvalid(String),

    #[error("Face ID is required.")]
    MissingFaceId,

    #[error("Collect Pin is required.")]
    MissingCollectPin,

    #[error("Collect Pin does not match.")]
    CollectPinNotMatch,

    #[error("The provided OTP is invalid.")]
    InvalidOtp,

    #[error("The provided Email OTP is invalid.")]
    InvalidEmailOtp,

    #[error("Enter a valid phone number.")]
    InvalidPhoneNumber,

    #[error("Enter a valid email.")]
    InvalidEmail,

    #[error("{0} is required")]
    RequiredFields(&'static str),

    #[error("Invalid locker size or price.")]
    InvalidFields,

    #[error("Missing fields: {0}")]
    MissingFields(String),

    #[error("Receiver mobile is required.")]
    MissingReceiverMobile,

    #[error("basePrice is required when no products are present in lockers")]
    MissingBasePrice,

    #[error("No price configured for locker size: {0}")]
    PriceNotConfigured(String),

    #[error("Failed to send SMS: {0}")]
    SmsError(String),

    #[error("Member not found")]
    MemberNotFound,

    #[error("Member is not authorized")]
    MemberNotAuthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0} already registered")]
    AlreadyExists(&'static str),

    #[error("Invalid or missing token")]
    InvalidToken,

    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    BsonSerError(#[from] bson::ser::Error),

    #[error("{0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    #[error("{0}")]
    PasswordHashError(#[from] password_hash::Error),

    #[error("image service error: {0}")]
    ImageServiceError(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    pub error: String,
    pub message: String,
}

impl Error {
    /// Stable machine-readable kind surfaced to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingTerminalId => "MISSING_TERMINAL_ID",
            Self::TerminalNotFound => "TERMINAL_NOT_FOUND",
            Self::LockersNotFound => "LOCKERS_NOT_FOUND",
            Self::LockerNotAvailable(..) => "LOCKER_NOT_AVAILABLE",
            Self::LockerNotFound => "LOCKER_NOT_FOUND",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::UserNotVerified => "USER_NOT_VERIFIED",
            Self::OrderNotFound => "ORDER_NOT_FOUND",
            Self::OrderInProgress => "ORDER_IN_PROGRESS",
            Self::OrderStatusInvalid(..) => "ORDER_STATUS_INVALID",
            Self::MissingFaceId => "MISSING_FACE_ID",
            Self::MissingCollectPin => "MISSING_COLLECT_PIN",
            Self::CollectPinNotMatch => "COLLECT_PIN_NOT_MATCH",
            Self::InvalidOtp => "INVALID_OTP",
            Self::InvalidEmailOtp => "INVALID_EMAIL_OTP",
            Self::InvalidPhoneNumber => "INVALID_PHONE_NUMBER",
            Self::InvalidEmail => "INVALID_EMAIL",
            Self::RequiredFields(..) => "REQUIRED_FIELDS",
            Self::InvalidFields => "INVALID_FIELDS",
            Self::MissingFields(..) => "MISSING_FIELDS",
            Self::MissingReceiverMobile => "MISSING_RECEIVER_MOBILE",
            Self::MissingBasePrice => "MISSING_BASE_PRICE",
            Self::PriceNotConfigured(..) => "MISSING_BASE_PRICE",
            Self::SmsError(..) => "SMS_ERROR",
            Self::MemberNotFound => "MEMBER_NOT_FOUND",
            Self::MemberNotAuthorized => "MEMBER_NOT_AUTHORIZED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AlreadyExists(field) => match *field {
                "phone" => "PHONE_ALREADY_EXISTS",
                "email" => "EMAIL_ALREADY_EXISTS",
                "username" => "USERNAME_ALREADY_EXISTS",
                _ => "ALREADY_EXISTS",
            },
            Self::InvalidToken => "INVALID_TOKEN",
            Self::ValidationError(..) => "VALIDATION_ERROR",
            Self::DatabaseError(..)
            | Self::BsonSerError(..)
            | Self::JwtError(..)
            | Self::PasswordHashError(..)
            | Self::ImageServiceError(..) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingTerminalId
            | Self::LockerNotAvailable(..)
            | Self::OrderInProgress
            | Self::OrderStatusInvalid(..)
            | Self::MissingFaceId
            | Self::MissingCollectPin
            | Self::CollectPinNotMatch
            | Self::InvalidOtp
            | Self::InvalidEmailOtp
            | Self::InvalidPhoneNumber
            | Self::InvalidEmail
            | Self::RequiredFields(..)
            | Self::InvalidFields
            | Self::MissingFields(..)
            | Self::MissingReceiverMobile
            | Self::MissingBasePrice
            | Self::PriceNotConfigured(..)
            | Self::InvalidCredentials
            | Self::ValidationError(..) => StatusCode::BAD_REQUEST,

            Self::UserNotVerified | Self::InvalidToken => StatusCode::UNAUTHORIZED,

            Self::MemberNotAuthorized => StatusCode::FORBIDDEN,

            Self::TerminalNotFound
            | Self::LockersNotFound
            | Self::LockerNotFound
            | Self::UserNotFound
            | Self::OrderNotFound
            | Self::MemberNotFound => StatusCode::NOT_FOUND,

            Self::AlreadyExists(..) => StatusCode::CONFLICT,

            Self::SmsError(..) => StatusCode::BAD_GATEWAY,

            Self::DatabaseError(..)
            | Self::BsonSerError(..)
            | Self::JwtError(..)
            | Self::PasswordHashError(..)
            | Self::ImageServiceError(..) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("error: {:?}", self);
        let status = self.status();

        // Internal faults never leak their details to the client.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal server error has occurred.".to_string()
        } else {
            self.to_string()
        };

        let error = ErrorJson {
            error: self.kind().to_string(),
            message,
        };

        (status, Json(error)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_kinds_are_stable() {
        assert_eq!(Error::MissingTerminalId.kind(), "MISSING_TERMINAL_ID");
        assert_eq!(
            Error::LockerNotAvailable("SMALL".to_string()).kind(),
            "LOCKER_NOT_AVAILABLE"
        );
        assert_eq!(Error::CollectPinNotMatch.kind(), "COLLECT_PIN_NOT_MATCH");
        assert_eq!(Error::AlreadyExists("phone").kind(), "PHONE_ALREADY_EXISTS");
        assert_eq!(Error::AlreadyExists("email").kind(), "EMAIL_ALREADY_EXISTS");
        assert_eq!(
            Error::PriceNotConfigured("CUSTOM".to_string()).kind(),
            "MISSING_BASE_PRICE"
        );
    }

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(Error::TerminalNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::OrderNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::LockerNotAvailable("SMALL".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::UserNotVerified.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::MemberNotAuthorized.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::AlreadyExists("username").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::SmsError("timeout".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn internal_faults_do_not_leak() {
        let err = Error::ImageServiceError("bucket credentials rejected".to_string());
        assert_eq!(err.kind(), "INTERNAL_SERVER_ERROR");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
