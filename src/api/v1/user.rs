use axum::{extract::State, Json};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::app::Environment;
use crate::error::Error;
use crate::sms::SmsClient;
use crate::util::{self, ObjectIdString};
use crate::vision::{ImageCategory, VisionClient};

use super::otp;
use super::token::{generate_user_session, JwtState, TerminalKey};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,

    pub is_verified: bool,
    pub is_email_verified: bool,

    pub otp: Option<String>,
    pub otp_issued_at: Option<bson::DateTime>,
    pub email_otp: Option<String>,
    pub email_otp_issued_at: Option<bson::DateTime>,

    /// File name of the enrolled profile image, when face pickup is set up.
    pub face_id: Option<String>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl UserModel {
    pub fn new(name: String, phone: String, email: Option<String>) -> Self {
        let now = bson::DateTime::now();

        Self {
            id: ObjectId::new(),
            name,
            phone,
            email,
            is_verified: false,
            is_email_verified: false,
            otp: None,
            otp_issued_at: None,
            email_otp: None,
            email_otp_issued_at: None,
            face_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone)]
pub struct UserCollection(pub crate::mongo_ext::Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = crate::mongo_ext::Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl UserCollection {
    pub async fn find_by_phone(&self, phone: &str) -> Result<Option<UserModel>, Error> {
        self.find_one(bson::doc! { "phone": phone }, None)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserModel>, Error> {
        self.find_one(bson::doc! { "email": email }, None)
            .await
            .map_err(Into::into)
    }
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub phone: String,
    pub email: Option<String>,
    /// Optional base64 profile image enrolling the user for face pickup.
    pub face_image: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserResponse {
    pub message: String,
    pub user_id: ObjectIdString,
}

pub async fn create_user(
    State(users): State<UserCollection>,
    State(sms): State<SmsClient>,
    State(vision): State<VisionClient>,
    State(env): State<Environment>,
    Json(request): Json<CreateUserRequest>,
) -> Result<Json<CreateUserResponse>, Error> {
    request.validate()?;

    if !util::is_valid_phone(&request.phone) {
        return Err(Error::InvalidPhoneNumber);
    }

    if let Some(email) = request.email.as_deref() {
        if !util::is_valid_email(email) {
            return Err(Error::InvalidEmail);
        }
    }

    if users.find_by_phone(&request.phone).await?.is_some() {
        return Err(Error::AlreadyExists("phone"));
    }

    if let Some(email) = request.email.as_deref() {
        if users.find_by_email(email).await?.is_some() {
            return Err(Error::AlreadyExists("email"));
        }
    }

    let mut user = UserModel::new(request.name, request.phone, request.email);

    if let Some(image) = request.face_image.as_deref() {
        let stored = vision
            .upload_image(image, user.id, ImageCategory::Profile)
            .await?;
        user.face_id = Some(stored.file_name);
    }

    users.insert_one(&user, None).await?;

    otp::issue_phone_otp(&users, &sms, env, &user.phone).await?;

    if let Some(email) = user.email.as_deref() {
        otp::issue_email_otp(&users, env, email).await?;
    }

    Ok(Json(CreateUserResponse {
        message: "User created. Verify the OTP sent to your phone.".to_string(),
        user_id: user.id.into(),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(length(min = 1))]
    pub phone: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message: String,
}

/// Starts a login by sending fresh OTPs to an existing user. An unknown
/// phone is answered with a register prompt, not an error, so kiosks can
/// route new users to registration.
pub async fn login(
    State(users): State<UserCollection>,
    State(sms): State<SmsClient>,
    State(env): State<Environment>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<MessageResponse>, Error> {
    request.validate()?;

    let user = match users.find_by_phone(&request.phone).await? {
        Some(user) => user,
        None => {
            return Ok(Json(MessageResponse {
                message: "User not found. Please register first.".to_string(),
            }))
        }
    };

    otp::issue_phone_otp(&users, &sms, env, &user.phone).await?;

    if let Some(email) = user.email.as_deref() {
        otp::issue_email_otp(&users, env, email).await?;
    }

    Ok(Json(MessageResponse {
        message: format!("OTP sent to {}", util::mask_phone(&user.phone)),
    }))
}

/// Re-sends the phone OTP. Unlike [`login`] this also works for users who
/// have not finished registration yet.
pub async fn resend_otp(
    State(users): State<UserCollection>,
    State(sms): State<SmsClient>,
    State(env): State<Environment>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<MessageResponse>, Error> {
    request.validate()?;

    otp::issue_phone_otp(&users, &sms, env, &request.phone).await?;

    Ok(Json(MessageResponse {
        message: format!("OTP sent to {}", util::mask_phone(&request.phone)),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ResendEmailOtpRequest {
    #[validate(email)]
    pub email: String,
}

pub async fn resend_email_otp(
    State(users): State<UserCollection>,
    State(env): State<Environment>,
    Json(request): Json<ResendEmailOtpRequest>,
) -> Result<Json<MessageResponse>, Error> {
    request.validate()?;

    otp::issue_email_otp(&users, env, &request.email).await?;

    Ok(Json(MessageResponse {
        message: "OTP sent to your email.".to_string(),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    #[validate(length(min = 1))]
    pub phone: String,
    #[validate(length(min = 1))]
    pub otp: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpResponse {
    pub token: String,
    pub user_id: ObjectIdString,
    pub name: String,
}

/// Checks the submitted OTP, marks the user verified and opens a session.
/// Serves both registration verification and login verification.
pub async fn verify_otp(
    State(users): State<UserCollection>,
    State(jwt_state): State<JwtState>,
    Json(request): Json<VerifyOtpRequest>,
) -> Result<Json<VerifyOtpResponse>, Error> {
    request.validate()?;

    let user = users
        .find_by_phone(&request.phone)
        .await?
        .ok_or(Error::UserNotFound)?;

    if !otp::validate_code(user.otp.as_deref(), user.otp_issued_at, &request.otp) {
        return Err(Error::InvalidOtp);
    }

    users
        .update_one_by_id(
            user.id,
            bson::doc! {
                "$set": {
                    "isVerified": true,
                    "updatedAt": bson::DateTime::now(),
                },
                "$unset": { "otp": "", "otpIssuedAt": "" },
            },
        )
        .await?;

    let token = generate_user_session(&jwt_state, &user)?;

    Ok(Json(VerifyOtpResponse {
        token,
        user_id: user.id.into(),
        name: user.name,
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEmailOtpRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub otp: String,
}

pub async fn verify_email_otp(
    State(users): State<UserCollection>,
    Json(request): Json<VerifyEmailOtpRequest>,
) -> Result<Json<MessageResponse>, Error> {
    request.validate()?;

    let user = users
        .find_by_email(&request.email)
        .await?
        .ok_or(Error::UserNotFound)?;

    if !otp::validate_code(
        user.email_otp.as_deref(),
        user.email_otp_issued_at,
        &request.otp,
    ) {
        return Err(Error::InvalidEmailOtp);
    }

    users
        .update_one_by_id(
            user.id,
            bson::doc! {
                "$set": {
                    "isEmailVerified": true,
                    "updatedAt": bson::DateTime::now(),
                },
                "$unset": { "emailOtp": "", "emailOtpIssuedAt": "" },
            },
        )
        .await?;

    Ok(Json(MessageResponse {
        message: "Email verified.".to_string(),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PickupLoginRequest {
    #[validate(length(min = 1))]
    pub phone: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PickupLoginResponse {
    pub message: String,
    pub code: String,
    pub order_id: ObjectIdString,
}

/// Kiosk pickup entry point. Looks up an in-progress delivery for the
/// receiver at this terminal and tells the kiosk which challenge to show:
/// face terminals ask for face or pin, others get an OTP texted.
pub async fn pickup_login(
    terminal_key: TerminalKey,
    State(users): State<UserCollection>,
    State(terminals): State<super::terminal::TerminalCollection>,
    State(orders): State<super::order::OrderCollection>,
    State(sms): State<SmsClient>,
    State(env): State<Environment>,
    Json(request): Json<PickupLoginRequest>,
) -> Result<Json<PickupLoginResponse>, Error> {
    request.validate()?;

    let terminal = terminals
        .find_by_uuid(&terminal_key.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    let order = orders
        .find_in_progress(&request.phone, terminal.id)
        .await?
        .ok_or(Error::OrderNotFound)?;

    if terminal.face_enabled {
        return Ok(Json(PickupLoginResponse {
            message: "Enter faceId / collect pin".to_string(),
            code: "P01".to_string(),
            order_id: order.id.into(),
        }));
    }

    otp::issue_phone_otp(&users, &sms, env, &request.phone).await?;

    Ok(Json(PickupLoginResponse {
        message: format!("OTP sent to {}", util::mask_phone(&request.phone)),
        code: "P02".to_string(),
        order_id: order.id.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_model_serializes_camel_case() {
        let user = UserModel::new(
            "Asha".to_string(),
            "+14155552671".to_string(),
            Some("asha@example.com".to_string()),
        );

        let value = serde_json::to_value(&user).unwrap();
        assert!(value.get("isVerified").is_some());
        assert!(value.get("createdAt").is_some());
        assert!(value.get("is_verified").is_none());
    }

    #[test]
    fn create_user_request_accepts_camel_case_face_image() {
        let request: CreateUserRequest = serde_json::from_value(serde_json::json!({
            "name": "Asha",
            "phone": "+14155552671",
            "faceImage": "aGk=",
        }))
        .unwrap();

        assert_eq!(request.face_image.as_deref(), Some("aGk="));
        assert!(request.validate().is_ok());
    }
}
