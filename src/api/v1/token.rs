use axum::{
    extract::{FromRef, FromRequestParts},
    headers::{authorization::Bearer, Authorization},
    http::request::Parts,
    RequestPartsExt, TypedHeader,
};
use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::{Duration, OffsetDateTime};

use crate::{error::Error, util::ObjectIdString};

use super::member::{MemberModel, Role};
use super::user::UserModel;

#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn new(secret: &[u8]) -> Self {
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        // expiry is checked by hand so that decode failures and stale
        // sessions surface as the same error
        validation.validate_exp = false;
        validation.required_spec_claims = Default::default();

        Self {
            header,
            validation,

            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret),
            decoding_key: jsonwebtoken::DecodingKey::from_secret(secret),
        }
    }

    pub fn new_from_env() -> Self {
        let secret_key = std::env::var("JWT_SECRET_KEY")
            .expect("Cannot retreive JWT_SECRET_KEY from environment variable.");

        Self::new(secret_key.as_bytes())
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Session claims for an end user verified through OTP.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserSessionClaims {
    pub sub: ObjectIdString,
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    pub exp: i64,
}

impl UserSessionClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub fn generate_user_session(jwt_state: &JwtState, user: &UserModel) -> Result<String, Error> {
    let exp = current_timestamp() + Duration::hours(24);
    generate_user_session_with_exp(jwt_state, user, exp.unix_timestamp())
}

pub fn generate_user_session_with_exp(
    jwt_state: &JwtState,
    user: &UserModel,
    exp: i64,
) -> Result<String, Error> {
    let claims = UserSessionClaims {
        sub: user.id.into(),
        phone: user.phone.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
        exp,
    };

    jsonwebtoken::encode(&jwt_state.header, &claims, &jwt_state.encoding_key).map_err(Into::into)
}

pub fn decode_user_session(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<UserSessionClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}

/// Authenticated end user resolved from the Authorization header.
#[derive(Debug)]
pub struct UserSession {
    pub id: bson::oid::ObjectId,
    pub phone: String,
}

impl UserSession {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_user_session(jwt_state, token).map_err(|_| Error::InvalidToken)?;

        if token.claims.is_expired() {
            return Err(Error::InvalidToken);
        }

        Ok(Self {
            id: token.claims.sub.0,
            phone: token.claims.phone,
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserSession
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::InvalidToken)
            .tap_err(|_| tracing::debug!("authorization header not found"))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

/// Claims for a staff member session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemberClaims {
    pub sub: ObjectIdString,
    pub role: Role,
    pub username: String,
    pub exp: i64,
}

impl MemberClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

/// Expiry window keyed on the member role.
pub fn member_session_duration(role: Role) -> Duration {
    match role {
        Role::SuperAdmin => Duration::hours(4),
        Role::Admin => Duration::hours(8),
        Role::Manager => Duration::hours(12),
        // kiosk accounts stay signed in
        Role::User => Duration::weeks(52 * 10),
    }
}

pub fn generate_member_token(jwt_state: &JwtState, member: &MemberModel) -> Result<String, Error> {
    let exp = current_timestamp() + member_session_duration(member.role);

    let claims = MemberClaims {
        sub: member.id.into(),
        role: member.role,
        username: member.username.clone(),
        exp: exp.unix_timestamp(),
    };

    jsonwebtoken::encode(&jwt_state.header, &claims, &jwt_state.encoding_key).map_err(Into::into)
}

pub fn decode_member_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<MemberClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}

/// Authenticated staff member resolved from the Authorization header.
#[derive(Debug)]
pub struct MemberSession {
    pub id: bson::oid::ObjectId,
    pub role: Role,
}

impl MemberSession {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_member_token(jwt_state, token).map_err(|_| Error::InvalidToken)?;

        if token.claims.is_expired() {
            return Err(Error::InvalidToken);
        }

        Ok(Self {
            id: token.claims.sub.0,
            role: token.claims.role,
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for MemberSession
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::InvalidToken)?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

/// Terminal API key carried in the `x-api-key` header. Its value is the
/// terminal's uuid, so handlers use it directly as the lookup key.
#[derive(Debug, Clone)]
pub struct TerminalKey(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for TerminalKey
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or(Error::MissingTerminalId)?;

        Ok(Self(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::extract::FromRequestParts;
    use bson::oid::ObjectId;

    use super::*;
    use crate::api::v1::member::Role;

    fn jwt() -> JwtState {
        JwtState::new(b"test-secret")
    }

    fn user() -> UserModel {
        UserModel::new(
            "name".to_string(),
            "+14155552671".to_string(),
            Some("user@example.com".to_string()),
        )
    }

    fn member() -> MemberModel {
        MemberModel {
            id: ObjectId::new(),
            username: "admin".to_string(),
            password: String::new(),
            email: "admin@example.com".to_string(),
            phone: "+14155552671".to_string(),
            role: Role::Admin,
            terminals: vec![],
            address: "HQ".to_string(),
            created_at: bson::DateTime::now(),
            updated_at: bson::DateTime::now(),
        }
    }

    #[test]
    fn user_session_roundtrip() {
        let jwt = jwt();
        let user = user();

        let token = generate_user_session(&jwt, &user).unwrap();
        let session = UserSession::from_token(&jwt, &token).unwrap();

        assert_eq!(session.id, user.id);
        assert_eq!(session.phone, user.phone);
    }

    #[test]
    fn expired_user_session_is_rejected() {
        let jwt = jwt();
        let user = user();

        let exp = (current_timestamp() - Duration::seconds(1)).unix_timestamp();
        let token = generate_user_session_with_exp(&jwt, &user, exp).unwrap();

        let error = UserSession::from_token(&jwt, &token).unwrap_err();
        assert_matches!(error, Error::InvalidToken);
    }

    #[test]
    fn member_token_roundtrip() {
        let jwt = jwt();
        let member = member();

        let token = generate_member_token(&jwt, &member).unwrap();
        let session = MemberSession::from_token(&jwt, &token).unwrap();

        assert_eq!(session.id, member.id);
        assert_eq!(session.role, Role::Admin);
    }

    #[test]
    fn member_token_does_not_validate_as_user_session() {
        let jwt = jwt();
        let member = member();

        let token = generate_member_token(&jwt, &member).unwrap();
        assert!(UserSession::from_token(&jwt, &token).is_err());
    }

    #[tokio::test]
    async fn terminal_key_extraction() {
        let (mut parts, _) = axum::http::Request::post("http://localhost")
            .header("x-api-key", "terminal-uuid")
            .body(())
            .unwrap()
            .into_parts();

        let TerminalKey(key) = TerminalKey::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(key, "terminal-uuid");

        let (mut parts, _) = axum::http::Request::post("http://localhost")
            .body(())
            .unwrap()
            .into_parts();

        let error = TerminalKey::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_matches!(error, Error::MissingTerminalId);
    }
}
