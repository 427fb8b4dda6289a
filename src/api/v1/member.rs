use argon2::Argon2;
use axum::{extract::State, Json};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Error;
use crate::util::{self, ObjectIdString};

use super::token::{generate_member_token, JwtState, MemberSession};

/// Staff roles, most privileged first. The derived order is what the
/// authorization checks compare on.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Role {
    #[serde(rename = "SUPER_ADMIN")]
    SuperAdmin,
    #[serde(rename = "ADMIN")]
    Admin,
    #[serde(rename = "MANAGER")]
    Manager,
    #[serde(rename = "USER")]
    User,
}

impl Role {
    /// Whether a member holding `self` may create or modify a member
    /// holding `other`. Super admins manage everyone; admins manage
    /// strictly lower roles.
    pub fn can_manage(self, other: Role) -> bool {
        match self {
            Self::SuperAdmin => true,
            Self::Admin => self < other,
            Self::Manager | Self::User => false,
        }
    }

    pub fn can_update_pricing(self) -> bool {
        matches!(self, Self::SuperAdmin | Self::Admin)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MemberModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub username: String,
    /// argon2 hash, never the plain password.
    pub password: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    /// Terminals this member operates.
    pub terminals: Vec<ObjectId>,
    pub address: String,
    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct MemberCollection(pub crate::mongo_ext::Collection<MemberModel>);

impl std::ops::Deref for MemberCollection {
    type Target = crate::mongo_ext::Collection<MemberModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MemberCollection {
    pub async fn find_by_username(&self, username: &str) -> Result<Option<MemberModel>, Error> {
        self.find_one(bson::doc! { "username": username }, None)
            .await
            .map_err(Into::into)
    }

    /// Resolves the session's member, failing when the account was removed
    /// after the token was issued.
    pub async fn resolve_session(&self, session: &MemberSession) -> Result<MemberModel, Error> {
        self.find_one_by_id(session.id)
            .await?
            .ok_or(Error::MemberNotFound)
    }
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateMemberRequest {
    #[validate(length(min = 3))]
    pub username: String,
    #[validate(length(min = 8))]
    pub password: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub phone: String,
    pub role: Role,
    #[serde(default)]
    pub terminals: Vec<ObjectIdString>,
    #[serde(default)]
    pub address: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateMemberResponse {
    pub member_id: ObjectIdString,
    pub username: String,
    pub role: Role,
    pub terminals: Vec<ObjectIdString>,
}

pub async fn create_member(
    session: MemberSession,
    State(members): State<MemberCollection>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<CreateMemberRequest>,
) -> Result<Json<CreateMemberResponse>, Error> {
    request.validate()?;

    let creator = members.resolve_session(&session).await?;
    if !creator.role.can_manage(request.role) {
        return Err(Error::MemberNotAuthorized);
    }

    if !util::is_valid_phone(&request.phone) {
        return Err(Error::InvalidPhoneNumber);
    }

    if members.find_by_username(&request.username).await?.is_some() {
        return Err(Error::AlreadyExists("username"));
    }

    if members
        .find_one(bson::doc! { "email": &request.email }, None)
        .await?
        .is_some()
    {
        return Err(Error::AlreadyExists("email"));
    }

    if members
        .find_one(bson::doc! { "phone": &request.phone }, None)
        .await?
        .is_some()
    {
        return Err(Error::AlreadyExists("phone"));
    }

    let now = bson::DateTime::now();
    let member = MemberModel {
        id: ObjectId::new(),
        username: request.username,
        password: util::hash_password(&argon, &request.password)?,
        email: request.email,
        phone: request.phone,
        role: request.role,
        terminals: request.terminals.into_iter().map(|id| id.0).collect(),
        address: request.address,
        created_at: now,
        updated_at: now,
    };

    members.insert_one(&member, None).await?;

    Ok(Json(CreateMemberResponse {
        member_id: member.id.into(),
        username: member.username,
        role: member.role,
        terminals: member.terminals.into_iter().map(Into::into).collect(),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MemberLoginRequest {
    #[validate(length(min = 1))]
    pub username: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MemberLoginResponse {
    pub token: String,
    pub role: Role,
    pub terminals: Vec<ObjectIdString>,
}

pub async fn member_login(
    State(members): State<MemberCollection>,
    State(argon): State<Argon2<'static>>,
    State(jwt_state): State<JwtState>,
    Json(request): Json<MemberLoginRequest>,
) -> Result<Json<MemberLoginResponse>, Error> {
    request.validate()?;

    let member = members
        .find_by_username(&request.username)
        .await?
        .ok_or(Error::MemberNotFound)?;

    if !util::verify_password(&argon, &request.password, &member.password) {
        return Err(Error::InvalidCredentials);
    }

    let token = generate_member_token(&jwt_state, &member)?;

    Ok(Json(MemberLoginResponse {
        token,
        role: member.role,
        terminals: member.terminals.into_iter().map(Into::into).collect(),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMemberRequest {
    pub member_id: ObjectIdString,
    #[validate(email)]
    pub email: Option<String>,
    pub phone: Option<String>,
    #[validate(length(min = 8))]
    pub password: Option<String>,
    /// Required when a member rotates their own password.
    pub current_password: Option<String>,
    pub role: Option<Role>,
    pub terminals: Option<Vec<ObjectIdString>>,
    pub address: Option<String>,
}

pub async fn update_member(
    session: MemberSession,
    State(members): State<MemberCollection>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<UpdateMemberRequest>,
) -> Result<Json<super::user::MessageResponse>, Error> {
    request.validate()?;

    let updater = members.resolve_session(&session).await?;
    let target = members
        .find_one_by_id(request.member_id.0)
        .await?
        .ok_or(Error::MemberNotFound)?;

    // Members may rotate their own password; anything else needs a role
    // that outranks the target.
    let self_update = updater.id == target.id;
    if !self_update && !updater.role.can_manage(target.role) {
        return Err(Error::MemberNotAuthorized);
    }

    let mut set = bson::doc! { "updatedAt": bson::DateTime::now() };

    if let Some(email) = request.email {
        set.insert("email", email);
    }

    if let Some(phone) = request.phone {
        if !util::is_valid_phone(&phone) {
            return Err(Error::InvalidPhoneNumber);
        }
        set.insert("phone", phone);
    }

    if let Some(password) = request.password {
        if self_update {
            let current = request
                .current_password
                .as_deref()
                .ok_or(Error::InvalidCredentials)?;
            if !util::verify_password(&argon, current, &target.password) {
                return Err(Error::InvalidCredentials);
            }
        }
        set.insert("password", util::hash_password(&argon, &password)?);
    }

    if let Some(role) = request.role {
        if self_update || !updater.role.can_manage(role) {
            return Err(Error::MemberNotAuthorized);
        }
        set.insert("role", bson::to_bson(&role)?);
    }

    if let Some(terminals) = request.terminals {
        if !updater.role.can_manage(target.role) {
            return Err(Error::MemberNotAuthorized);
        }
        let ids: Vec<ObjectId> = terminals.into_iter().map(|id| id.0).collect();
        set.insert("terminals", ids);
    }

    if let Some(address) = request.address {
        set.insert("address", address);
    }

    members
        .update_one_by_id(target.id, bson::doc! { "$set": set })
        .await?;

    Ok(Json(super::user::MessageResponse {
        message: "Member updated.".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_order_is_most_privileged_first() {
        assert!(Role::SuperAdmin < Role::Admin);
        assert!(Role::Admin < Role::Manager);
        assert!(Role::Manager < Role::User);
    }

    #[test]
    fn role_management_rules() {
        assert!(Role::SuperAdmin.can_manage(Role::SuperAdmin));
        assert!(Role::SuperAdmin.can_manage(Role::User));

        assert!(Role::Admin.can_manage(Role::Manager));
        assert!(Role::Admin.can_manage(Role::User));
        assert!(!Role::Admin.can_manage(Role::Admin));
        assert!(!Role::Admin.can_manage(Role::SuperAdmin));

        assert!(!Role::Manager.can_manage(Role::User));
        assert!(!Role::User.can_manage(Role::User));
    }

    #[test]
    fn pricing_updates_are_admin_only() {
        assert!(Role::SuperAdmin.can_update_pricing());
        assert!(Role::Admin.can_update_pricing());
        assert!(!Role::Manager.can_update_pricing());
        assert!(!Role::User.can_update_pricing());
    }

    #[test]
    fn roles_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_value(Role::SuperAdmin).unwrap(),
            serde_json::json!("SUPER_ADMIN")
        );
        assert_eq!(
            serde_json::from_value::<Role>(serde_json::json!("MANAGER")).unwrap(),
            Role::Manager
        );
    }
}
