use std::sync::Arc;

use axum::extract::FromRef;

use crate::api::v1::{
    member::MemberCollection, order::OrderCollection, terminal::TerminalCollection,
    token::JwtState, user::UserCollection,
};
use crate::sms::{ConsoleSms, Msg91Gateway, SmsClient};
use crate::vision::{DevVisionService, HttpVisionService, VisionClient};

/// Deployment mode. Development short-circuits external collaborators:
/// OTP and collect pin are fixed, SMS is logged instead of sent, and the
/// face service returns canned matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV").as_deref() {
            Ok("production") => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,
    pub env: Environment,

    pub sms: SmsClient,
    pub vision: VisionClient,

    pub mongo_client: mongodb::Client,
    pub user_collection: UserCollection,
    pub member_collection: MemberCollection,
    pub terminal_collection: TerminalCollection,
    pub order_collection: OrderCollection,
}

impl AppState {
    pub async fn new(
        mongo_url: &str,
        database_name: &str,
        env: Environment,
        sms: SmsClient,
        vision: VisionClient,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let argon = argon2::Argon2::default();
        let jwt_state = JwtState::new_from_env();

        let mongo_client_opt = mongodb::options::ClientOptions::parse(mongo_url).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(database_name);
        Ok(Self {
            argon,
            jwt_state,
            env,

            sms,
            vision,

            mongo_client,
            user_collection: UserCollection(db.collection("users").into()),
            member_collection: MemberCollection(db.collection("members").into()),
            terminal_collection: TerminalCollection(db.collection("terminals").into()),
            order_collection: OrderCollection(db.collection("orders").into()),
        })
    }

    pub async fn new_from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let mongodb_url = &std::env::var("MONGODB_URI")
            .expect("Cannot retreive MONGODB_URI from environment variable.");

        let env = Environment::from_env();

        let (sms, vision) = match env {
            Environment::Development => (
                SmsClient(Arc::new(ConsoleSms)),
                VisionClient(Arc::new(DevVisionService)),
            ),
            Environment::Production => (
                SmsClient(Arc::new(Msg91Gateway::new_from_env())),
                VisionClient(Arc::new(HttpVisionService::new_from_env())),
            ),
        };

        Self::new(mongodb_url, "sprintsafe", env, sms, vision).await
    }
}
