use std::time::Duration;

use serde_json::json;

use crate::error::Error;

/// Fire-and-confirm SMS collaborator. Implementations report success or
/// failure only; retries with backoff belong here, not in the order flow.
#[axum::async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_login_message(&self, phone: &str, otp: &str) -> Result<(), Error>;

    async fn send_collect_pin_message(
        &self,
        phone: &str,
        pin: &str,
        locker_number: i32,
    ) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct SmsClient(pub std::sync::Arc<dyn SmsGateway>);

impl std::ops::Deref for SmsClient {
    type Target = dyn SmsGateway;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

pub fn login_message(otp: &str) -> String {
    format!(
        "Your OTP for login to Zibomo Sprint Safe is {otp}. \
         Please do not share this OTP with anyone. Regards, Appprotech."
    )
}

pub fn collect_pin_message(locker_number: i32, pin: &str) -> String {
    format!(
        "Hi, A package has been dropped in zibomo sprint safe for you in \
         locker no {locker_number}. Please use this four digit pin {pin} to \
         pickup your package. Regards, Appprotech."
    )
}

/// msg91 flow API client.
pub struct Msg91Gateway {
    client: reqwest::Client,
    auth_key: String,
    login_template_id: String,
    collect_pin_template_id: String,
}

impl Msg91Gateway {
    const ENDPOINT: &'static str = "https://control.msg91.com/api/v5/flow";

    pub fn new(
        auth_key: String,
        login_template_id: String,
        collect_pin_template_id: String,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build sms http client");

        Self {
            client,
            auth_key,
            login_template_id,
            collect_pin_template_id,
        }
    }

    pub fn new_from_env() -> Self {
        Self::new(
            std::env::var("SMS_AUTH_KEY")
                .expect("Cannot retreive SMS_AUTH_KEY from environment variable."),
            std::env::var("SMS_LOGIN_TEMPLATE_ID")
                .expect("Cannot retreive SMS_LOGIN_TEMPLATE_ID from environment variable."),
            std::env::var("SMS_COLLECT_PIN_TEMPLATE_ID")
                .expect("Cannot retreive SMS_COLLECT_PIN_TEMPLATE_ID from environment variable."),
        )
    }

    async fn dispatch(&self, template_id: &str, recipient: serde_json::Value) -> Result<(), Error> {
        let response = self
            .client
            .post(Self::ENDPOINT)
            .header("authkey", &self.auth_key)
            .json(&json!({
                "template_id": template_id,
                "recipients": [recipient],
            }))
            .send()
            .await
            .map_err(|err| Error::SmsError(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SmsError(format!("SMS API error: {body}")));
        }

        Ok(())
    }
}

#[axum::async_trait]
impl SmsGateway for Msg91Gateway {
    async fn send_login_message(&self, phone: &str, otp: &str) -> Result<(), Error> {
        tracing::debug!("sending login message: {}", login_message(otp));

        self.dispatch(
            &self.login_template_id,
            json!({ "mobiles": phone, "OTP": otp }),
        )
        .await
    }

    async fn send_collect_pin_message(
        &self,
        phone: &str,
        pin: &str,
        locker_number: i32,
    ) -> Result<(), Error> {
        tracing::debug!(
            "sending collect pin message: {}",
            collect_pin_message(locker_number, pin)
        );

        self.dispatch(
            &self.collect_pin_template_id,
            json!({ "mobiles": phone, "var1": pin, "var2": locker_number }),
        )
        .await
    }
}

/// Development gateway: logs the message that would have been sent.
pub struct ConsoleSms;

#[axum::async_trait]
impl SmsGateway for ConsoleSms {
    async fn send_login_message(&self, phone: &str, otp: &str) -> Result<(), Error> {
        tracing::info!(
            "message would have been sent to {phone}: {}",
            login_message(otp)
        );
        Ok(())
    }

    async fn send_collect_pin_message(
        &self,
        phone: &str,
        pin: &str,
        locker_number: i32,
    ) -> Result<(), Error> {
        tracing::info!(
            "message would have been sent to {phone}: {}",
            collect_pin_message(locker_number, pin)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_codes() {
        let msg = login_message("123456");
        assert!(msg.contains("123456"));

        let msg = collect_pin_message(7, "1234");
        assert!(msg.contains("locker no 7"));
        assert!(msg.contains("1234"));
    }

    #[tokio::test]
    async fn console_gateway_always_succeeds() {
        let sms = ConsoleSms;
        sms.send_login_message("+14155552671", "123456").await.unwrap();
        sms.send_collect_pin_message("+14155552671", "1234", 3)
            .await
            .unwrap();
    }
}
