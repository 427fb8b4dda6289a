use rand::Rng;
use time::{Duration, OffsetDateTime};

use crate::app::Environment;
use crate::error::Error;
use crate::sms::SmsClient;

use super::user::UserCollection;

/// An issued code is only accepted within this window.
pub const OTP_TTL: Duration = Duration::minutes(5);

/// Six digit login code. Development always issues the same code so
/// kiosks and tests do not depend on an SMS inbox.
pub fn generate_otp_code(env: Environment) -> String {
    if env.is_development() {
        return "123456".to_string();
    }

    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

/// Four digit pickup pin, same development rule as [`generate_otp_code`].
pub fn generate_collect_pin(env: Environment) -> String {
    if env.is_development() {
        return "1234".to_string();
    }

    rand::thread_rng().gen_range(1_000..=9_999).to_string()
}

pub fn is_code_fresh(issued_at: bson::DateTime, now: OffsetDateTime) -> bool {
    let issued_at: OffsetDateTime = issued_at.into();
    now - issued_at <= OTP_TTL
}

/// Stores a fresh OTP on the user matched by phone and sends it out.
/// Re-issuing overwrites the previous code, so only the latest one counts.
pub async fn issue_phone_otp(
    users: &UserCollection,
    sms: &SmsClient,
    env: Environment,
    phone: &str,
) -> Result<(), Error> {
    let otp = generate_otp_code(env);

    let result = users
        .update_one(
            bson::doc! { "phone": phone },
            bson::doc! {
                "$set": {
                    "otp": &otp,
                    "otpIssuedAt": bson::DateTime::now(),
                }
            },
            None,
        )
        .await?;

    if result.matched_count == 0 {
        return Err(Error::UserNotFound);
    }

    if env.is_development() {
        tracing::info!("issued development otp for {phone}");
        return Ok(());
    }

    sms.send_login_message(phone, &otp).await
}

/// Same as [`issue_phone_otp`] but keyed on the email address.
pub async fn issue_email_otp(
    users: &UserCollection,
    env: Environment,
    email: &str,
) -> Result<(), Error> {
    let otp = generate_otp_code(env);

    let result = users
        .update_one(
            bson::doc! { "email": email },
            bson::doc! {
                "$set": {
                    "emailOtp": &otp,
                    "emailOtpIssuedAt": bson::DateTime::now(),
                }
            },
            None,
        )
        .await?;

    if result.matched_count == 0 {
        return Err(Error::UserNotFound);
    }

    // TODO: deliver through a mail provider once one is provisioned.
    tracing::info!("issued email otp for {email}");

    Ok(())
}

pub fn validate_code(
    stored: Option<&str>,
    issued_at: Option<bson::DateTime>,
    submitted: &str,
) -> bool {
    let (Some(stored), Some(issued_at)) = (stored, issued_at) else {
        return false;
    };

    stored == submitted && is_code_fresh(issued_at, OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_codes_are_fixed() {
        assert_eq!(generate_otp_code(Environment::Development), "123456");
        assert_eq!(generate_collect_pin(Environment::Development), "1234");
    }

    #[test]
    fn production_codes_have_the_right_shape() {
        for _ in 0..32 {
            let otp = generate_otp_code(Environment::Production);
            assert_eq!(otp.len(), 6);
            assert!(otp.bytes().all(|b| b.is_ascii_digit()));

            let pin = generate_collect_pin(Environment::Production);
            assert_eq!(pin.len(), 4);
            assert!(pin.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn codes_expire_after_the_ttl() {
        let now = OffsetDateTime::now_utc();
        let fresh = bson::DateTime::from(now - Duration::minutes(4));
        let stale = bson::DateTime::from(now - Duration::minutes(6));

        assert!(is_code_fresh(fresh, now));
        assert!(!is_code_fresh(stale, now));
    }

    #[test]
    fn validation_requires_match_and_freshness() {
        let issued = Some(bson::DateTime::now());

        assert!(validate_code(Some("123456"), issued, "123456"));
        assert!(!validate_code(Some("123456"), issued, "654321"));
        assert!(!validate_code(None, issued, "123456"));
        assert!(!validate_code(Some("123456"), None, "123456"));
    }
}
