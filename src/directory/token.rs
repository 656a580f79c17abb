//! Session tokens.
//!
//! Short-lived HS256 tokens issued at login and presented over the
//! signaling socket before any other message. Claims carry the device
//! identity so the socket handler never re-reads the directory for
//! authentication.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::Device;
use crate::errors::CoordinatorError;

/// Claims embedded in a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Device id.
    pub sub: String,
    #[serde(rename = "companyId")]
    pub company_id: String,
    /// Device display name at issue time.
    pub name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies session tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: u64,
}

impl TokenService {
    #[must_use]
    pub fn new(secret: &SecretString, ttl_seconds: u64) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            ttl_seconds,
        }
    }

    /// Issue a token for an authenticated device.
    pub fn issue(&self, device: &Device) -> Result<String, CoordinatorError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: device.id.clone(),
            company_id: device.company_id.clone(),
            name: device.name.clone(),
            iat: now,
            exp: now + self.ttl_seconds as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| CoordinatorError::Internal(format!("token encode failed: {e}")))
    }

    /// Verify a token and return its claims. Expired or tampered tokens
    /// fail with `AuthFailed`.
    pub fn verify(&self, token: &str) -> Result<Claims, CoordinatorError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| CoordinatorError::AuthFailed(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_device() -> Device {
        Device {
            id: "dev_1".to_string(),
            company_id: "co_1".to_string(),
            name: "Truck 7".to_string(),
            account_number: "12345".to_string(),
            password_hash: String::new(),
            created_at: Utc::now(),
        }
    }

    fn service() -> TokenService {
        TokenService::new(&SecretString::from("test-secret-1234567890".to_string()), 3600)
    }

    #[test]
    fn test_issue_and_verify_round_trip() {
        let service = service();
        let token = service.issue(&test_device()).unwrap();
        let claims = service.verify(&token).unwrap();

        assert_eq!(claims.sub, "dev_1");
        assert_eq!(claims.company_id, "co_1");
        assert_eq!(claims.name, "Truck 7");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let token = service().issue(&test_device()).unwrap();
        let other = TokenService::new(&SecretString::from("other-secret".to_string()), 3600);

        assert!(matches!(
            other.verify(&token),
            Err(CoordinatorError::AuthFailed(_))
        ));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(matches!(
            service().verify("not.a.token"),
            Err(CoordinatorError::AuthFailed(_))
        ));
    }
}
