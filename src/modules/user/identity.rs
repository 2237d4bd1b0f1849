use uuid::Uuid;

use crate::{api::error, constants::MODERATOR_PERMISSION, utils::Claims};

/// Verified identity handed to the transport by the identity service.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub permissions: Vec<String>,
}

impl Identity {
    pub fn is_moderator(&self) -> bool {
        self.permissions.iter().any(|p| p == MODERATOR_PERMISSION)
    }
}

pub trait IdentityProvider: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Identity, error::SystemError>;
}

/// Verifies HS256 bearer tokens signed with the shared secret.
pub struct JwtIdentityProvider {
    secret: Vec<u8>,
}

impl JwtIdentityProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn verify(&self, credential: &str) -> Result<Identity, error::SystemError> {
        if self.secret.is_empty() || credential.trim().is_empty() {
            return Err(error::SystemError::unauthenticated("Token Invalid or Expired"));
        }

        let claims = Claims::decode(credential, &self.secret)
            .map_err(|_| error::SystemError::unauthenticated("Token Invalid or Expired"))?;

        let display_name = claims.name.trim();
        if display_name.is_empty() {
            return Err(error::SystemError::unauthenticated("Token has no display name"));
        }

        Ok(Identity {
            user_id: claims.sub,
            display_name: display_name.to_string(),
            permissions: claims.permissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_accepts_valid_token() {
        let provider = JwtIdentityProvider::new("secret");
        let id = Uuid::now_v7();
        let token = Claims::new(&id, " Bao ", vec![MODERATOR_PERMISSION.into()], 60)
            .encode(b"secret")
            .unwrap();

        let identity = provider.verify(&token).unwrap();
        assert_eq!(identity.user_id, id);
        assert_eq!(identity.display_name, "Bao");
        assert!(identity.is_moderator());
    }

    #[test]
    fn test_verify_rejects_garbage_and_empty_secret() {
        let provider = JwtIdentityProvider::new("secret");
        assert!(matches!(
            provider.verify("not-a-jwt"),
            Err(error::SystemError::AuthenticationFailed(_))
        ));

        let token = Claims::new(&Uuid::now_v7(), "Bao", vec![], 60).encode(b"").unwrap();
        let unconfigured = JwtIdentityProvider::new("");
        assert!(unconfigured.verify(&token).is_err());
    }
}
