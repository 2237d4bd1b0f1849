use actix_web::{web, FromRequest};
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::api::error;

/// Bearer token claims minted by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: uuid::Uuid,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    #[allow(unused)]
    pub fn new(sub: &uuid::Uuid, name: &str, permissions: Vec<String>, exp: u64) -> Self {
        let now = chrono::Utc::now().timestamp() as u64;
        Claims { sub: *sub, name: name.to_string(), permissions, iat: now, exp: now + exp }
    }

    #[allow(unused)]
    pub fn encode(&self, secret: &[u8]) -> Result<String, error::SystemError> {
        let header = Header::new(Algorithm::HS256);
        let token = encode(&header, self, &EncodingKey::from_secret(secret))?;
        Ok(token)
    }

    pub fn decode(token: &str, secret: &[u8]) -> Result<Self, error::SystemError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        let token_data = decode::<Self>(token, &DecodingKey::from_secret(secret), &validation)?;
        Ok(token_data.claims)
    }
}

pub struct ValidatedJson<T>(pub T);

impl<T> FromRequest for ValidatedJson<T>
where
    T: Validate + serde::de::DeserializeOwned + 'static,
{
    type Error = error::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        let fut = web::Json::<T>::from_request(req, payload);

        Box::pin(async move {
            let json = fut.await.map_err(|e| error::Error::bad_request(e.to_string()))?;
            let model = json.into_inner();
            model.validate().map_err(|e| error::Error::bad_request(e.to_string()))?;
            Ok(ValidatedJson(model))
        })
    }
}

pub struct ValidatedQuery<T>(pub T);

impl<T> FromRequest for ValidatedQuery<T>
where
    T: Validate + serde::de::DeserializeOwned + 'static,
{
    type Error = error::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        let query = web::Query::<T>::from_query(req.query_string());

        Box::pin(async move {
            let query = query.map_err(|e| error::Error::bad_request(e.to_string()))?;
            query.validate().map_err(|e| error::Error::bad_request(e.to_string()))?;
            Ok(ValidatedQuery(query.into_inner()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_roundtrip_through_jwt() {
        let secret = b"test-secret";
        let id = uuid::Uuid::now_v7();
        let token = Claims::new(&id, "Ana", vec!["chat:moderate".into()], 60)
            .encode(secret)
            .unwrap();

        let claims = Claims::decode(&token, secret).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.name, "Ana");
        assert_eq!(claims.permissions, vec!["chat:moderate".to_string()]);
    }

    #[test]
    fn test_claims_rejects_wrong_secret() {
        let token = Claims::new(&uuid::Uuid::now_v7(), "Ana", vec![], 60).encode(b"a").unwrap();
        assert!(Claims::decode(&token, b"b").is_err());
    }

    #[test]
    fn test_claims_rejects_expired_token() {
        let mut claims = Claims::new(&uuid::Uuid::now_v7(), "Ana", vec![], 0);
        claims.iat -= 3600;
        claims.exp -= 3600;
        let token = claims.encode(b"s").unwrap();
        assert!(Claims::decode(&token, b"s").is_err());
    }
}
