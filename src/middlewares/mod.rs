use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error, HttpMessage, HttpRequest,
};

use crate::{
    api::error,
    modules::user::{
        identity::{Identity, IdentityProvider},
        service::UserService,
    },
};

/// Verifies the bearer token, mirrors the profile locally and stores the
/// `Identity` in the request extensions.
pub async fn authentication<B>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<B>, Error>
where
    B: MessageBody + 'static,
{
    let auth = req.headers().get("Authorization").and_then(|h| h.to_str().ok());
    let token = match auth.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(t) => t.trim().to_string(),
        None => {
            return Err(error::Error::unauthorized("Token Invalid or Expired").into());
        }
    };

    let provider = req
        .app_data::<web::Data<dyn IdentityProvider>>()
        .ok_or(error::Error::InternalServer)?
        .clone();
    let identity = provider.verify(&token).map_err(error::Error::from)?;

    if let Some(users) = req.app_data::<web::Data<UserService>>().cloned() {
        users.sync_identity(&identity).await.map_err(error::Error::from)?;
    }

    req.extensions_mut().insert(identity);

    next.call(req).await
}

pub fn get_identity(req: &HttpRequest) -> Result<Identity, error::Error> {
    let extensions = req.extensions();

    let identity = extensions
        .get::<Identity>()
        .ok_or_else(|| error::Error::unauthorized("Unauthorized"))?
        .clone();

    Ok(identity)
}
