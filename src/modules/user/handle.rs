use actix_web::{get, post, web, HttpRequest};
use uuid::Uuid;

use crate::{
    api::{error, success},
    middlewares::get_identity,
    modules::{
        presence::{model::PresenceInfo, service::PresenceService},
        user::{
            model::{PresenceQuery, UserProfile, UserWithPresence},
            service::UserService,
        },
    },
    utils::ValidatedJson,
};

#[get("/profile")]
pub async fn get_profile(
    user_service: web::Data<UserService>,
    req: HttpRequest,
) -> Result<success::Success<UserProfile>, error::Error> {
    let id = get_identity(&req)?.user_id;
    let user = user_service.get_profile(id).await?;
    Ok(success::Success::ok(Some(user)).message("Profile retrieved successfully"))
}

#[get("/{id:[0-9a-fA-F-]{36}}")]
pub async fn get_user(
    user_service: web::Data<UserService>,
    presence_service: web::Data<PresenceService>,
    user_id: web::Path<Uuid>,
) -> Result<success::Success<UserWithPresence>, error::Error> {
    let user_id = user_id.into_inner();
    let profile = user_service.get_profile(user_id).await?;

    let presence = presence_service
        .online_status_batch(&[user_id])
        .await?
        .into_iter()
        .next()
        .unwrap_or(PresenceInfo { user_id, is_online: false, last_seen: None });

    Ok(success::Success::ok(Some(UserWithPresence { profile, presence }))
        .message("User retrieved successfully"))
}

#[post("")]
pub async fn query_presence(
    presence_service: web::Data<PresenceService>,
    body: ValidatedJson<PresenceQuery>,
) -> Result<success::Success<Vec<PresenceInfo>>, error::Error> {
    let users = presence_service.online_status_batch(&body.0.user_ids).await?;
    Ok(success::Success::ok(Some(users)).message("Presence retrieved successfully"))
}
