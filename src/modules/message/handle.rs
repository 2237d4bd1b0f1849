use actix_web::{delete, get, post, put, web, HttpRequest};
use serde_json::{json, Value};

use crate::{
    api::{error, success},
    middlewares::get_identity,
    modules::{
        message::{
            model::{EditMessageBody, MessageView, ReactBody, ReactionView, SearchQuery},
            service::MessageService,
        },
        rate_limit::service::{ActionClass, RateLimitService},
    },
    utils::{ValidatedJson, ValidatedQuery},
};

#[get("/{message_id}")]
pub async fn get_message(
    message_svc: web::Data<MessageService>,
    message_id: web::Path<i64>,
    req: HttpRequest,
) -> Result<success::Success<MessageView>, error::Error> {
    let identity = get_identity(&req)?;
    let message = message_svc.get_message(&identity, message_id.into_inner()).await?;
    Ok(success::Success::ok(Some(message)).message("Successfully retrieved message"))
}

#[put("/{message_id}")]
pub async fn edit_message(
    message_svc: web::Data<MessageService>,
    limiter: web::Data<RateLimitService>,
    message_id: web::Path<i64>,
    body: ValidatedJson<EditMessageBody>,
    req: HttpRequest,
) -> Result<success::Success<MessageView>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let message =
        message_svc.edit(&identity, None, message_id.into_inner(), &body.0.body).await?;
    Ok(success::Success::ok(Some(message)).message("Message edited"))
}

#[delete("/{message_id}")]
pub async fn delete_message(
    message_svc: web::Data<MessageService>,
    limiter: web::Data<RateLimitService>,
    message_id: web::Path<i64>,
    req: HttpRequest,
) -> Result<success::Success<MessageView>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let message = message_svc.delete(&identity, None, message_id.into_inner()).await?;
    Ok(success::Success::ok(Some(message)).message("Message deleted"))
}

#[post("/{message_id}/react")]
pub async fn react(
    message_svc: web::Data<MessageService>,
    limiter: web::Data<RateLimitService>,
    message_id: web::Path<i64>,
    body: ValidatedJson<ReactBody>,
    req: HttpRequest,
) -> Result<success::Success<ReactionView>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let reaction =
        message_svc.react(&identity, None, message_id.into_inner(), &body.0.reaction_type).await?;
    Ok(success::Success::ok(Some(reaction)).message("Reaction saved"))
}

#[delete("/{message_id}/react")]
pub async fn unreact(
    message_svc: web::Data<MessageService>,
    limiter: web::Data<RateLimitService>,
    message_id: web::Path<i64>,
    req: HttpRequest,
) -> Result<success::Success<Value>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let message_id = message_id.into_inner();
    let removed = message_svc.unreact(&identity, None, message_id).await?;
    Ok(success::Success::ok(Some(json!({ "messageId": message_id, "removed": removed })))
        .message("Reaction removed"))
}

#[get("")]
pub async fn search(
    message_svc: web::Data<MessageService>,
    query: ValidatedQuery<SearchQuery>,
    req: HttpRequest,
) -> Result<success::Success<Vec<MessageView>>, error::Error> {
    let identity = get_identity(&req)?;
    let query = query.0;

    let messages =
        message_svc.search(&identity, &query.q, query.conversation_id, query.limit).await?;
    Ok(success::Success::ok(Some(messages)).message("Search completed"))
}
