use actix_web::{delete, get, post, web, HttpRequest};
use uuid::Uuid;

use crate::{
    api::{error, success},
    middlewares::get_identity,
    modules::{
        conversation::{
            model::{
                AddParticipantBody, ConversationDetail, ConversationSummary, MarkReadBody,
                NewDirectConversation, NewGroupConversation, ReadMarker,
            },
            service::ConversationService,
        },
        message::{
            model::{MessageListQuery, MessageView, PostMessageBody},
            service::MessageService,
        },
        rate_limit::service::{ActionClass, RateLimitService},
    },
    utils::{ValidatedJson, ValidatedQuery},
};

#[get("")]
pub async fn get_conversations(
    conversation_svc: web::Data<ConversationService>,
    req: HttpRequest,
) -> Result<success::Success<Vec<ConversationSummary>>, error::Error> {
    let identity = get_identity(&req)?;
    let conversations = conversation_svc.list_for_user(&identity.user_id).await?;
    Ok(success::Success::ok(Some(conversations)).message("Successfully retrieved conversations"))
}

#[get("/{conversation_id}")]
pub async fn get_conversation(
    conversation_svc: web::Data<ConversationService>,
    conversation_id: web::Path<i64>,
    req: HttpRequest,
) -> Result<success::Success<ConversationDetail>, error::Error> {
    let identity = get_identity(&req)?;
    let detail = conversation_svc.get_detail(&identity, conversation_id.into_inner()).await?;
    Ok(success::Success::ok(Some(detail)).message("Successfully retrieved conversation"))
}

#[post("/direct")]
pub async fn create_direct(
    conversation_svc: web::Data<ConversationService>,
    limiter: web::Data<RateLimitService>,
    body: ValidatedJson<NewDirectConversation>,
    req: HttpRequest,
) -> Result<success::Success<ConversationSummary>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let conversation = conversation_svc.create_direct(&identity, body.0.user_id).await?;
    Ok(success::Success::ok(Some(conversation)).message("Successfully opened conversation"))
}

#[post("/group")]
pub async fn create_group(
    conversation_svc: web::Data<ConversationService>,
    limiter: web::Data<RateLimitService>,
    body: ValidatedJson<NewGroupConversation>,
    req: HttpRequest,
) -> Result<success::Success<ConversationSummary>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let body = body.0;
    let conversation = conversation_svc
        .create_group(&identity, &body.name, body.description.as_deref(), &body.member_ids)
        .await?;
    Ok(success::Success::created(Some(conversation)).message("Successfully created conversation"))
}

#[post("/{conversation_id}/participants")]
pub async fn add_participant(
    conversation_svc: web::Data<ConversationService>,
    limiter: web::Data<RateLimitService>,
    conversation_id: web::Path<i64>,
    body: ValidatedJson<AddParticipantBody>,
    req: HttpRequest,
) -> Result<success::Success<()>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    conversation_svc.add_participant(&identity, conversation_id.into_inner(), body.0.user_id).await?;
    Ok(success::Success::ok(None).message("Participant added"))
}

#[delete("/{conversation_id}/participants/{user_id}")]
pub async fn remove_participant(
    conversation_svc: web::Data<ConversationService>,
    limiter: web::Data<RateLimitService>,
    path: web::Path<(i64, Uuid)>,
    req: HttpRequest,
) -> Result<success::Success<()>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let (conversation_id, user_id) = path.into_inner();
    conversation_svc.remove_participant(&identity, conversation_id, user_id).await?;
    Ok(success::Success::ok(None).message("Participant removed"))
}

#[get("/{conversation_id}/messages")]
pub async fn get_messages(
    message_svc: web::Data<MessageService>,
    conversation_id: web::Path<i64>,
    query: ValidatedQuery<MessageListQuery>,
    req: HttpRequest,
) -> Result<success::Success<Vec<MessageView>>, error::Error> {
    let identity = get_identity(&req)?;
    let query = query.0;

    let messages = message_svc
        .list(
            &identity,
            conversation_id.into_inner(),
            query.limit,
            query.offset,
            query.before_id,
            query.after_id,
        )
        .await?;
    Ok(success::Success::ok(Some(messages)).message("Successfully retrieved messages"))
}

#[post("/{conversation_id}/messages")]
pub async fn post_message(
    message_svc: web::Data<MessageService>,
    limiter: web::Data<RateLimitService>,
    conversation_id: web::Path<i64>,
    body: ValidatedJson<PostMessageBody>,
    req: HttpRequest,
) -> Result<success::Success<MessageView>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Message, &identity.user_id.to_string()).await?;

    let message =
        message_svc.send(&identity, None, conversation_id.into_inner(), body.0.into()).await?;
    Ok(success::Success::created(Some(message)).message("Message sent"))
}

#[post("/{conversation_id}/read")]
pub async fn mark_read(
    conversation_svc: web::Data<ConversationService>,
    limiter: web::Data<RateLimitService>,
    conversation_id: web::Path<i64>,
    body: ValidatedJson<MarkReadBody>,
    req: HttpRequest,
) -> Result<success::Success<ReadMarker>, error::Error> {
    let identity = get_identity(&req)?;
    limiter.check(ActionClass::Mutation, &identity.user_id.to_string()).await?;

    let marker = conversation_svc
        .mark_read(&identity, None, conversation_id.into_inner(), body.0.last_read_message_id)
        .await?;
    Ok(success::Success::ok(Some(marker)).message("Read marker updated"))
}
