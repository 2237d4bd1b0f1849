use sqlx::types::Json;
use uuid::Uuid;

use crate::{
    api::error,
    modules::message::{
        model::{InsertMessage, MessagePage},
        repository::MessageRepository,
        schema::{MessageEntity, ReactionEntity},
    },
};

#[derive(Clone)]
pub struct MessageRepositoryPg {
    pool: sqlx::PgPool,
}

impl MessageRepositoryPg {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

/// Escapes LIKE wildcards so user input matches literally.
fn like_pattern(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait::async_trait]
impl MessageRepository for MessageRepositoryPg {
    async fn find_by_id(&self, id: i64) -> Result<Option<MessageEntity>, error::SystemError> {
        let message = sqlx::query_as::<_, MessageEntity>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(message)
    }

    async fn create(&self, message: &InsertMessage) -> Result<MessageEntity, error::SystemError> {
        let mut tx = self.pool.begin().await?;

        let attachments =
            if message.attachments.is_empty() { None } else { Some(Json(&message.attachments)) };

        let entity = sqlx::query_as::<_, MessageEntity>(
            r#"
            INSERT INTO messages (conversation_id, sender_id, body, attachments, reply_to_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(&message.body)
        .bind(attachments)
        .bind(message.reply_to_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
            .bind(message.conversation_id)
            .bind(entity.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(entity)
    }

    async fn update_body(
        &self,
        id: i64,
        sender_id: &Uuid,
        body: &str,
    ) -> Result<Option<MessageEntity>, error::SystemError> {
        let message = sqlx::query_as::<_, MessageEntity>(
            r#"
            UPDATE messages
            SET body = $3, edited = TRUE, edited_at = NOW()
            WHERE id = $1 AND sender_id = $2 AND deleted = FALSE
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(sender_id)
        .bind(body)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    async fn soft_delete(&self, id: i64) -> Result<Option<MessageEntity>, error::SystemError> {
        let message = sqlx::query_as::<_, MessageEntity>(
            r#"
            UPDATE messages
            SET deleted = TRUE, deleted_at = NOW(), body = NULL, attachments = NULL
            WHERE id = $1 AND deleted = FALSE
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    async fn upsert_reaction(
        &self,
        message_id: i64,
        user_id: &Uuid,
        reaction_type: &str,
    ) -> Result<ReactionEntity, error::SystemError> {
        let reaction = sqlx::query_as::<_, ReactionEntity>(
            r#"
            INSERT INTO reactions (message_id, user_id, reaction_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, user_id)
            DO UPDATE SET reaction_type = EXCLUDED.reaction_type, created_at = NOW()
            RETURNING *
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(reaction_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(reaction)
    }

    async fn delete_reaction(
        &self,
        message_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError> {
        let removed = sqlx::query("DELETE FROM reactions WHERE message_id = $1 AND user_id = $2")
            .bind(message_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(removed > 0)
    }

    async fn find_page(
        &self,
        conversation_id: i64,
        page: &MessagePage,
    ) -> Result<Vec<MessageEntity>, error::SystemError> {
        let messages = sqlx::query_as::<_, MessageEntity>(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = $1
              AND ($2::BIGINT IS NULL OR id < $2)
              AND ($3::BIGINT IS NULL OR id > $3)
            ORDER BY id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(conversation_id)
        .bind(page.before_id)
        .bind(page.after_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    async fn find_reactions(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<ReactionEntity>, error::SystemError> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        let reactions = sqlx::query_as::<_, ReactionEntity>(
            r#"
            SELECT * FROM reactions
            WHERE message_id = ANY($1)
            ORDER BY created_at
            "#,
        )
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(reactions)
    }

    async fn search(
        &self,
        user_id: &Uuid,
        text: &str,
        conversation_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageEntity>, error::SystemError> {
        let messages = sqlx::query_as::<_, MessageEntity>(
            r#"
            SELECT m.* FROM messages m
            JOIN participants p ON p.conversation_id = m.conversation_id AND p.user_id = $1
            WHERE m.deleted = FALSE
              AND m.body ILIKE $2
              AND ($3::BIGINT IS NULL OR m.conversation_id = $3)
            ORDER BY m.id DESC
            LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(like_pattern(text))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }
}
