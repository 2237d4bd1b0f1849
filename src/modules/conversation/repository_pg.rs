use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    api::error,
    modules::conversation::{
        model::{AddParticipant, ConversationSummary, ReadAdvance, ReadMarker},
        repository::ConversationRepository,
        schema::{direct_key, ConversationEntity, ParticipantEntity},
    },
};

#[derive(Clone)]
pub struct ConversationPgRepository {
    pool: sqlx::PgPool,
}

impl ConversationPgRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct SummaryRow {
    #[sqlx(flatten)]
    conversation: ConversationEntity,
    participant_ids: Vec<Uuid>,
}

fn marker_of(participant: &ParticipantEntity) -> Option<ReadMarker> {
    Some(ReadMarker {
        conversation_id: participant.conversation_id,
        user_id: participant.user_id,
        last_read_message_id: participant.last_read_message_id?,
        read_at: participant.read_at.unwrap_or(participant.joined_at),
    })
}

#[async_trait::async_trait]
impl ConversationRepository for ConversationPgRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<ConversationEntity>, error::SystemError> {
        let conversation =
            sqlx::query_as::<_, ConversationEntity>("SELECT * FROM conversations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(conversation)
    }

    async fn find_or_create_direct(
        &self,
        user_a: &Uuid,
        user_b: &Uuid,
    ) -> Result<(ConversationEntity, bool), error::SystemError> {
        let key = direct_key(user_a, user_b);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, ConversationEntity>(
            r#"
            INSERT INTO conversations (type, created_by, direct_key)
            VALUES ('direct', $1, $2)
            ON CONFLICT (direct_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(user_a)
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let (conversation, created) = match inserted {
            Some(conversation) => {
                sqlx::query(
                    r#"
                    INSERT INTO participants (conversation_id, user_id)
                    SELECT $1, UNNEST($2::uuid[])
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(conversation.id)
                .bind(vec![*user_a, *user_b])
                .execute(&mut *tx)
                .await?;
                (conversation, true)
            }
            None => {
                // lost the race or already existed; the winner has committed
                let existing = sqlx::query_as::<_, ConversationEntity>(
                    "SELECT * FROM conversations WHERE direct_key = $1",
                )
                .bind(&key)
                .fetch_one(&mut *tx)
                .await?;
                (existing, false)
            }
        };

        tx.commit().await?;
        Ok((conversation, created))
    }

    async fn create_group(
        &self,
        created_by: &Uuid,
        name: &str,
        description: Option<&str>,
        member_ids: &[Uuid],
    ) -> Result<ConversationEntity, error::SystemError> {
        let mut tx = self.pool.begin().await?;

        let conversation = sqlx::query_as::<_, ConversationEntity>(
            r#"
            INSERT INTO conversations (type, name, description, created_by)
            VALUES ('group', $1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(created_by)
        .fetch_one(&mut *tx)
        .await?;

        let mut members = Vec::with_capacity(member_ids.len() + 1);
        members.push(*created_by);
        members.extend(member_ids.iter().filter(|id| *id != created_by));

        sqlx::query(
            r#"
            INSERT INTO participants (conversation_id, user_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(conversation.id)
        .bind(&members)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(conversation)
    }

    async fn is_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM participants WHERE conversation_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn find_participants(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ParticipantEntity>, error::SystemError> {
        let participants = sqlx::query_as::<_, ParticipantEntity>(
            "SELECT * FROM participants WHERE conversation_id = $1 ORDER BY joined_at",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(participants)
    }

    async fn add_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
        max_participants: usize,
    ) -> Result<AddParticipant, error::SystemError> {
        let mut tx = self.pool.begin().await?;

        // held until commit
        sqlx::query("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        let already = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM participants WHERE conversation_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        if already {
            tx.commit().await?;
            return Ok(AddParticipant::AlreadyParticipant);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO participants (conversation_id, user_id)
            SELECT $1, $2
            WHERE (SELECT COUNT(*) FROM participants WHERE conversation_id = $1) < $3
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(max_participants as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(if inserted > 0 { AddParticipant::Added } else { AddParticipant::GroupFull })
    }

    async fn remove_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError> {
        let removed =
            sqlx::query("DELETE FROM participants WHERE conversation_id = $1 AND user_id = $2")
                .bind(conversation_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(removed > 0)
    }

    async fn find_summaries_by_user(
        &self,
        user_id: &Uuid,
    ) -> Result<Vec<ConversationSummary>, error::SystemError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT
                c.*,
                ARRAY_AGG(p2.user_id ORDER BY p2.joined_at) AS participant_ids
            FROM conversations c
            JOIN participants p ON p.conversation_id = c.id AND p.user_id = $1
            JOIN participants p2 ON p2.conversation_id = c.id
            GROUP BY c.id
            ORDER BY c.updated_at DESC, c.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ConversationSummary::from_entity(row.conversation, row.participant_ids))
            .collect())
    }

    async fn advance_read_marker(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
        message_id: i64,
    ) -> Result<ReadAdvance, error::SystemError> {
        let advanced = sqlx::query_as::<_, ParticipantEntity>(
            r#"
            UPDATE participants
            SET last_read_message_id = $3, read_at = NOW()
            WHERE conversation_id = $1
              AND user_id = $2
              AND (last_read_message_id IS NULL OR last_read_message_id < $3)
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(marker) = advanced.as_ref().and_then(marker_of) {
            return Ok(ReadAdvance::Advanced(marker));
        }

        let current = sqlx::query_as::<_, ParticipantEntity>(
            "SELECT * FROM participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match current.as_ref() {
            None => ReadAdvance::NotParticipant,
            Some(p) => match marker_of(p) {
                Some(marker) if marker.last_read_message_id == message_id => {
                    ReadAdvance::Unchanged(marker)
                }
                Some(marker) => ReadAdvance::Regressed { current: marker.last_read_message_id },
                None => ReadAdvance::NotParticipant,
            },
        })
    }
}
