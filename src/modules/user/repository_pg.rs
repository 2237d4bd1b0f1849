use uuid::Uuid;

use crate::{
    api::error,
    modules::user::{repository::UserRepository, schema::UserEntity},
};

#[derive(Clone)]
pub struct UserRepositoryPg {
    pool: sqlx::PgPool,
}

impl UserRepositoryPg {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UserRepository for UserRepositoryPg {
    async fn find_by_id(&self, id: &Uuid) -> Result<Option<UserEntity>, error::SystemError> {
        let user = sqlx::query_as::<_, UserEntity>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_many(&self, ids: &[Uuid]) -> Result<Vec<UserEntity>, error::SystemError> {
        let users = sqlx::query_as::<_, UserEntity>("SELECT * FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    async fn upsert(
        &self,
        id: &Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<bool, error::SystemError> {
        // unchanged rows are not updated
        let rows = sqlx::query(
            r#"
            INSERT INTO users (id, display_name, avatar_url)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                avatar_url   = COALESCE(EXCLUDED.avatar_url, users.avatar_url),
                updated_at   = NOW()
            WHERE users.display_name IS DISTINCT FROM EXCLUDED.display_name
               OR (EXCLUDED.avatar_url IS NOT NULL
                   AND users.avatar_url IS DISTINCT FROM EXCLUDED.avatar_url)
            "#,
        )
        .bind(id)
        .bind(display_name)
        .bind(avatar_url)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }
}
