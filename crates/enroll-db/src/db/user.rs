use enroll_core::error::AppError;
use enroll_core::models::{CreateUserParams, TaskEnvelope, User};
use sqlx::{PgExecutor, PgPool, Postgres};

use crate::db::outbox::insert_outbox_message;
use crate::store::AfterCreate;

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert<'e, E>(executor: E, params: &CreateUserParams) -> Result<User, AppError>
    where
        E: PgExecutor<'e>,
    {
        let user = sqlx::query_as::<Postgres, User>(
            r#"
            INSERT INTO users (username, hashed_password, full_name, email)
            VALUES ($1, $2, $3, $4)
            RETURNING
                username,
                hashed_password,
                full_name,
                email,
                is_email_verified,
                password_changed_at,
                created_at
            "#,
        )
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .fetch_one(executor)
        .await?;

        Ok(user)
    }

    #[tracing::instrument(skip(self, params), fields(user_name = %params.username))]
    pub async fn create_user(&self, params: CreateUserParams) -> Result<User, AppError> {
        let user = Self::insert(&self.pool, &params).await?;
        tracing::info!(user_name = %user.username, "User created");
        Ok(user)
    }

    /// Insert the user, commit, then run `after_create` with the stored row.
    ///
    /// A failing callback fails the whole call even though the user row is
    /// already committed; the caller sees the error and the row stays.
    #[tracing::instrument(skip(self, params, after_create), fields(user_name = %params.username))]
    pub async fn create_user_with_side_effect(
        &self,
        params: CreateUserParams,
        after_create: AfterCreate,
    ) -> Result<User, AppError> {
        let mut tx = self.pool.begin().await?;
        let user = Self::insert(&mut *tx, &params).await?;
        tx.commit().await?;

        tracing::debug!(user_name = %user.username, "User committed, running after-create hook");

        if let Err(e) = after_create(user.clone()).await {
            tracing::error!(
                user_name = %user.username,
                error = %e,
                "After-create hook failed; user row is already committed"
            );
            return Err(e);
        }

        tracing::info!(user_name = %user.username, "User created");
        Ok(user)
    }

    /// Insert the user and an outbox row for `envelope` in one transaction.
    #[tracing::instrument(
        skip(self, params, envelope),
        fields(user_name = %params.username, task_type = %envelope.task_type())
    )]
    pub async fn create_user_with_outbox(
        &self,
        params: CreateUserParams,
        envelope: &TaskEnvelope,
    ) -> Result<User, AppError> {
        let mut tx = self.pool.begin().await?;
        let user = Self::insert(&mut *tx, &params).await?;
        let outbox_id = insert_outbox_message(&mut *tx, envelope).await?;
        tx.commit().await?;

        tracing::info!(
            user_name = %user.username,
            outbox_id = outbox_id,
            "User created with outbox message"
        );
        Ok(user)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_user(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<Postgres, User>(
            r#"
            SELECT
                username,
                hashed_password,
                full_name,
                email,
                is_email_verified,
                password_changed_at,
                created_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }
}
