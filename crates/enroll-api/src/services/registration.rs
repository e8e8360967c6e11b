//! User registration and the verification email it schedules.
//!
//! [`EnqueuePolicy`] decides how the user insert and the task enqueue are
//! coupled:
//!
//! - `AfterCommit`: the user row commits first, then the task is
//!   distributed. If the queue is unreachable, [`EnqueueFailureMode`]
//!   decides whether the registration reports failure (the user row stays)
//!   or succeeds without an email.
//! - `Outbox`: the user row and an outbox row commit together; the outbox
//!   relay distributes the task afterwards, so the queue being down never
//!   fails a registration.

use std::sync::Arc;

use enroll_core::models::{
    CreateUserParams, DeliveryOptions, SendVerifyEmailPayload, TaskEnvelope, User,
};
use enroll_core::{AppError, EnqueueFailureMode, EnqueuePolicy};
use enroll_db::{AfterCreate, UserStore};
use enroll_worker::{distribute_send_verify_email, TaskDistributor};

pub struct RegistrationService {
    users: Arc<dyn UserStore>,
    distributor: Arc<dyn TaskDistributor>,
    policy: EnqueuePolicy,
    failure_mode: EnqueueFailureMode,
    verify_email_options: DeliveryOptions,
}

impl RegistrationService {
    pub fn new(
        users: Arc<dyn UserStore>,
        distributor: Arc<dyn TaskDistributor>,
        policy: EnqueuePolicy,
        failure_mode: EnqueueFailureMode,
        verify_email_options: DeliveryOptions,
    ) -> Result<Self, AppError> {
        verify_email_options
            .validate()
            .map_err(|e| AppError::InvalidInput(format!("verify email options: {}", e)))?;

        Ok(Self {
            users,
            distributor,
            policy,
            failure_mode,
            verify_email_options,
        })
    }

    #[tracing::instrument(skip(self, params), fields(user_name = %params.username, policy = ?self.policy))]
    pub async fn register(&self, params: CreateUserParams) -> Result<User, AppError> {
        let user = match self.policy {
            EnqueuePolicy::AfterCommit => {
                self.users
                    .create_user_with_side_effect(params, self.after_create())
                    .await?
            }
            EnqueuePolicy::Outbox => {
                let payload = SendVerifyEmailPayload {
                    user_name: params.username.clone(),
                };
                let envelope = TaskEnvelope::new(&payload, self.verify_email_options)
                    .map_err(|e| AppError::Internal(format!("Failed to encode task: {}", e)))?;
                self.users.create_user_with_outbox(params, &envelope).await?
            }
        };

        tracing::info!(user_name = %user.username, "User registered");
        Ok(user)
    }

    fn after_create(&self) -> AfterCreate {
        let distributor = self.distributor.clone();
        let options = self.verify_email_options;
        let failure_mode = self.failure_mode;

        Box::new(move |user: User| {
            Box::pin(async move {
                let payload = SendVerifyEmailPayload {
                    user_name: user.username,
                };
                match distribute_send_verify_email(distributor.as_ref(), &payload, options).await
                {
                    Ok(task_id) => {
                        tracing::debug!(
                            task_id = %task_id,
                            user_name = %payload.user_name,
                            "Verification email scheduled"
                        );
                        Ok(())
                    }
                    Err(e) => match failure_mode {
                        EnqueueFailureMode::Fail => Err(AppError::Distribution(e.to_string())),
                        EnqueueFailureMode::Degrade => {
                            tracing::warn!(
                                error = %e,
                                user_name = %payload.user_name,
                                "Registered without verification email"
                            );
                            Ok(())
                        }
                    },
                }
            })
        })
    }
}
