use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::SessionTokens,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    events::JobEvents,
    mailer::Mailer,
    payments::PaymentGateway,
    storage::ObjectStorage,
    trigger::ProcessingTrigger,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub sessions: SessionTokens,
    pub payments: Arc<dyn PaymentGateway>,
    pub trigger: Arc<dyn ProcessingTrigger>,
    pub mailer: Arc<dyn Mailer>,
    pub events: JobEvents,
}

/// The external collaborators a running service talks to.
pub struct Services {
    pub storage: Arc<dyn ObjectStorage>,
    pub payments: Arc<dyn PaymentGateway>,
    pub trigger: Arc<dyn ProcessingTrigger>,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig, services: Services) -> Self {
        let sessions = SessionTokens::from_config(&config);
        Self {
            pool,
            config: Arc::new(config),
            storage: services.storage,
            sessions,
            payments: services.payments,
            trigger: services.trigger,
            mailer: services.mailer,
            events: JobEvents::default(),
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
