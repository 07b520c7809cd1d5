use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("connect to database: timed out")]
    ConnectTimeout,

    #[error("apply migrations: {0}")]
    Migrate(#[source] sqlx::migrate::MigrateError),

    #[error("ping database: {0}")]
    Ping(#[source] sqlx::Error),

    #[error("{op}: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("transaction {stage}: {source}")]
    Transaction {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("connection pool is closed")]
    Closed,
}

impl PersistError {
    pub(crate) fn query(op: &'static str, source: sqlx::Error) -> Self {
        match source {
            sqlx::Error::PoolClosed => PersistError::Closed,
            source => PersistError::Query { op, source },
        }
    }

    pub(crate) fn transaction(stage: &'static str, source: sqlx::Error) -> Self {
        match source {
            sqlx::Error::PoolClosed => PersistError::Closed,
            source => PersistError::Transaction { stage, source },
        }
    }
}

pub type PersistResult<T> = Result<T, PersistError>;
