use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolCopyExt, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::PostgresConfig;
use crate::persist::tx::{TxOption, TxOptions};
use crate::persist::types::{PersistError, PersistResult};
use crate::persist::RateStore;
use crate::rates::ExchangeRate;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const INSERT_RATE: &str = r#"
    INSERT INTO rates (
        ask_price, bid_price, ts
    ) VALUES (
        $1, $2, $3
    ) RETURNING id
"#;

/// Pooled access to the rates database.
///
/// Every operation checks a connection out of the pool for the duration of
/// the call; the pool is the only shared state.
pub struct PgClient {
    pool: PgPool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl PgClient {
    /// Builds the pool, applies pending migrations and pings the database.
    /// Fails fast on the first step that does not succeed.
    pub async fn connect(cfg: &PostgresConfig) -> PersistResult<Self> {
        info!(
            host = %cfg.host,
            port = cfg.port,
            db = %cfg.db_name,
            max = cfg.max_conns,
            min = cfg.min_conns,
            "Creating database pool"
        );

        let pool = tokio::time::timeout(
            cfg.connect_timeout(),
            pool_options(cfg).connect_with(connect_options(cfg)),
        )
        .await
        .map_err(|_| PersistError::ConnectTimeout)?
        .map_err(PersistError::Connect)?;

        Self::from_pool(pool, cfg.healthcheck_period()).await
    }

    /// Same as [`connect`](Self::connect) for an already built pool. A zero
    /// `healthcheck_period` disables the periodic health check.
    pub async fn from_pool(pool: PgPool, healthcheck_period: Duration) -> PersistResult<Self> {
        if let Err(e) = MIGRATOR.run(&pool).await {
            pool.close().await;
            return Err(PersistError::Migrate(e));
        }

        if let Err(e) = ping(&pool).await {
            pool.close().await;
            return Err(e);
        }

        info!("Database ready");
        Ok(Self {
            health_task: Mutex::new(spawn_health_check(pool.clone(), healthcheck_period)),
            pool,
        })
    }

    pub async fn ping(&self) -> PersistResult<()> {
        ping(&self.pool).await
    }

    pub async fn exec<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> PersistResult<PgQueryResult> {
        query
            .execute(&self.pool)
            .await
            .map_err(|e| PersistError::query("exec", e))
    }

    pub async fn fetch_all<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> PersistResult<Vec<PgRow>> {
        query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistError::query("query", e))
    }

    /// Errors with `RowNotFound` (wrapped) when the query returns nothing.
    pub async fn fetch_one<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> PersistResult<PgRow> {
        query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PersistError::query("query row", e))
    }

    pub async fn fetch_optional<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> PersistResult<Option<PgRow>> {
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistError::query("query row", e))
    }

    /// Streams `data` into a `COPY ... FROM STDIN` statement and returns the
    /// number of rows copied. On a send failure the copy is aborted.
    pub async fn copy_in(&self, statement: &str, data: &[u8]) -> PersistResult<u64> {
        let mut copy = self
            .pool
            .copy_in_raw(statement)
            .await
            .map_err(|e| PersistError::query("copy from", e))?;

        if let Err(e) = copy.send(data).await {
            if let Err(abort) = copy.abort("send failed").await {
                debug!(error = %abort, "Copy abort reported");
            }
            return Err(PersistError::query("copy from", e));
        }

        copy.finish().await.map_err(|e| PersistError::query("copy from", e))
    }

    /// Runs `f` inside one transaction: commit when it returns `Ok`, roll
    /// back otherwise. `params` are folded in order into the transaction
    /// characteristics.
    ///
    /// ```ignore
    /// client
    ///     .run_in_transaction(&[&TxIsoLevel::Serializable], |conn| {
    ///         Box::pin(async move {
    ///             sqlx::query("DELETE FROM rates WHERE ts < $1")
    ///                 .bind(cutoff)
    ///                 .execute(&mut *conn)
    ///                 .await
    ///                 .map_err(|e| PersistError::query("purge", e))?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_in_transaction<T, F>(&self, params: &[&dyn TxOption], f: F) -> PersistResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, PersistResult<T>> + Send,
    {
        let opts = TxOptions::fold(params);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PersistError::transaction("begin", e))?;

        if let Some(stmt) = opts.setup_statement() {
            debug!(statement = %stmt, "Configuring transaction");
            if let Err(e) = sqlx::raw_sql(&stmt).execute(&mut *tx).await {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Failed to rollback transaction");
                }
                return Err(PersistError::transaction("setup", e));
            }
        }

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| PersistError::transaction("commit", e))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Failed to rollback transaction");
                }
                Err(err)
            }
        }
    }

    /// Stops the health check and closes the pool. New acquisitions fail
    /// with [`PersistError::Closed`]; checked-out connections are waited for.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
        if !self.pool.is_closed() {
            info!("Closing database pool");
        }
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[async_trait::async_trait]
impl RateStore for PgClient {
    #[instrument(skip(self, rate), fields(ts = rate.ts))]
    async fn save_exchange_rate(&self, rate: &mut ExchangeRate) -> PersistResult<()> {
        let id: i64 = sqlx::query_scalar(INSERT_RATE)
            .bind(rate.ask_price)
            .bind(rate.bid_price)
            .bind(rate.ts)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PersistError::query("save exchange rate", e))?;

        rate.id = id;
        debug!(id, "Saved exchange rate");
        Ok(())
    }
}

fn connect_options(cfg: &PostgresConfig) -> PgConnectOptions {
    let opts = PgConnectOptions::new()
        .host(&cfg.host)
        .port(cfg.port)
        .database(&cfg.db_name)
        .username(&cfg.user);

    if cfg.password.is_empty() {
        opts
    } else {
        opts.password(&cfg.password)
    }
}

fn pool_options(cfg: &PostgresConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(cfg.max_conns)
        .min_connections(cfg.min_conns)
        .max_lifetime(cfg.max_conn_lifetime())
        .idle_timeout(cfg.max_conn_idle_time())
        .acquire_timeout(cfg.connect_timeout())
}

async fn ping(pool: &PgPool) -> PersistResult<()> {
    let mut conn = pool.acquire().await.map_err(PersistError::Ping)?;
    conn.ping().await.map_err(PersistError::Ping)
}

fn spawn_health_check(pool: PgPool, period: Duration) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;
            if pool.is_closed() {
                break;
            }
            match ping(&pool).await {
                Ok(()) => debug!(size = pool.size(), idle = pool.num_idle(), "Database health check ok"),
                Err(e) => warn!(error = %e, "Database health check failed"),
            }
        }
    }))
}
