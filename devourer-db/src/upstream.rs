use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use miette::Diagnostic;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, Row};

use crate::record::{Cell, Record};

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("invalid upstream database url")]
    BadUrl(#[source] tokio_postgres::Error),

    #[error("could not build the upstream connection pool")]
    CreatePool(#[from] deadpool_postgres::BuildError),

    #[error("could not get an upstream connection")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("upstream query failed")]
    Query(#[from] tokio_postgres::Error),

    #[error("upstream query exceeded the {0}s statement deadline")]
    StatementTimeout(u64),

    #[error("column `{column}` has unsupported type `{ty}`")]
    UnsupportedType { column: String, ty: String },

    #[error("table `{table}` has no configured column `{column}`")]
    MissingColumn { table: String, column: String },

    #[error("column `{column}` does not hold a timestamp")]
    NotATimestamp { column: String },

    #[error("record consumer went away mid-stream")]
    ChannelClosed,

    #[error("fetch task exited abnormally")]
    Join(#[source] tokio::task::JoinError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] devourer_kv::KvError),
}

/// The upstream columnar database, reduced to the two query shapes the
/// fetchers need. Tests substitute scripted implementations.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Runs `sql` with `LIMIT`/`OFFSET` appended, bounded by `deadline`.
    async fn query_page(
        &self,
        sql: &str,
        limit: i64,
        offset: i64,
        deadline: Duration,
    ) -> Result<Vec<Record>, FetchError>;

    /// Side-lookup query, unpaginated.
    async fn query(&self, sql: &str) -> Result<Vec<Record>, FetchError>;
}

pub struct PgUpstream {
    pool: Pool,
}

impl PgUpstream {
    pub fn new(pool: Pool) -> PgUpstream {
        PgUpstream { pool }
    }

    pub fn from_url(url: &str, max_size: usize) -> Result<PgUpstream, FetchError> {
        let config = tokio_postgres::Config::from_str(url).map_err(FetchError::BadUrl)?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager).max_size(max_size).build()?;
        Ok(PgUpstream { pool })
    }
}

#[async_trait]
impl Upstream for PgUpstream {
    async fn query_page(
        &self,
        sql: &str,
        limit: i64,
        offset: i64,
        deadline: Duration,
    ) -> Result<Vec<Record>, FetchError> {
        let sql = format!("{sql} LIMIT {limit} OFFSET {offset}");
        let client = self.pool.get().await?;
        let rows = tokio::time::timeout(deadline, client.query(&sql, &[]))
            .await
            .map_err(|_| FetchError::StatementTimeout(deadline.as_secs()))??;
        rows.iter().map(row_to_record).collect()
    }

    async fn query(&self, sql: &str) -> Result<Vec<Record>, FetchError> {
        let client = self.pool.get().await?;
        let rows = client.query(sql, &[]).await?;
        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &Row) -> Result<Record, FetchError> {
    let mut cells = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let cell = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(Cell::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?.map(|n| Cell::Int(n as i64))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|n| Cell::Int(n as i64))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(Cell::Int)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)?.map(|f| Cell::Float(f as f64))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)?.map(Cell::Float)
        } else if *ty == Type::NUMERIC {
            row.try_get::<_, Option<Decimal>>(idx)?.map(Cell::Decimal)
        } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
            row.try_get::<_, Option<String>>(idx)?.map(Cell::Text)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(Cell::Timestamp)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(Cell::TimestampTz)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<NaiveDate>>(idx)?.map(Cell::Date)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Cell::Bytes)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(idx)?.map(Cell::Json)
        } else {
            return Err(FetchError::UnsupportedType {
                column: column.name().to_owned(),
                ty: ty.to_string(),
            });
        };
        cells.push((column.name().to_owned(), cell.unwrap_or(Cell::Null)));
    }
    Ok(Record::new(cells))
}
