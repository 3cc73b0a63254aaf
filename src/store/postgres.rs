//! Postgres-backed [`MirrorStore`].
//!
//! Dynamic SQL is limited to table and column identifiers from
//! [`EntityKind::columns`]; every value goes through a bind parameter.
//! Uint values bind as text and cast to `numeric`, so 256-bit amounts
//! survive without precision loss.

use crate::allocation::Allocation;
use crate::config::DatabaseConfig;
use crate::store::{
    address_text, validate_fields, ColumnType, DelegatedVoteRecord, DelegationRecord, EntityKind,
    EntityWrite, Field, FieldValue, MirrorRow, MirrorStore, StoreError, UpsertOutcome,
};

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Open a pool and apply embedded migrations.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, StoreError> {
        // The URL carries credentials; never log it.
        let options = PgConnectOptions::from_str(&cfg.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(max_connections = cfg.max_connections, "postgres store ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_id(qb: &mut QueryBuilder<'_, Postgres>, kind: EntityKind, id: &str) {
    qb.push_bind(id.to_string());
    if kind.id_type() == ColumnType::Numeric {
        qb.push("::numeric");
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Text(s) => {
            qb.push_bind(s.clone());
        }
        FieldValue::Uint(v) => {
            qb.push_bind(v.to_string()).push("::numeric");
        }
        FieldValue::Int(v) => {
            qb.push_bind(*v);
        }
        FieldValue::Bool(v) => {
            qb.push_bind(*v);
        }
        FieldValue::Address(a) => {
            qb.push_bind(address_text(a));
        }
        FieldValue::Timestamp(t) => {
            qb.push_bind(*t);
        }
    }
}

fn upsert_query(write: &EntityWrite) -> QueryBuilder<'static, Postgres> {
    let table = write.kind.table();
    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {table} (id, last_event_block"));
    for f in &write.fields {
        qb.push(", ").push(f.column);
    }
    qb.push(") VALUES (");
    push_id(&mut qb, write.kind, &write.id);
    qb.push(", ").push_bind(write.block as i64);
    for f in &write.fields {
        qb.push(", ");
        push_value(&mut qb, &f.value);
    }
    // A newer write overwrites its columns; an older one only fills columns
    // the row is still missing.
    qb.push(format!(
        ") ON CONFLICT (id) DO UPDATE SET last_event_block = \
         GREATEST({table}.last_event_block, EXCLUDED.last_event_block), updated_at = now()"
    ));
    for f in &write.fields {
        qb.push(format!(
            ", {c} = CASE WHEN {table}.last_event_block <= EXCLUDED.last_event_block \
             THEN EXCLUDED.{c} ELSE COALESCE({table}.{c}, EXCLUDED.{c}) END",
            c = f.column
        ));
    }
    qb.push(" RETURNING (xmax = 0) AS inserted, last_event_block > ")
        .push_bind(write.block as i64)
        .push(" AS stale");
    qb
}

fn select_list(kind: EntityKind) -> String {
    let mut cols = vec![
        "id::text AS id".to_string(),
        "last_event_block".to_string(),
    ];
    for (name, ty) in kind.columns() {
        match ty {
            ColumnType::Timestamp => {
                cols.push(format!("extract(epoch from {name})::bigint::text AS {name}"))
            }
            _ => cols.push(format!("{name}::text AS {name}")),
        }
    }
    cols.join(", ")
}

fn mirror_row(kind: EntityKind, row: &PgRow) -> Result<MirrorRow, StoreError> {
    let mut fields = BTreeMap::new();
    for (name, _) in kind.columns() {
        if let Some(value) = row.try_get::<Option<String>, _>(*name)? {
            fields.insert(name.to_string(), value);
        }
    }
    Ok(MirrorRow {
        kind,
        id: row.try_get("id")?,
        last_event_block: row.try_get::<i64, _>("last_event_block")? as u64,
        fields,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

fn parse_address(s: &str) -> Result<Address, StoreError> {
    Address::from_str(s).map_err(|_| StoreError::Invalid(format!("address {s}")))
}

fn parse_u256(s: &str) -> Result<U256, StoreError> {
    U256::from_str(s).map_err(|_| StoreError::Invalid(format!("uint256 {s}")))
}

fn delegation_from_row(row: &PgRow) -> Result<DelegationRecord, StoreError> {
    let signature: String = row.try_get("signature")?;
    Ok(DelegationRecord {
        delegator: parse_address(&row.try_get::<String, _>("delegator")?)?,
        delegate: parse_address(&row.try_get::<String, _>("delegate")?)?,
        vp_amount: parse_u256(&row.try_get::<String, _>("vp_amount")?)?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        expiry: row.try_get::<i64, _>("expiry")? as u64,
        signature: Bytes::from_str(&signature)
            .map_err(|_| StoreError::Invalid(format!("signature {signature}")))?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

const DELEGATION_COLUMNS: &str = "delegator, delegate, vp_amount::text AS vp_amount, nonce, expiry, \
     signature, created_at, revoked_at";

#[async_trait]
impl MirrorStore for PostgresStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert(&self, write: &EntityWrite) -> Result<UpsertOutcome, StoreError> {
        write.validate()?;
        let mut qb = upsert_query(write);
        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(if row.try_get::<bool, _>("inserted")? {
            UpsertOutcome::Inserted
        } else if row.try_get::<bool, _>("stale")? {
            UpsertOutcome::Stale
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<MirrorRow>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE id = ",
            select_list(kind),
            kind.table()
        ));
        push_id(&mut qb, kind, id);
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.map(|r| mirror_row(kind, &r)).transpose()
    }

    async fn active_ids(
        &self,
        kind: EntityKind,
        statuses: &[&str],
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        if !kind.has_status() {
            return Err(StoreError::UnknownColumn {
                kind,
                column: "status".to_string(),
            });
        }
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT id::text AS id FROM {} WHERE status = ANY(",
            kind.table()
        ));
        qb.push_bind(statuses).push(")");
        if let Some(after) = after {
            qb.push(" AND id > ");
            push_id(&mut qb, kind, after);
        }
        qb.push(" ORDER BY id LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn update_fields(&self, kind: EntityKind, id: &str, fields: &[Field]) -> Result<(), StoreError> {
        validate_fields(kind, fields)?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("UPDATE {} SET updated_at = now()", kind.table()));
        for f in fields {
            qb.push(format!(", {} = ", f.column));
            push_value(&mut qb, &f.value);
        }
        qb.push(" WHERE id = ");
        push_id(&mut qb, kind, id);
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn count(&self, kind: EntityKind, status: Option<&str>) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(*) AS n FROM {}", kind.table()));
        if let Some(status) = status {
            if !kind.has_status() {
                return Err(StoreError::UnknownColumn {
                    kind,
                    column: "status".to_string(),
                });
            }
            qb.push(" WHERE status = ").push_bind(status.to_string());
        }
        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn is_delegate_opted_in(&self, delegate: Address) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT opted_in FROM delegate_opt_ins WHERE delegate = $1")
            .bind(address_text(&delegate))
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => r.try_get("opted_in")?,
            None => false,
        })
    }

    async fn set_delegate_opt_in(&self, delegate: Address, opted_in: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO delegate_opt_ins (delegate, opted_in) VALUES ($1, $2)
               ON CONFLICT (delegate) DO UPDATE SET opted_in = EXCLUDED.opted_in, updated_at = now()"#,
        )
        .bind(address_text(&delegate))
        .bind(opted_in)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn max_delegation_nonce(&self, delegator: Address) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT MAX(nonce) AS max_nonce FROM delegations_v2 WHERE delegator = $1")
            .bind(address_text(&delegator))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("max_nonce")?.map(|n| n as u64))
    }

    async fn insert_delegation(&self, record: &DelegationRecord, now: u64) -> Result<(), StoreError> {
        let delegator = address_text(&record.delegator);
        let mut tx = self.pool.begin().await?;

        if record.is_full() {
            sqlx::query(
                r#"UPDATE delegations_v2 SET revoked_at = $2
                   WHERE delegator = $1 AND vp_amount = 0 AND revoked_at IS NULL AND expiry > $3"#,
            )
            .bind(&delegator)
            .bind(record.created_at)
            .bind(now as i64)
            .execute(&mut *tx)
            .await?;
        }

        let insert = sqlx::query(
            r#"INSERT INTO delegations_v2
                 (delegator, delegate, vp_amount, nonce, expiry, signature, created_at)
               VALUES ($1, $2, $3::numeric, $4, $5, $6, $7)"#,
        )
        .bind(&delegator)
        .bind(address_text(&record.delegate))
        .bind(record.vp_amount.to_string())
        .bind(record.nonce as i64)
        .bind(record.expiry as i64)
        .bind(record.signature.to_string())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await;
        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(StoreError::NonceConflict {
                    delegator: record.delegator,
                    nonce: record.nonce,
                });
            }
            return Err(err.into());
        }

        tx.commit().await?;
        Ok(())
    }

    async fn revoke_delegations(
        &self,
        delegator: Address,
        delegate: Option<Address>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE delegations_v2 SET revoked_at = $3
               WHERE delegator = $1 AND ($2::text IS NULL OR delegate = $2) AND revoked_at IS NULL"#,
        )
        .bind(address_text(&delegator))
        .bind(delegate.as_ref().map(address_text))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn active_delegations(&self, delegator: Address, now: u64) -> Result<Vec<DelegationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS} FROM delegations_v2 \
             WHERE delegator = $1 AND revoked_at IS NULL AND expiry > $2 ORDER BY nonce"
        ))
        .bind(address_text(&delegator))
        .bind(now as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delegation_from_row).collect()
    }

    async fn insert_delegated_vote(&self, record: &DelegatedVoteRecord) -> Result<(), StoreError> {
        let allocations = serde_json::to_string::<Vec<Allocation>>(&record.allocations)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO delegated_votes
                 (proposal_id, delegate, support, amount, allocations_hash, allocations, tx_hash, created_at)
               VALUES ($1::numeric, $2, $3, $4::numeric, $5, $6::jsonb, $7, $8)
               ON CONFLICT (proposal_id, delegate, allocations_hash) DO NOTHING"#,
        )
        .bind(record.proposal_id.to_string())
        .bind(address_text(&record.delegate))
        .bind(record.support as i16)
        .bind(record.amount.to_string())
        .bind(record.allocations_hash.to_string())
        .bind(allocations)
        .bind(record.tx_hash.map(|h| h.to_string()))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
