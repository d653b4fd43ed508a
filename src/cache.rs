//! Client-side local cache — a read-through SQLite layer, not a source of
//! truth. The DHT remains authoritative; this just avoids two things on
//! every process restart: re-fetching a user's transaction log before the
//! first sync round's `prior_log` comparison has anything to compare
//! against, and re-typing peer PEM paths by letting `peer_key`/
//! `share_with_key` CLI arguments reference a saved nickname.

use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("transaction log codec error: {0}")]
    TxLog(#[from] crate::txlog::TxLogError),
}

/// Create the cache tables if they don't already exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            user_id      TEXT PRIMARY KEY,
            log_cbor     BLOB NOT NULL,
            updated_at   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS peer_keys (
            nickname     TEXT PRIMARY KEY,
            public_key_pem TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Load the last-persisted `prior_log` for `user_id`, or an empty log if
/// this is the first run.
pub async fn load_prior_log(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<crate::txlog::TransactionLog, CacheError> {
    let row = sqlx::query("SELECT log_cbor FROM sync_state WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let bytes: Vec<u8> = row.get("log_cbor");
            Ok(crate::txlog::decode(&bytes)?)
        }
        None => Ok(crate::txlog::TransactionLog::new()),
    }
}

/// Persist `log` as the `prior_log` for the next round.
pub async fn store_prior_log(
    pool: &SqlitePool,
    user_id: &str,
    log: &crate::txlog::TransactionLog,
    now_unix: i64,
) -> Result<(), CacheError> {
    let bytes = crate::txlog::encode(log)?;
    sqlx::query(
        "INSERT INTO sync_state (user_id, log_cbor, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET log_cbor = excluded.log_cbor, updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(bytes)
    .bind(now_unix)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remember a peer's PEM-encoded public key under a human-friendly nickname.
pub async fn save_peer_key(
    pool: &SqlitePool,
    nickname: &str,
    public_key_pem: &str,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO peer_keys (nickname, public_key_pem) VALUES (?, ?)
         ON CONFLICT(nickname) DO UPDATE SET public_key_pem = excluded.public_key_pem",
    )
    .bind(nickname)
    .bind(public_key_pem)
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolve a nickname to its saved PEM, if any.
pub async fn lookup_peer_key(
    pool: &SqlitePool,
    nickname: &str,
) -> Result<Option<String>, CacheError> {
    let row = sqlx::query("SELECT public_key_pem FROM peer_keys WHERE nickname = ?")
        .bind(nickname)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("public_key_pem")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txlog::{Operation, TransactionLogEntity};

    async fn in_memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn prior_log_is_empty_before_first_store() {
        let pool = in_memory_pool().await;
        let log = load_prior_log(&pool, "user-a").await.unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn prior_log_round_trips() {
        let pool = in_memory_pool().await;
        let mut log = crate::txlog::TransactionLog::new();
        let mut entity = TransactionLogEntity::new("x.txt");
        entity.append(Operation::Update, crate::identifier::Identifier::from_bytes([1; 20]), 1);
        log.insert("x.txt".into(), entity);

        store_prior_log(&pool, "user-a", &log, 1000).await.unwrap();
        let loaded = load_prior_log(&pool, "user-a").await.unwrap();
        assert_eq!(loaded, log);
    }

    #[tokio::test]
    async fn storing_twice_overwrites_rather_than_erroring() {
        let pool = in_memory_pool().await;
        let log = crate::txlog::TransactionLog::new();
        store_prior_log(&pool, "user-a", &log, 1).await.unwrap();
        store_prior_log(&pool, "user-a", &log, 2).await.unwrap();
    }

    #[tokio::test]
    async fn peer_key_lookup_by_nickname() {
        let pool = in_memory_pool().await;
        assert!(lookup_peer_key(&pool, "bob").await.unwrap().is_none());
        save_peer_key(&pool, "bob", "-----BEGIN PUBLIC KEY-----\n...").await.unwrap();
        let found = lookup_peer_key(&pool, "bob").await.unwrap();
        assert!(found.unwrap().starts_with("-----BEGIN"));
    }
}
