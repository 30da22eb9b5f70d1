//! Redis Key-Value Store Adapter
//!
//! Implements [`KeyValueStore`] over a multiplexed, auto-reconnecting Redis
//! connection. The admission check, its compensation and lock release run as
//! Lua scripts so each is a single atomic step on the server.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, instrument};

use crate::domain::ports::{AdmissionCode, KeyValueStore};
use crate::error::Result;
use crate::keys;

/// KEYS[1] stock key, KEYS[2] buyer set, ARGV[1] user id.
/// Returns 0 admitted, 1 out of stock, 2 duplicate.
static ADMISSION_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local stock = tonumber(redis.call('get', KEYS[1]) or '0')
if stock == nil or stock <= 0 then
    return 1
end
if redis.call('sismember', KEYS[2], ARGV[1]) == 1 then
    return 2
end
redis.call('incrby', KEYS[1], -1)
redis.call('sadd', KEYS[2], ARGV[1])
return 0
"#,
    )
});

/// Same keys as the admission script; undoes it if the user is still recorded.
static REVERT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('srem', KEYS[2], ARGV[1]) == 1 then
    redis.call('incrby', KEYS[1], 1)
end
return 0
"#,
    )
});

/// Deletes KEYS[1] only while it still holds the caller's token ARGV[1].
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#,
    )
});

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("Connected to Redis at {}", url);
        Ok(Self { conn })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by the server
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = RELEASE_SCRIPT
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn seckill_admit(&self, voucher_id: u64, user_id: u64) -> Result<AdmissionCode> {
        let mut conn = self.conn.clone();
        let code: i64 = ADMISSION_SCRIPT
            .key(keys::seckill_stock_key(voucher_id))
            .key(keys::seckill_order_key(voucher_id))
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        AdmissionCode::from_script(code)
    }

    #[instrument(skip(self))]
    async fn seckill_revert(&self, voucher_id: u64, user_id: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = REVERT_SCRIPT
            .key(keys::seckill_stock_key(voucher_id))
            .key(keys::seckill_order_key(voucher_id))
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
