use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use stellar_config::FastStoreConfig;
use stellar_domain::FastStore;
use stellar_errors::{StellarError, StellarResult};
use tracing::{debug, error, info};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const POP_DUE: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #members > 0 then
    redis.call('ZREM', KEYS[1], unpack(members))
end
return members
"#;

/// 基于Redis的快速存储
///
/// 键名由调用方通过 `KeySpace` 生成，这里不再追加前缀。
#[derive(Clone)]
pub struct RedisFastStore {
    conn: ConnectionManager,
    compare_and_delete: Script,
    pop_due: Script,
}

impl RedisFastStore {
    pub async fn connect(config: &FastStoreConfig) -> StellarResult<Self> {
        info!("连接Redis快速存储: {}", config.url);

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StellarError::config_error(format!("无效的Redis地址: {e}")))?;

        let conn = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_seconds),
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| StellarError::Timeout("连接Redis超时".to_string()))??;

        let store = Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            pop_due: Script::new(POP_DUE),
        };
        store.ping().await?;

        info!("Redis快速存储连接成功");
        Ok(store)
    }

    pub async fn ping(&self) -> StellarResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &mut redis::Cmd) -> StellarResult<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(|e| {
            error!("Redis命令执行失败: {e}");
            StellarError::from(e)
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn get(&self, key: &str) -> StellarResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StellarResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = self.query(&mut cmd).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StellarResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = self.query(&mut cmd).await?;
        debug!("SET NX {key} -> {reply:?}");
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StellarResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn delete(&self, key: &str) -> StellarResult<bool> {
        let deleted: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> StellarResult<bool> {
        let count: i64 = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StellarResult<i64> {
        self.query(redis::cmd("INCRBY").arg(key).arg(delta)).await
    }

    async fn push_back(&self, key: &str, value: &str) -> StellarResult<u64> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    async fn push_front(&self, key: &str, value: &str) -> StellarResult<u64> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn pop_front(&self, key: &str) -> StellarResult<Option<String>> {
        self.query(redis::cmd("LPOP").arg(key)).await
    }

    async fn peek_front(&self, key: &str) -> StellarResult<Option<String>> {
        self.query(redis::cmd("LINDEX").arg(key).arg(0)).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> StellarResult<u64> {
        self.query(redis::cmd("LREM").arg(key).arg(0).arg(value))
            .await
    }

    async fn list_len(&self, key: &str) -> StellarResult<u64> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StellarResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> StellarResult<()> {
        let _: i64 = self
            .query(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn zpop_due(&self, key: &str, max_score: i64, limit: usize) -> StellarResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = self
            .pop_due
            .key(key)
            .arg(max_score)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zremove(&self, key: &str, member: &str) -> StellarResult<bool> {
        let removed: i64 = self.query(redis::cmd("ZREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> StellarResult<u64> {
        self.query(redis::cmd("ZCARD").arg(key)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> StellarResult<bool> {
        let added: i64 = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StellarResult<bool> {
        let removed: i64 = self.query(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> StellarResult<Vec<String>> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(key)).await?;
        members.sort();
        Ok(members)
    }

    async fn publish(&self, channel: &str, message: &str) -> StellarResult<u64> {
        self.query(redis::cmd("PUBLISH").arg(channel).arg(message))
            .await
    }
}
