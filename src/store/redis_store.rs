use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Cmd, FromRedisValue, RedisError, Script};
use std::{collections::HashMap, future::Future, time::Duration};
use tracing::{debug, info};

use super::{Batch, BatchOp, KvStore, StoreError, StoreResult};

/// HINCRBY + HSET + PEXPIRE only when the hash already exists
const HINCR_EXISTING_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
local i = 4
while i < #ARGV do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  i = i + 2
end
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Traduce un lote a un pipeline MULTI/EXEC: otros workers ven todo o nada
fn pipeline(batch: &Batch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for op in batch.ops() {
        match op {
            BatchOp::HSet { key, fields } => {
                if fields.is_empty() {
                    continue;
                }
                pipe.cmd("HSET").arg(key);
                for (f, v) in fields {
                    pipe.arg(f).arg(v);
                }
                pipe.ignore();
            }
            BatchOp::HIncrBy { key, field, delta } => {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta).ignore();
            }
            BatchOp::Set { key, value, ttl } => {
                pipe.cmd("SET").arg(key).arg(value);
                if let Some(ttl) = ttl {
                    pipe.arg("PX").arg(millis(*ttl));
                }
                pipe.ignore();
            }
            BatchOp::SAdd { key, member } => {
                pipe.cmd("SADD").arg(key).arg(member).ignore();
            }
            BatchOp::ZIncrBy { key, member, delta } => {
                pipe.cmd("ZINCRBY").arg(key).arg(*delta).arg(member).ignore();
            }
            BatchOp::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl)).ignore();
            }
            BatchOp::Del { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
        }
    }
    pipe
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

/// [`KvStore`] backed by Redis through a multiplexed `ConnectionManager`.
///
/// The manager reconnects on its own; every command is bounded by
/// `op_timeout` so a stalled server degrades into [`StoreError::Timeout`]
/// instead of blocking the request.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    incr_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str, op_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))?
            .map_err(map_redis_error)?;

        info!("🔌 Conectado a Redis (timeout por operación: {:?})", op_timeout);

        Ok(Self {
            conn,
            op_timeout,
            incr_script: Script::new(HINCR_EXISTING_LUA),
        })
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T, RedisError>>) -> StoreResult<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_redis_error(e)),
            Err(_) => {
                debug!("⏰ Timeout de Redis tras {:?}", self.op_timeout);
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }

    async fn run<T: FromRedisValue>(&self, cmd: Cmd) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let value: T = cmd.query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let _pong: String = self.run(redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let remaining: i64 = self.run(cmd).await?;
        // -2: no existe, -1: sin expiración
        Ok((remaining >= 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: i64 = self.run(cmd).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis(ttl));
        let applied: i64 = self.run(cmd).await?;
        Ok(applied == 1)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self.run(cmd).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self.run(cmd).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        let mut members: Vec<String> = self.run(cmd).await?;
        members.sort();
        Ok(members)
    }

    async fn hincr_existing(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        touch: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut invocation = self.incr_script.key(key);
        invocation.arg(field).arg(delta).arg(millis(ttl));
        for (f, v) in touch {
            invocation.arg(f).arg(v);
        }

        let mut conn = self.conn.clone();
        let touched: i64 = self
            .bounded(async move {
                let touched: i64 = invocation.invoke_async(&mut conn).await?;
                Ok(touched)
            })
            .await?;
        Ok(touched == 1)
    }

    async fn zrevrange_withscores(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("ZREVRANGE");
        // -1 = hasta el final
        let stop = i64::try_from(limit).map(|l| l - 1).unwrap_or(-1);
        cmd.arg(key).arg(0).arg(stop).arg("WITHSCORES");
        self.run(cmd).await
    }

    async fn execute(&self, batch: Batch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let pipe = pipeline(&batch);
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
