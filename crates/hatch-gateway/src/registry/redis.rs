//! Redis-backed registry store.
//!
//! Records are JSON values under `hatch:tunnel:{device}` with a `PX` expiry,
//! so Redis drops unrefreshed records on its own. Conditional writes run as
//! Lua scripts so each check-and-write is atomic on the server.

use super::{conflict, now_ms, RegistryStore, TunnelRecord};
use async_trait::async_trait;
use hatch_core::{HatchError, HatchResult};
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::sync::OnceCell;

const KEY_PREFIX: &str = "hatch:tunnel:";

// KEYS[1] = record key; ARGV[1] = instance id, ARGV[2] = new record JSON, ARGV[3] = ttl ms
const REGISTER_LUA: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur then
  local rec = cjson.decode(cur)
  if rec.owner_instance_id ~= ARGV[1] then
    return {0, cur}
  end
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return {1, ARGV[2]}
"#;

// KEYS[1] = record key; ARGV[1] = instance id, ARGV[2] = now ms
const HEARTBEAT_LUA: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then
  return {-1, ''}
end
local rec = cjson.decode(cur)
if rec.owner_instance_id ~= ARGV[1] then
  return {0, cur}
end
rec.last_heartbeat = tonumber(ARGV[2])
local out = cjson.encode(rec)
redis.call('SET', KEYS[1], out, 'PX', rec.ttl_ms)
return {1, out}
"#;

// KEYS[1] = record key; ARGV[1] = expected owner
const DELETE_IF_OWNER_LUA: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then
  return 0
end
local rec = cjson.decode(cur)
if rec.owner_instance_id ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

pub struct RedisRegistryStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    register: Script,
    heartbeat: Script,
    delete_if_owner: Script,
}

impl RedisRegistryStore {
    pub fn connect(url: &str) -> HatchResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            register: Script::new(REGISTER_LUA),
            heartbeat: Script::new(HEARTBEAT_LUA),
            delete_if_owner: Script::new(DELETE_IF_OWNER_LUA),
        })
    }

    async fn conn(&self) -> HatchResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_connection_manager()
                    .await
                    .map_err(store_err)
            })
            .await?;
        Ok(conn.clone())
    }
}

fn key(device_id: &str) -> String {
    format!("{KEY_PREFIX}{device_id}")
}

fn store_err(e: redis::RedisError) -> HatchError {
    HatchError::Store(e.to_string())
}

fn decode(json: &str) -> HatchResult<TunnelRecord> {
    serde_json::from_str(json).map_err(|e| HatchError::Store(format!("bad tunnel record: {e}")))
}

#[async_trait]
impl RegistryStore for RedisRegistryStore {
    async fn register(
        &self,
        device_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> HatchResult<TunnelRecord> {
        let mut conn = self.conn().await?;
        let record = TunnelRecord::new(device_id, instance_id, ttl);
        let json = serde_json::to_string(&record)
            .map_err(|e| HatchError::Store(e.to_string()))?;
        let (ok, current): (i64, String) = self
            .register
            .key(key(device_id))
            .arg(instance_id)
            .arg(&json)
            .arg(record.ttl_ms.max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if ok == 1 {
            Ok(record)
        } else {
            let owner = decode(&current)?.owner_instance_id;
            Err(conflict(device_id, &owner))
        }
    }

    async fn heartbeat(&self, device_id: &str, instance_id: &str) -> HatchResult<TunnelRecord> {
        let mut conn = self.conn().await?;
        let (status, current): (i64, String) = self
            .heartbeat
            .key(key(device_id))
            .arg(instance_id)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        match status {
            1 => decode(&current),
            0 => Err(HatchError::NotOwner(device_id.to_string())),
            _ => Err(HatchError::Expired(device_id.to_string())),
        }
    }

    async fn lookup(&self, device_id: &str) -> HatchResult<TunnelRecord> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key(device_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        match value {
            Some(json) => decode(&json),
            None => Err(HatchError::NotFound(format!("no tunnel for device {device_id}"))),
        }
    }

    async fn unregister(&self, device_id: &str, instance_id: &str) -> HatchResult<bool> {
        self.evict(device_id, instance_id).await
    }

    async fn evict(&self, device_id: &str, expected_owner: &str) -> HatchResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .delete_if_owner
            .key(key(device_id))
            .arg(expected_owner)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_device() {
        assert_eq!(key("dev-1"), "hatch:tunnel:dev-1");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(RedisRegistryStore::connect("not a url").is_err());
    }

    #[test]
    fn stored_records_decode() {
        let record = TunnelRecord::new("d1", "gw-a", Duration::from_secs(30));
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(decode(&json).unwrap(), record);
        assert!(matches!(decode("{}"), Err(HatchError::Store(_))));
    }
}
