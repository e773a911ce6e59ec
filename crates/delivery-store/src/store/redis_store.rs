//! # Redis Store
//!
//! Networked [`Store`] on Redis.
//!
//! Layout per collection `set` under namespace `ns`:
//!
//! ```text
//! ns:set                 SET of record ids (scan source)
//! ns:set:<id>            HASH { gen, bins }   bins = JSON field map
//! ns:set:geo:<field>     GEO  id -> point     one per indexed field
//! ```
//!
//! Writes run as a Lua script so the generation check, the record replace
//! and the geo index maintenance happen atomically. Points the geo index
//! would reject are refused before the script runs, since Redis does not
//! undo a script's earlier writes when a later command fails.
//!
//! An I/O failure marks the store disconnected; a background task PINGs
//! through the connection manager until the server answers again.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use delivery_domain::Location;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError, Script};
use tokio::task::JoinSet;

use super::{PutOutcome, ScanCallback, Store, check_indexable};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::record::{Bins, Record, Value};

/// KEYS: record, members, geo keys...
/// ARGV: expected, bins json, id, then (present, lon, lat) per geo key.
static PUT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = tonumber(redis.call('HGET', KEYS[1], 'gen') or '0')
local expected = tonumber(ARGV[1])
if expected ~= 0 and current ~= expected then
  return {0, current}
end
local version = current + 1
redis.call('HSET', KEYS[1], 'gen', version, 'bins', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
for i = 3, #KEYS do
  local base = 4 + (i - 3) * 3
  if ARGV[base] == '1' then
    redis.call('GEOADD', KEYS[i], ARGV[base + 1], ARGV[base + 2], ARGV[3])
  else
    redis.call('ZREM', KEYS[i], ARGV[3])
  end
end
return {1, version}
",
    )
});

/// How often a lost connection is checked again.
const RECONNECT_PING_INTERVAL: Duration = Duration::from_millis(500);

/// Connection liveness shared by the store and its scan workers.
#[derive(Clone)]
struct Liveness {
    up: Arc<AtomicBool>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            up: Arc::new(AtomicBool::new(true)),
        }
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Mark the link down and call `ping` until it answers. Only the
    /// call that takes the link down starts pinging.
    fn mark_down<F, Fut>(&self, mut ping: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if !self.up.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Redis connection lost; pinging until it answers");
        let up = Arc::clone(&self.up);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_PING_INTERVAL).await;
                if ping().await {
                    up.store(true, Ordering::SeqCst);
                    tracing::info!("Redis connection restored");
                    return;
                }
            }
        });
    }
}

/// Redis-backed store
pub struct RedisStore {
    conn: ConnectionManager,
    config: StoreConfig,
    liveness: Liveness,
    geo_fields: DashMap<String, Vec<String>>,
}

impl RedisStore {
    /// Connect and verify the server answers.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        tracing::info!(url = %config.url, namespace = %config.namespace, "Redis connected");
        Ok(Self {
            conn,
            config,
            liveness: Liveness::new(),
            geo_fields: DashMap::new(),
        })
    }

    fn members_key(&self, set: &str) -> String {
        format!("{}:{set}", self.config.namespace)
    }

    fn record_key(&self, set: &str, id: i64) -> String {
        format!("{}:{set}:{id}", self.config.namespace)
    }

    fn geo_key(&self, set: &str, field: &str) -> String {
        format!("{}:{set}:geo:{field}", self.config.namespace)
    }

    fn indexed_fields(&self, set: &str) -> Vec<String> {
        self.geo_fields
            .get(set)
            .map(|fields| fields.value().clone())
            .unwrap_or_default()
    }

    /// Map a Redis error onto the store taxonomy, tracking liveness.
    fn fail(&self, op: &'static str, set: &str, err: &RedisError) -> StoreError {
        fail(&self.liveness, &self.conn, op, set, err)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    /// Fetch `ids` with `scan_workers` concurrent tasks and hand each record
    /// to `callback`. With `stop`, a `Break` keeps further records from being
    /// delivered; fetches already in flight still complete.
    async fn deliver(
        &self,
        op: &'static str,
        set: &str,
        ids: Vec<i64>,
        callback: &ScanCallback,
        stop: Option<Arc<AtomicBool>>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let workers = self.config.scan_workers.max(1);
        let mut shares: Vec<Vec<i64>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, id) in ids.into_iter().enumerate() {
            shares[i % workers].push(id);
        }

        let mut tasks = JoinSet::new();
        for share in shares.into_iter().filter(|share| !share.is_empty()) {
            let mut conn = self.conn.clone();
            let callback = Arc::clone(callback);
            let stop = stop.clone();
            let liveness = self.liveness.clone();
            let keys: Vec<(i64, String)> = share
                .into_iter()
                .map(|id| (id, self.record_key(set, id)))
                .collect();
            let set = set.to_string();

            tasks.spawn(async move {
                for (id, key) in keys {
                    if stop.as_ref().is_some_and(|s| s.load(Ordering::Relaxed)) {
                        break;
                    }
                    let fetched: redis::RedisResult<(Option<u32>, Option<String>)> = redis::cmd("HMGET")
                        .arg(&key)
                        .arg("gen")
                        .arg("bins")
                        .query_async(&mut conn)
                        .await;
                    let fields = match fetched {
                        Ok(fields) => fields,
                        Err(e) => return Err(fail(&liveness, &conn, op, &set, &e)),
                    };
                    // Deleted between listing and fetching.
                    let Some(record) = decode(fields)? else {
                        continue;
                    };
                    let flow = callback(id, record);
                    if let (ControlFlow::Break(()), Some(stop)) = (flow, &stop) {
                        stop.store(true, Ordering::Relaxed);
                    }
                }
                Ok::<(), StoreError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined.map_err(StoreError::from).and_then(|r| r) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Classify `err`; a lost link marks the store down and starts pinging.
fn fail(liveness: &Liveness, conn: &ConnectionManager, op: &'static str, set: &str, err: &RedisError) -> StoreError {
    let error = classify(op, set, err);
    if matches!(error, StoreError::Connection(_)) {
        let conn = conn.clone();
        liveness.mark_down(move || {
            let mut conn = conn.clone();
            async move {
                let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
        });
    }
    error
}

fn classify(op: &'static str, set: &str, err: &RedisError) -> StoreError {
    if matches!(err.kind(), ErrorKind::TryAgain | ErrorKind::BusyLoadingError) || err.is_timeout() {
        return StoreError::Transient(err.to_string());
    }
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return StoreError::Connection(err.to_string());
    }
    StoreError::Redis {
        op,
        collection: set.to_string(),
        code: err.code().unwrap_or("ERR").to_string(),
        message: err.to_string(),
    }
}

fn decode((generation, bins): (Option<u32>, Option<String>)) -> Result<Option<Record>> {
    let Some(bins) = bins else {
        return Ok(None);
    };
    let bins: Bins = serde_json::from_str(&bins)?;
    Ok(Some(Record::new(bins, generation.unwrap_or(0))))
}

#[async_trait]
impl Store for RedisStore {
    fn kind(&self) -> &'static str {
        "Redis store"
    }

    fn is_connected(&self) -> bool {
        self.liveness.is_up()
    }

    async fn create_geo_index(&self, set: &str, field: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut fields = self.geo_fields.entry(set.to_string()).or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
        Ok(())
    }

    async fn scan_once(&self, set: &str, callback: ScanCallback) -> Result<()> {
        self.ensure_connected()?;
        let members = self.members_key(set);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        loop {
            let (next, ids): (u64, Vec<i64>) = redis::cmd("SSCAN")
                .arg(&members)
                .arg(cursor)
                .arg("COUNT")
                .arg(self.config.scan_batch)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.fail("scan", set, &e))?;
            self.deliver("scan", set, ids, &callback, None).await?;
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    async fn get(&self, set: &str, id: i64) -> Result<Option<Record>> {
        self.ensure_connected()?;
        let mut conn = self.conn.clone();
        let fields: (Option<u32>, Option<String>) = redis::cmd("HMGET")
            .arg(self.record_key(set, id))
            .arg("gen")
            .arg("bins")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("get", set, &e))?;
        decode(fields)
    }

    async fn put(
        &self,
        set: &str,
        id: i64,
        bins: &Bins,
        expected_version: u32,
    ) -> Result<PutOutcome> {
        self.ensure_connected()?;
        let fields = self.indexed_fields(set);
        for field in &fields {
            if let Some(Value::Geo(point)) = bins.get(field) {
                check_indexable(set, id, field, point)?;
            }
        }
        let json = serde_json::to_string(bins)?;

        let mut invocation = PUT_SCRIPT.key(self.record_key(set, id));
        invocation.key(self.members_key(set));
        for field in &fields {
            invocation.key(self.geo_key(set, field));
        }
        invocation.arg(expected_version).arg(json).arg(id);
        for field in &fields {
            match bins.get(field) {
                Some(Value::Geo(point)) => invocation.arg("1").arg(point.x).arg(point.y),
                _ => invocation.arg("0").arg(0).arg(0),
            };
        }

        let mut conn = self.conn.clone();
        let (written, version): (i64, u32) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.fail("put", set, &e))?;
        Ok(if written == 1 {
            PutOutcome::Written { version }
        } else {
            PutOutcome::Conflict { current: version }
        })
    }

    async fn geo_radius_query(
        &self,
        set: &str,
        field: &str,
        center: Location,
        radius_meters: f64,
        callback: ScanCallback,
    ) -> Result<()> {
        self.ensure_connected()?;
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = redis::cmd("GEOSEARCH")
            .arg(self.geo_key(set, field))
            .arg("FROMLONLAT")
            .arg(center.x)
            .arg(center.y)
            .arg("BYRADIUS")
            .arg(radius_meters)
            .arg("m")
            .arg("ASC")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("geo query", set, &e))?;
        let stop = Arc::new(AtomicBool::new(false));
        self.deliver("geo query", set, ids, &callback, Some(stop)).await
    }

    async fn clear(&self, set: &str) -> Result<u64> {
        self.ensure_connected()?;
        let members = self.members_key(set);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, ids): (u64, Vec<i64>) = redis::cmd("SSCAN")
                .arg(&members)
                .arg(cursor)
                .arg("COUNT")
                .arg(self.config.scan_batch)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.fail("clear", set, &e))?;
            if !ids.is_empty() {
                let keys: Vec<String> = ids.iter().map(|&id| self.record_key(set, id)).collect();
                let deleted: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| self.fail("clear", set, &e))?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut keys = vec![members];
        keys.extend(self.indexed_fields(set).iter().map(|f| self.geo_key(set, f)));
        let _: u64 = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("clear", set, &e))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_classify_transient_errors() {
        let try_again = RedisError::from((ErrorKind::TryAgain, "cluster slot moving"));
        assert!(classify("scan", "jobs", &try_again).is_transient());

        let loading = RedisError::from((ErrorKind::BusyLoadingError, "dataset loading"));
        assert!(classify("scan", "jobs", &loading).is_transient());

        let timeout = RedisError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"));
        assert!(classify("get", "jobs", &timeout).is_transient());
    }

    #[test]
    fn test_classify_lost_link() {
        let reset = RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(classify("put", "jobs", &reset), StoreError::Connection(_)));

        let refused = RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(classify("put", "jobs", &refused), StoreError::Connection(_)));
    }

    #[test]
    fn test_classify_keeps_operation_context() {
        let err = RedisError::from((ErrorKind::ResponseError, "invalid longitude,latitude pair"));
        match classify("put", "jobs", &err) {
            StoreError::Redis { op, collection, code, .. } => {
                assert_eq!(op, "put");
                assert_eq!(collection, "jobs");
                assert_eq!(code, "ERR");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_fields() {
        assert_eq!(decode((None, None)).unwrap(), None);

        let record = decode((Some(3), Some(r#"{"state":{"str":"Waiting"}}"#.to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(record.generation, 3);
        assert_eq!(record.str("state"), Ok("Waiting"));

        assert!(matches!(
            decode((Some(1), Some("not json".to_string()))),
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_recovers_once_ping_answers() {
        let liveness = Liveness::new();
        let pings = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&pings);
        liveness.mark_down(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { attempt >= 3 }
        });
        // Already down: no second ping loop.
        liveness.mark_down(|| async { true });
        assert!(!liveness.is_up());

        tokio::time::sleep(RECONNECT_PING_INTERVAL * 2 + Duration::from_millis(10)).await;
        assert!(!liveness.is_up());

        tokio::time::sleep(RECONNECT_PING_INTERVAL).await;
        assert!(liveness.is_up());
        assert_eq!(pings.load(Ordering::SeqCst), 3);
    }

    fn waiting_at(location: Location) -> Bins {
        let mut bins = Bins::new();
        bins.insert("state".into(), Value::Str("Waiting".into()));
        bins.insert("Waiting".into(), Value::Geo(location));
        bins
    }

    async fn ids_near(store: &RedisStore, center: Location) -> Vec<i64> {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ScanCallback = Arc::new(move |id, _| {
            sink.lock().unwrap().push(id);
            ControlFlow::Continue(())
        });
        store
            .geo_radius_query("jobs", "Waiting", center, 1_000.0, callback)
            .await
            .unwrap();
        let ids = seen.lock().unwrap().clone();
        ids
    }

    /// Needs a Redis server at `REDIS_URL` (default `redis://127.0.0.1:6379`).
    #[tokio::test]
    #[ignore]
    async fn test_put_script_against_server() {
        let config = StoreConfig {
            namespace: "delivery-store-test".into(),
            ..StoreConfig::from_env()
        };
        let store = RedisStore::connect(config).await.unwrap();
        store.create_geo_index("jobs", "Waiting").await.unwrap();
        store.clear("jobs").await.unwrap();

        let here = Location::new(-122.0, 37.0);
        assert_eq!(
            store.put("jobs", 1, &waiting_at(here), 0).await.unwrap(),
            PutOutcome::Written { version: 1 }
        );
        assert_eq!(ids_near(&store, here).await, vec![1]);

        assert_eq!(
            store.put("jobs", 1, &waiting_at(here), 5).await.unwrap(),
            PutOutcome::Conflict { current: 1 }
        );

        // Out of the index's range: refused with nothing written.
        assert!(matches!(
            store.put("jobs", 1, &waiting_at(Location::new(0.0, 86.0)), 1).await,
            Err(StoreError::Unindexable { .. })
        ));
        assert_eq!(store.get("jobs", 1).await.unwrap().unwrap().generation, 1);

        let mut moved = Bins::new();
        moved.insert("state".into(), Value::Str("InProcess".into()));
        assert_eq!(
            store.put("jobs", 1, &moved, 1).await.unwrap(),
            PutOutcome::Written { version: 2 }
        );
        assert!(ids_near(&store, here).await.is_empty());

        assert_eq!(store.clear("jobs").await.unwrap(), 1);
        assert!(store.is_connected());
    }
}
