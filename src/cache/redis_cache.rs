use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::FromRedisValue;
use tokio::sync::{Mutex, Semaphore};

use super::{CacheBackend, CacheError};
use crate::utils::env::env_var;

const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// How to reach Redis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedisTopology {
    Standalone(String),
    Cluster(Vec<String>),
    /// Master discovered through `SENTINEL get-master-addr-by-name`.
    Sentinel {
        nodes: Vec<String>,
        service_name: String,
    },
}

#[derive(Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub topology: RedisTopology,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: Option<i64>,
    pub tls: bool,
    pub max_connections: usize,
    pub namespace: Option<String>,
}

impl fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSettings")
            .field("topology", &self.topology)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("tls", &self.tls)
            .field("max_connections", &self.max_connections)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisSettings {
    pub fn standalone(url: impl Into<String>) -> Self {
        Self {
            topology: RedisTopology::Standalone(url.into()),
            username: None,
            password: None,
            db: None,
            tls: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Topology from the process environment: cluster nodes win over sentinel
    /// nodes, which win over a URL or host/port.
    pub fn from_env() -> Result<Self, CacheError> {
        Self::from_lookup(env_var)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CacheError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = lookup("REDIS_USERNAME");
        let password = lookup("REDIS_PASSWORD");
        let db = match lookup("REDIS_DB") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| CacheError::Config(format!("REDIS_DB is not an integer: {raw}")))?,
            ),
            None => None,
        };
        let tls = lookup("REDIS_SSL")
            .is_some_and(|raw| matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
        let max_connections = match lookup("REDIS_MAX_CONNECTIONS") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                CacheError::Config(format!("REDIS_MAX_CONNECTIONS is not an integer: {raw}"))
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let topology = if let Some(raw) = lookup("REDIS_CLUSTER_NODES") {
            RedisTopology::Cluster(parse_cluster_nodes(&raw)?)
        } else if let Some(raw) = lookup("REDIS_SENTINEL_NODES") {
            let nodes = parse_node_list(&raw);
            if nodes.is_empty() {
                return Err(CacheError::Config("REDIS_SENTINEL_NODES is empty".to_string()));
            }
            RedisTopology::Sentinel {
                nodes,
                service_name: lookup("REDIS_SERVICE_NAME").unwrap_or_else(|| "mymaster".to_string()),
            }
        } else if let Some(url) = lookup("REDIS_URL") {
            RedisTopology::Standalone(url)
        } else if let Some(host) = lookup("REDIS_HOST") {
            let port = lookup("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
            RedisTopology::Standalone(format!("{host}:{port}"))
        } else {
            return Err(CacheError::Config(
                "redis cache needs REDIS_URL, REDIS_HOST, REDIS_CLUSTER_NODES or REDIS_SENTINEL_NODES"
                    .to_string(),
            ));
        };

        Ok(Self {
            topology,
            username,
            password,
            db,
            tls,
            max_connections: max_connections.max(1),
            namespace: None,
        })
    }

    /// Connection URL for `addr`, which is either a full `redis://` URL or `host:port`.
    fn url_for(&self, addr: &str) -> Result<String, CacheError> {
        let raw = if addr.contains("://") {
            addr.to_string()
        } else {
            let scheme = if self.tls { "rediss" } else { "redis" };
            format!("{scheme}://{addr}")
        };
        let mut url = url::Url::parse(&raw)
            .map_err(|err| CacheError::Config(format!("invalid redis address {addr}: {err}")))?;
        let invalid = |_| CacheError::Config(format!("redis address {addr} cannot carry credentials"));
        if let Some(username) = self.username.as_deref() {
            if url.username().is_empty() {
                url.set_username(username).map_err(invalid)?;
            }
        }
        if let Some(password) = self.password.as_deref() {
            if url.password().is_none() {
                url.set_password(Some(password)).map_err(invalid)?;
            }
        }
        if let Some(db) = self.db {
            if matches!(url.path(), "" | "/") {
                url.set_path(&format!("/{db}"));
            }
        }
        Ok(url.to_string())
    }
}

/// Accepts a JSON array of `"host:port"` strings or `{"host", "port"}` objects.
fn parse_cluster_nodes(raw: &str) -> Result<Vec<String>, CacheError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| CacheError::Config(format!("REDIS_CLUSTER_NODES is not JSON: {err}")))?;
    let Some(items) = value.as_array() else {
        return Err(CacheError::Config("REDIS_CLUSTER_NODES must be a JSON array".to_string()));
    };
    let mut nodes = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::String(addr) => nodes.push(addr.clone()),
            serde_json::Value::Object(obj) => {
                let host = obj.get("host").and_then(|v| v.as_str()).unwrap_or("localhost");
                let port = obj
                    .get("port")
                    .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                    .unwrap_or(6379);
                nodes.push(format!("{host}:{port}"));
            }
            _ => {
                return Err(CacheError::Config(format!(
                    "unsupported REDIS_CLUSTER_NODES entry: {item}"
                )));
            }
        }
    }
    if nodes.is_empty() {
        return Err(CacheError::Config("REDIS_CLUSTER_NODES is empty".to_string()));
    }
    Ok(nodes)
}

/// JSON array, or a comma-separated `host:port` list.
fn parse_node_list(raw: &str) -> Vec<String> {
    if let Ok(nodes) = parse_cluster_nodes(raw) {
        return nodes;
    }
    raw.split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
enum Conn {
    Single(redis::aio::MultiplexedConnection),
    Cluster(redis::cluster_async::ClusterConnection),
}

/// Byte cache over Redis with a lazily established, shared connection. Concurrency is
/// capped at `max_connections` in-flight commands.
pub struct RedisCache {
    settings: RedisSettings,
    conn: Mutex<Option<Conn>>,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    pub fn new(settings: RedisSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_connections.max(1)));
        Self {
            settings,
            conn: Mutex::new(None),
            permits,
        }
    }

    pub fn from_env() -> Result<Self, CacheError> {
        Ok(Self::new(RedisSettings::from_env()?))
    }

    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }

    pub(crate) fn key(&self, key: &str) -> String {
        match self.settings.namespace.as_deref() {
            Some(namespace) => format!("{namespace}:{key}"),
            None => key.to_string(),
        }
    }

    pub(crate) fn is_cluster(&self) -> bool {
        matches!(self.settings.topology, RedisTopology::Cluster(_))
    }

    async fn connect(&self) -> Result<Conn, CacheError> {
        match &self.settings.topology {
            RedisTopology::Standalone(addr) => {
                let client = redis::Client::open(self.settings.url_for(addr)?)?;
                Ok(Conn::Single(client.get_multiplexed_async_connection().await?))
            }
            RedisTopology::Cluster(nodes) => {
                let urls = nodes
                    .iter()
                    .map(|node| self.settings.url_for(node))
                    .collect::<Result<Vec<_>, _>>()?;
                let client = redis::cluster::ClusterClient::new(urls)?;
                Ok(Conn::Cluster(client.get_async_connection().await?))
            }
            RedisTopology::Sentinel {
                nodes,
                service_name,
            } => {
                let master = self.discover_master(nodes, service_name).await?;
                let client = redis::Client::open(self.settings.url_for(&master)?)?;
                Ok(Conn::Single(client.get_multiplexed_async_connection().await?))
            }
        }
    }

    async fn discover_master(&self, nodes: &[String], service_name: &str) -> Result<String, CacheError> {
        let mut last_err = None;
        for node in nodes {
            let scheme = if self.settings.tls { "rediss" } else { "redis" };
            let url = if node.contains("://") {
                node.clone()
            } else {
                format!("{scheme}://{node}")
            };
            let attempt = async {
                let client = redis::Client::open(url.as_str())?;
                let mut conn = client.get_multiplexed_async_connection().await?;
                let addr: Option<(String, u16)> = redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(service_name)
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, redis::RedisError>(addr)
            };
            match attempt.await {
                Ok(Some((host, port))) => {
                    tracing::debug!(sentinel = %node, %host, port, "resolved redis master");
                    return Ok(format!("{host}:{port}"));
                }
                Ok(None) => {
                    tracing::warn!(sentinel = %node, service_name, "sentinel does not know the service");
                }
                Err(err) => {
                    tracing::warn!(sentinel = %node, error = %err, "sentinel lookup failed");
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => err.into(),
            None => CacheError::Config(format!("no sentinel knows service {service_name}")),
        })
    }

    async fn connection(&self) -> Result<Conn, CacheError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connect().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Runs `cmd`; a failed command drops the cached connection so the next call reconnects.
    pub(crate) async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, CacheError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CacheError::Config("redis cache is shut down".to_string()))?;
        let result = match self.connection().await? {
            Conn::Single(mut conn) => cmd.query_async(&mut conn).await,
            Conn::Cluster(mut conn) => cmd.query_async(&mut conn).await,
        };
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
                    self.conn.lock().await.take();
                }
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let raw: Option<Vec<u8>> = self.query(redis::cmd("GET").arg(self.key(key))).await?;
        Ok(raw.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1));
        }
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _: i64 = self.query(redis::cmd("DEL").arg(self.key(key))).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // Cluster keys rarely share a slot, so MGET would fail with CROSSSLOT.
        if self.is_cluster() {
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                out.push(self.get(key).await?);
            }
            return Ok(out);
        }
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(self.key(key));
        }
        let raw: Vec<Option<Vec<u8>>> = self.query(&cmd).await?;
        Ok(raw.into_iter().map(|value| value.map(Bytes::from)).collect())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }
}
