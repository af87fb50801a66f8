//! The delayed scheduler itself.

use chrono::{DateTime, Utc};
use dq_core::{Codec, ContentKind, DqError, Namespace, Value, key};
use redis::aio::{ConnectionLike, ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

const DEFAULT_PROGRESS_TTL_SECS: u64 = 60;
const YIELD_WARN_THRESHOLD: u32 = 50;

/// A Redis-backed delayed scheduler.
///
/// Cloning a `Scheduler` is cheap, the same way cloning `dq-queue`'s
/// `Queue` is: both share their underlying connection manager rather
/// than opening a fresh connection per clone.
#[derive(Clone)]
pub struct Scheduler {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    namespace: Namespace,
    codec: Codec,
    progress_ttl_secs: u64,
}

impl Scheduler {
    /// Starts building a new [`Scheduler`].
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// The namespace this scheduler operates under.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn connection(&self) -> Result<ConnectionManager, DqError> {
        let manager = self
            .connection
            .get_or_try_init(|| async { self.client.get_connection_manager().await })
            .await?;
        Ok(manager.clone())
    }

    fn pack_key(&self, value: &Value) -> Result<Vec<u8>, DqError> {
        self.codec
            .pack(value)?
            .ok_or_else(|| DqError::config("schedule keys must not pack to null"))
    }

    fn now_score() -> f64 {
        Utc::now().timestamp() as f64
    }

    /// Schedules `key` to fire at `fire_time`.
    ///
    /// If `payload` is `None`, the key itself is stored as the
    /// payload, matching the queue's key-as-payload fallback.
    /// Scheduling a key that is already scheduled overwrites its fire
    /// time and payload. If `expire_time` is set, [`Scheduler::is_expired`]
    /// and `pop_due` will treat the task as gone once that time passes,
    /// even if it was never popped.
    pub async fn schedule(
        &self,
        key: &Value,
        fire_time: DateTime<Utc>,
        expire_time: Option<DateTime<Utc>>,
        payload: Option<&Value>,
    ) -> Result<(), DqError> {
        let packed_key = self.pack_key(key)?;
        let packed_payload = match payload {
            Some(value) => self.codec.pack(value)?,
            None => None,
        }
        .unwrap_or_else(|| packed_key.clone());

        let mut con = self.connection().await?;
        let waiting_key = key::schedule_waiting_key(&self.namespace);
        let payload_key = key::schedule_payload_key(&self.namespace);

        let mut batch = redis::pipe();
        batch.atomic();
        batch
            .zadd(&waiting_key, &packed_key, fire_time.timestamp() as f64)
            .ignore();
        batch.hset(&payload_key, &packed_key, &packed_payload).ignore();
        if let Some(expire_time) = expire_time {
            let expiration_key = key::schedule_expiration_key(&self.namespace);
            batch
                .hset(&expiration_key, &packed_key, expire_time.timestamp() as f64)
                .ignore();
        }
        batch.query_async::<()>(&mut con).await?;
        debug!(namespace = %self.namespace, "scheduled task");
        Ok(())
    }

    /// Removes `key`'s scheduling state entirely: `waiting`,
    /// `inprogress`, `payload`, `expiration`, and `working`.
    pub async fn deschedule(&self, key: &Value) -> Result<(), DqError> {
        let packed_key = self.pack_key(key)?;
        let mut con = self.connection().await?;
        self.clear_value(&mut con, &packed_key).await
    }

    /// Marks a leased task as done. Identical to [`Scheduler::deschedule`];
    /// kept as a distinct name because it reads better at a worker's
    /// call site than `deschedule` does.
    pub async fn complete(&self, key: &Value) -> Result<(), DqError> {
        self.deschedule(key).await
    }

    async fn clear_value<C>(&self, con: &mut C, packed_key: &[u8]) -> Result<(), DqError>
    where
        C: ConnectionLike + Send,
    {
        let waiting_key = key::schedule_waiting_key(&self.namespace);
        let inprogress_key = key::schedule_inprogress_key(&self.namespace);
        let payload_key = key::schedule_payload_key(&self.namespace);
        let expiration_key = key::schedule_expiration_key(&self.namespace);
        let working_key = key::schedule_working_key(&self.namespace);

        let mut batch = redis::pipe();
        batch.atomic();
        batch.zrem(&waiting_key, packed_key).ignore();
        batch.zrem(&inprogress_key, packed_key).ignore();
        batch.hdel(&payload_key, packed_key).ignore();
        batch.hdel(&expiration_key, packed_key).ignore();
        batch.hdel(&working_key, packed_key).ignore();
        batch.query_async::<()>(con).await?;
        Ok(())
    }

    async fn is_expired_packed<C>(&self, con: &mut C, packed_key: &[u8]) -> Result<bool, DqError>
    where
        C: ConnectionLike + Send,
    {
        let expiration_key = key::schedule_expiration_key(&self.namespace);
        let expiration: Option<f64> = con.hget(&expiration_key, packed_key).await?;
        Ok(matches!(expiration, Some(expiration) if expiration <= Self::now_score()))
    }

    /// Whether `expiration[key]` is present and has already passed.
    pub async fn is_expired(&self, key: &Value) -> Result<bool, DqError> {
        let packed_key = self.pack_key(key)?;
        let mut con = self.connection().await?;
        self.is_expired_packed(&mut con, &packed_key).await
    }

    /// Whether `key` currently has a fire time in `waiting` and is not
    /// expired.
    pub async fn is_scheduled(&self, key: &Value) -> Result<bool, DqError> {
        let packed_key = self.pack_key(key)?;
        let mut con = self.connection().await?;
        let waiting_key = key::schedule_waiting_key(&self.namespace);
        let score: Option<f64> = con.zscore(&waiting_key, &packed_key).await?;
        if score.is_none() {
            return Ok(false);
        }
        Ok(!self.is_expired_packed(&mut con, &packed_key).await?)
    }

    /// Non-destructively reads the payload of the earliest due task,
    /// if any is currently due. Never mutates state.
    pub async fn peek_due(&self) -> Result<Option<Value>, DqError> {
        let mut con = self.connection().await?;
        let waiting_key = key::schedule_waiting_key(&self.namespace);
        let due: Vec<(Vec<u8>, f64)> = con.zrange_withscores(&waiting_key, 0, 0).await?;
        let Some((packed_key, score)) = due.into_iter().next() else {
            return Ok(None);
        };
        if score > Self::now_score() {
            return Ok(None);
        }
        let payload_key = key::schedule_payload_key(&self.namespace);
        let raw: Option<Vec<u8>> = con.hget(&payload_key, &packed_key).await?;
        match raw {
            Some(bytes) => Ok(Some(self.codec.unpack(Some(&bytes))?)),
            None => Ok(None),
        }
    }

    /// Pops the earliest due task under `WATCH`/`MULTI`/`EXEC`
    /// contention control: if another caller wins the race for the
    /// same task, this retries against the new state of `waiting`
    /// rather than failing.
    ///
    /// `destructive = true` removes the task outright; otherwise it is
    /// leased into `inprogress` with a `working` expiry of `now +
    /// progress_ttl` (default from the builder, 60s), recoverable by
    /// [`Scheduler::reschedule_dropped_items`] if this caller never
    /// calls [`Scheduler::complete`].
    ///
    /// Returns `(key, payload)`, or `None` if nothing is currently
    /// due. A task whose `expiration` has already passed is cleared
    /// and skipped rather than returned.
    pub async fn pop_due(
        &self,
        progress_ttl: Option<std::time::Duration>,
        destructive: bool,
    ) -> Result<Option<(Value, Value)>, DqError> {
        let progress_ttl_secs = progress_ttl
            .map(|d| d.as_secs_f64())
            .unwrap_or(self.progress_ttl_secs as f64);

        let waiting_key = key::schedule_waiting_key(&self.namespace);
        let inprogress_key = key::schedule_inprogress_key(&self.namespace);
        let payload_key = key::schedule_payload_key(&self.namespace);
        let working_key = key::schedule_working_key(&self.namespace);

        // `WATCH`/`MULTI`/`EXEC` is a multi-round-trip, connection-wide
        // stateful protocol: if this sequence ran over the shared,
        // multiplexed `ConnectionManager`, an unrelated command issued
        // by another clone of this `Scheduler` between our `WATCH` and
        // our `EXEC` could be queued into (or itself start) a
        // transaction on the same underlying connection. A dedicated
        // connection, used only by this call and dropped at its end,
        // keeps the transaction isolated.
        let mut con = self.client.get_multiplexed_async_connection().await?;
        let mut attempts: u32 = 0;

        loop {
            redis::cmd("WATCH")
                .arg(&waiting_key)
                .query_async::<()>(&mut con)
                .await?;

            let due: Vec<(Vec<u8>, f64)> = con.zrange_withscores(&waiting_key, 0, 0).await?;
            let Some((packed_key, fire_time)) = due.into_iter().next() else {
                redis::cmd("UNWATCH").query_async::<()>(&mut con).await?;
                return Ok(None);
            };

            let now = Self::now_score();
            if fire_time > now {
                redis::cmd("UNWATCH").query_async::<()>(&mut con).await?;
                return Ok(None);
            }

            if self.is_expired_packed(&mut con, &packed_key).await? {
                self.clear_value(&mut con, &packed_key).await?;
                continue;
            }

            let raw_payload: Option<Vec<u8>> = con.hget(&payload_key, &packed_key).await?;
            let Some(raw_payload) = raw_payload else {
                warn!(
                    namespace = %self.namespace,
                    "due task has no payload entry, clearing as inconsistent"
                );
                self.clear_value(&mut con, &packed_key).await?;
                continue;
            };

            let mut batch = redis::pipe();
            batch.atomic();
            if destructive {
                batch.zrem(&waiting_key, &packed_key).ignore();
                batch.zrem(&inprogress_key, &packed_key).ignore();
                batch.hdel(&payload_key, &packed_key).ignore();
                batch.hdel(&working_key, &packed_key).ignore();
            } else {
                batch.zrem(&waiting_key, &packed_key).ignore();
                batch.zadd(&inprogress_key, &packed_key, fire_time).ignore();
                batch
                    .hset(&working_key, &packed_key, now + progress_ttl_secs)
                    .ignore();
            }

            let committed: Option<()> = batch.query_async(&mut con).await?;
            match committed {
                Some(()) => {
                    let key_value = self.codec.unpack(Some(&packed_key))?;
                    let payload_value = self.codec.unpack(Some(&raw_payload))?;
                    trace!(namespace = %self.namespace, destructive, attempts, "popped due task");
                    return Ok(Some((key_value, payload_value)));
                }
                None => {
                    attempts += 1;
                    if attempts == YIELD_WARN_THRESHOLD {
                        warn!(namespace = %self.namespace, attempts, "pop_due contending heavily");
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// For each task in `inprogress` whose lease (`working`) has
    /// elapsed, either clears it (if also expired) or returns it to
    /// `waiting` with its original fire time.
    ///
    /// A task whose lease is still live is left untouched. Intended to
    /// run periodically via [`crate::run_reclaim_loop`], the scheduler
    /// analogue of `dq-queue`'s worker-liveness reclamation.
    pub async fn reschedule_dropped_items(&self) -> Result<(), DqError> {
        let mut con = self.connection().await?;
        let inprogress_key = key::schedule_inprogress_key(&self.namespace);
        let working_key = key::schedule_working_key(&self.namespace);
        let waiting_key = key::schedule_waiting_key(&self.namespace);

        let items: Vec<(Vec<u8>, f64)> = con.zrange_withscores(&inprogress_key, 0, -1).await?;
        let now = Self::now_score();

        for (packed_key, fire_time) in items {
            let lease_expiry: Option<f64> = con.hget(&working_key, &packed_key).await?;
            if let Some(expiry) = lease_expiry {
                if expiry > now {
                    continue;
                }
            }

            if self.is_expired_packed(&mut con, &packed_key).await? {
                self.clear_value(&mut con, &packed_key).await?;
                continue;
            }

            let mut batch = redis::pipe();
            batch.atomic();
            batch.zadd(&waiting_key, &packed_key, fire_time).ignore();
            batch.zrem(&inprogress_key, &packed_key).ignore();
            batch.hdel(&working_key, &packed_key).ignore();
            batch.query_async::<()>(&mut con).await?;
            debug!(namespace = %self.namespace, "rescheduled dropped item");
        }
        Ok(())
    }

    /// Cardinality of `waiting`, including tasks not yet due.
    pub async fn count_scheduled(&self) -> Result<u64, DqError> {
        let mut con = self.connection().await?;
        let waiting_key = key::schedule_waiting_key(&self.namespace);
        Ok(con.zcard(&waiting_key).await?)
    }

    /// Extension hook: subscribes to this namespace's pub/sub events
    /// channel. Nothing in this crate publishes to it; it exists so a
    /// deployment can layer notification on top without forking the
    /// crate.
    pub async fn subscribe(&self) -> Result<PubSub, DqError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = key::schedule_events_key(&self.namespace);
        pubsub.subscribe(&channel).await?;
        Ok(pubsub)
    }
}

/// Builder for a [`Scheduler`].
pub struct SchedulerBuilder {
    connection_info: String,
    namespace: Option<Namespace>,
    codec: Option<Codec>,
    progress_ttl_secs: u64,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            connection_info: "redis://127.0.0.1/".to_owned(),
            namespace: None,
            codec: None,
            progress_ttl_secs: DEFAULT_PROGRESS_TTL_SECS,
        }
    }
}

impl SchedulerBuilder {
    /// Sets the Redis server connection URL. Default:
    /// `redis://127.0.0.1/`.
    pub fn server(mut self, connection_info: impl Into<String>) -> Self {
        self.connection_info = connection_info.into();
        self
    }

    /// Sets the namespace (required).
    pub fn namespace(mut self, namespace: impl TryInto<Namespace, Error = DqError>) -> Result<Self, DqError> {
        self.namespace = Some(namespace.try_into()?);
        Ok(self)
    }

    /// Sets the declared content kind, using the default encoding for
    /// that kind (required, unless [`SchedulerBuilder::codec`] is used
    /// instead).
    pub fn content_kind(mut self, kind: ContentKind) -> Self {
        self.codec = Some(Codec::new(kind));
        self
    }

    /// Sets a fully custom codec.
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Sets the default lease duration `pop_due` grants when its own
    /// `progress_ttl` argument is `None`. Default: 60 seconds.
    pub fn progress_ttl(mut self, progress_ttl: std::time::Duration) -> Self {
        self.progress_ttl_secs = progress_ttl.as_secs();
        self
    }

    /// Builds the [`Scheduler`].
    ///
    /// # Errors
    ///
    /// Returns [`DqError::Config`] if no namespace or content kind/codec
    /// was set, or if the connection URL is invalid.
    pub fn build(self) -> Result<Scheduler, DqError> {
        let namespace = self
            .namespace
            .ok_or_else(|| DqError::config("scheduler namespace is required"))?;
        let codec = self
            .codec
            .ok_or_else(|| DqError::config("scheduler content kind or codec is required"))?;
        Ok(Scheduler {
            client: Client::open(self.connection_info)?,
            connection: OnceCell::new(),
            namespace,
            codec,
            progress_ttl_secs: self.progress_ttl_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_namespace() {
        let err = Scheduler::builder()
            .content_kind(ContentKind::String)
            .build()
            .unwrap_err();
        assert!(matches!(err, DqError::Config(_)));
    }

    #[test]
    fn build_requires_codec() {
        let err = Scheduler::builder()
            .namespace("reminders")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, DqError::Config(_)));
    }

    #[test]
    fn build_succeeds_with_namespace_and_kind() {
        let scheduler = Scheduler::builder()
            .namespace("reminders")
            .unwrap()
            .content_kind(ContentKind::String)
            .build()
            .unwrap();
        assert_eq!(scheduler.namespace().as_str(), "reminders");
    }
}
