//! The durable work queue itself.

use std::collections::HashMap;
use std::time::Duration;

use dq_core::{Codec, ContentKind, DqError, Namespace, Value, key};
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::config::{PopOutcome, Strategy};

const DEFAULT_WORKER_ID: &str = "global";
const DEFAULT_WORK_TTL: Duration = Duration::from_secs(60);
const ACTIVE_BEACON_VALUE: &str = "active";

/// A durable, Redis-backed work queue.
///
/// Cloning a `Queue` is cheap: it shares its [`ConnectionManager`]
/// (itself multiplexed and cheaply cloneable), so a single instance
/// can be handed to many concurrently spawned workers.
#[derive(Clone)]
pub struct Queue {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    namespace: Namespace,
    codec: Codec,
    worker_id: String,
    strategy: Strategy,
    track_entries: bool,
    track_working_entries: bool,
    work_ttl: Duration,
    pipes: HashMap<String, Queue>,
}

impl Queue {
    /// Starts building a new [`Queue`].
    #[must_use]
    pub fn builder() -> QueueBuilder {
        QueueBuilder::default()
    }

    /// The namespace this queue operates under.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn connection(&self) -> Result<ConnectionManager, DqError> {
        trace!(namespace = %self.namespace, "get connection manager");
        let manager = self
            .connection
            .get_or_try_init(|| async {
                trace!("initialize new redis connection manager");
                self.client.get_connection_manager().await
            })
            .await?;
        Ok(manager.clone())
    }

    fn pack_key(&self, value: &Value) -> Result<Vec<u8>, DqError> {
        self.codec
            .pack(value)?
            .ok_or_else(|| DqError::config("queue keys must not pack to null"))
    }

    fn pack_payload(&self, value: Option<&Value>) -> Result<Option<Vec<u8>>, DqError> {
        Ok(match value {
            Some(value) => self.codec.pack(value)?,
            None => None,
        })
    }

    /// Every operation except `contains`, `size`, `number_in_progress`,
    /// `number_active_workers`, `number_of_entries`, and
    /// `reclaim_tasks` touches liveness: it adds this worker to the
    /// workers set and refreshes its beacon TTL.
    async fn touch_liveness<C>(&self, con: &mut C) -> Result<(), DqError>
    where
        C: ConnectionLike + Send,
    {
        let workers_key = key::queue_workers_key(&self.namespace);
        let active_key = key::queue_active_key(&self.namespace, &self.worker_id);
        redis::pipe()
            .atomic()
            .sadd(&workers_key, &self.worker_id)
            .ignore()
            .set_ex(&active_key, ACTIVE_BEACON_VALUE, self.work_ttl.as_secs())
            .ignore()
            .query_async::<()>(con)
            .await?;
        Ok(())
    }

    /// Pushes `payload` (or nothing, if `None`) onto the queue under
    /// `key`.
    ///
    /// If deduplication is enabled (`track_entries`) and `key` is
    /// already a known entry, the pending list is left untouched; the
    /// entries set and payload hash are still refreshed, so a second
    /// push can overwrite a still-pending payload.
    pub async fn push(&self, key: &Value, payload: Option<&Value>) -> Result<(), DqError> {
        let packed_key = self.pack_key(key)?;
        let packed_payload = self.pack_payload(payload)?;

        let mut con = self.connection().await?;
        self.touch_liveness(&mut con).await?;

        let pending_key = key::queue_pending_key(&self.namespace);
        let entries_key = key::queue_entries_key(&self.namespace);
        let payload_key = key::queue_payload_key(&self.namespace);

        let already_entry = if self.track_entries {
            con.sismember(&entries_key, &packed_key).await?
        } else {
            false
        };

        let mut batch = redis::pipe();
        batch.atomic();
        if !already_entry {
            match self.strategy {
                Strategy::Fifo => {
                    batch.lpush(&pending_key, &packed_key).ignore();
                }
                Strategy::Lifo => {
                    batch.rpush(&pending_key, &packed_key).ignore();
                }
            }
        }
        if self.track_entries {
            batch.sadd(&entries_key, &packed_key).ignore();
        }
        if let Some(packed_payload) = &packed_payload {
            batch.hset(&payload_key, &packed_key, packed_payload).ignore();
        }
        batch.query_async::<()>(&mut con).await?;
        debug!(namespace = %self.namespace, already_entry, "pushed task");
        Ok(())
    }

    /// Pops a task from the queue.
    ///
    /// `destructive = true` removes the task outright. `destructive =
    /// false` leases it into this worker's working-list via an atomic
    /// `RPOPLPUSH`/`BRPOPLPUSH`, so it can later be returned with
    /// [`Queue::complete`] or [`Queue::unpop`], or reclaimed if this
    /// worker dies.
    ///
    /// `blocking = true` uses Redis's blocking variants and suspends
    /// until an element is available.
    pub async fn pop(
        &self,
        destructive: bool,
        blocking: bool,
    ) -> Result<Option<PopOutcome>, DqError> {
        if blocking {
            self.pop_blocking(destructive).await
        } else {
            self.pop_immediate(destructive).await
        }
    }

    async fn pop_immediate(&self, destructive: bool) -> Result<Option<PopOutcome>, DqError> {
        let mut con = self.connection().await?;
        self.touch_liveness(&mut con).await?;

        let pending_key = key::queue_pending_key(&self.namespace);
        let working_key = key::queue_working_key(&self.namespace, &self.worker_id);

        let packed_key: Option<Vec<u8>> = if destructive {
            con.rpop(&pending_key, None).await?
        } else {
            con.rpoplpush(&pending_key, &working_key).await?
        };

        self.finish_pop(&mut con, destructive, false, packed_key).await
    }

    /// `BRPOP`/`BRPOPLPUSH` with timeout 0 block on the connection
    /// they run on until an element arrives. Running them on the
    /// shared, multiplexed `ConnectionManager` other clones of this
    /// `Queue` also issue commands on would stall every other command
    /// multiplexed on that same connection, including the very push
    /// that would satisfy this pop, deadlocking. A dedicated
    /// connection, opened for this call only, keeps the block from
    /// affecting any other caller, the same reasoning
    /// `dq-scheduler::Scheduler::pop_due` applies to its
    /// `WATCH`/`MULTI`/`EXEC` sequence.
    async fn pop_blocking(&self, destructive: bool) -> Result<Option<PopOutcome>, DqError> {
        let mut con = self.client.get_multiplexed_async_connection().await?;
        self.touch_liveness(&mut con).await?;

        let pending_key = key::queue_pending_key(&self.namespace);
        let working_key = key::queue_working_key(&self.namespace, &self.worker_id);

        let packed_key: Option<Vec<u8>> = if destructive {
            let reply: Option<(String, Vec<u8>)> =
                redis::cmd("BRPOP").arg(&pending_key).arg(0).query_async(&mut con).await?;
            reply.map(|(_, value)| value)
        } else {
            redis::cmd("BRPOPLPUSH")
                .arg(&pending_key)
                .arg(&working_key)
                .arg(0)
                .query_async(&mut con)
                .await?
        };

        self.finish_pop(&mut con, destructive, true, packed_key).await
    }

    async fn finish_pop<C>(
        &self,
        con: &mut C,
        destructive: bool,
        blocking: bool,
        packed_key: Option<Vec<u8>>,
    ) -> Result<Option<PopOutcome>, DqError>
    where
        C: ConnectionLike + Send,
    {
        let Some(packed_key) = packed_key else {
            return Ok(None);
        };

        let remove_from_entries = destructive || !self.track_working_entries;
        if self.track_entries && remove_from_entries {
            let entries_key = key::queue_entries_key(&self.namespace);
            let _: () = con.srem(&entries_key, &packed_key).await?;
        }

        let outcome = self.read_outcome(con, packed_key).await?;
        debug!(namespace = %self.namespace, destructive, blocking, "popped task");
        Ok(Some(outcome))
    }

    /// Equivalent to [`Queue::pop`] with `blocking = true`.
    pub async fn blocking_pop(&self, destructive: bool) -> Result<Option<PopOutcome>, DqError> {
        self.pop(destructive, true).await
    }

    async fn read_outcome<C>(&self, con: &mut C, packed_key: Vec<u8>) -> Result<PopOutcome, DqError>
    where
        C: ConnectionLike + Send,
    {
        let payload_key = key::queue_payload_key(&self.namespace);
        let raw_payload: Option<Vec<u8>> = con.hget(&payload_key, &packed_key).await?;
        let key_value = self.codec.unpack(Some(&packed_key))?;
        let payload_value = match raw_payload {
            Some(bytes) => self.codec.unpack(Some(&bytes))?,
            None => key_value.clone(),
        };
        Ok(PopOutcome {
            key: key_value,
            payload: payload_value,
        })
    }

    /// Non-destructively reads the key at the head of the pending
    /// list (the next one [`Queue::pop`] would return), without
    /// touching the payload hash, leasing, or removing it.
    pub async fn peek(&self) -> Result<Option<Value>, DqError> {
        let mut con = self.connection().await?;
        self.touch_liveness(&mut con).await?;

        let pending_key = key::queue_pending_key(&self.namespace);
        let raw: Option<Vec<u8>> = con.lindex(&pending_key, -1).await?;
        let Some(packed_key) = raw else {
            return Ok(None);
        };
        Ok(Some(self.codec.unpack(Some(&packed_key))?))
    }

    /// Tests whether `key` is a known entry (only meaningful when
    /// `track_entries` is enabled). Does not touch liveness.
    pub async fn contains(&self, key: &Value) -> Result<bool, DqError> {
        let packed_key = self.pack_key(key)?;
        let mut con = self.connection().await?;
        let entries_key = key::queue_entries_key(&self.namespace);
        Ok(con.sismember(&entries_key, &packed_key).await?)
    }

    /// Marks `key` as done: removes it from this worker's
    /// working-list, the entries set, and the payload hash.
    ///
    /// If `result` names a configured pipe, the task's (key, payload)
    /// pair is routed into that pipe's queue as part of the same
    /// atomic batch that removes it here.
    ///
    /// Completing a key this worker never leased is a successful
    /// no-op: the `LREM` simply removes zero occurrences.
    pub async fn complete(&self, key: &Value, result: Option<&str>) -> Result<(), DqError> {
        let packed_key = self.pack_key(key)?;
        let mut con = self.connection().await?;
        self.touch_liveness(&mut con).await?;

        let working_key = key::queue_working_key(&self.namespace, &self.worker_id);
        let entries_key = key::queue_entries_key(&self.namespace);
        let payload_key = key::queue_payload_key(&self.namespace);

        let pipe_target = result.and_then(|label| self.pipes.get(label));
        let pipe_payload: Option<Vec<u8>> = if pipe_target.is_some() {
            con.hget(&payload_key, &packed_key).await?
        } else {
            None
        };

        let mut batch = redis::pipe();
        batch.atomic();
        batch.lrem(&working_key, 1, &packed_key).ignore();
        batch.srem(&entries_key, &packed_key).ignore();
        batch.hdel(&payload_key, &packed_key).ignore();

        if let Some(target) = pipe_target {
            let target_pending_key = key::queue_pending_key(&target.namespace);
            let target_payload_key = key::queue_payload_key(&target.namespace);
            let routed_payload = pipe_payload.unwrap_or_else(|| packed_key.clone());
            match target.strategy {
                Strategy::Fifo => {
                    batch.lpush(&target_pending_key, &packed_key).ignore();
                }
                Strategy::Lifo => {
                    batch.rpush(&target_pending_key, &packed_key).ignore();
                }
            }
            batch
                .hset(&target_payload_key, &packed_key, &routed_payload)
                .ignore();
            if target.track_entries {
                let target_entries_key = key::queue_entries_key(&target.namespace);
                batch.sadd(&target_entries_key, &packed_key).ignore();
            }
        }

        batch.query_async::<()>(&mut con).await?;
        debug!(namespace = %self.namespace, result, "completed task");
        Ok(())
    }

    /// Returns a leased task to the pending queue without loss:
    /// removes it from this worker's working-list, prepends it to the
    /// pending list, and re-adds it to the entries set if
    /// deduplication is enabled.
    ///
    /// Unpopping a key this worker never leased is a successful
    /// no-op.
    pub async fn unpop(&self, key: &Value) -> Result<(), DqError> {
        let packed_key = self.pack_key(key)?;
        let mut con = self.connection().await?;
        self.touch_liveness(&mut con).await?;

        let working_key = key::queue_working_key(&self.namespace, &self.worker_id);
        let pending_key = key::queue_pending_key(&self.namespace);
        let entries_key = key::queue_entries_key(&self.namespace);

        let mut batch = redis::pipe();
        batch.atomic();
        batch.lrem(&working_key, 1, &packed_key).ignore();
        batch.lpush(&pending_key, &packed_key).ignore();
        if self.track_entries {
            batch.sadd(&entries_key, &packed_key).ignore();
        }
        batch.query_async::<()>(&mut con).await?;
        Ok(())
    }

    /// Reclaims tasks leased by workers whose liveness beacon has
    /// expired, returning them to the tail of the pending list and
    /// removing the dead worker from the workers set.
    ///
    /// Workers with a live beacon are skipped. A namespace with no
    /// dead workers is a no-op. Does not touch liveness.
    pub async fn reclaim_tasks(&self) -> Result<(), DqError> {
        let mut con = self.connection().await?;
        let workers_key = key::queue_workers_key(&self.namespace);
        let pending_key = key::queue_pending_key(&self.namespace);

        let workers: Vec<String> = con.smembers(&workers_key).await?;
        for worker in workers {
            let active_key = key::queue_active_key(&self.namespace, &worker);
            let alive: bool = con.exists(&active_key).await?;
            if alive {
                continue;
            }

            let working_key = key::queue_working_key(&self.namespace, &worker);
            let mut reclaimed = 0u64;
            loop {
                let rotated: Option<Vec<u8>> = con.rpoplpush(&working_key, &pending_key).await?;
                if rotated.is_none() {
                    break;
                }
                reclaimed += 1;
            }
            let _: () = con.srem(&workers_key, &worker).await?;
            debug!(namespace = %self.namespace, worker = %worker, reclaimed, "reclaimed orphaned worker");
        }
        Ok(())
    }

    /// Deletes all state for this queue's namespace: the pending
    /// list, the entries set, every worker's working-list and this
    /// worker's beacon, and the workers set itself.
    pub async fn clear(&self) -> Result<(), DqError> {
        let mut con = self.connection().await?;
        self.touch_liveness(&mut con).await?;

        let workers_key = key::queue_workers_key(&self.namespace);
        let pending_key = key::queue_pending_key(&self.namespace);
        let entries_key = key::queue_entries_key(&self.namespace);
        let own_working_key = key::queue_working_key(&self.namespace, &self.worker_id);
        let own_active_key = key::queue_active_key(&self.namespace, &self.worker_id);

        let workers: Vec<String> = con.smembers(&workers_key).await?;

        let mut batch = redis::pipe();
        batch.atomic();
        batch.del(&pending_key).ignore();
        batch.del(&entries_key).ignore();
        batch.del(&own_working_key).ignore();
        batch.del(&own_active_key).ignore();
        batch.srem(&workers_key, &self.worker_id).ignore();
        for worker in &workers {
            if worker != &self.worker_id {
                batch.del(key::queue_working_key(&self.namespace, worker)).ignore();
            }
        }
        batch.del(&workers_key).ignore();
        batch.query_async::<()>(&mut con).await?;
        Ok(())
    }

    /// Number of pending (not yet leased) tasks.
    pub async fn size(&self) -> Result<u64, DqError> {
        let mut con = self.connection().await?;
        let pending_key = key::queue_pending_key(&self.namespace);
        Ok(con.llen(&pending_key).await?)
    }

    /// Number of tasks currently leased by this worker.
    pub async fn number_in_progress(&self) -> Result<u64, DqError> {
        let mut con = self.connection().await?;
        let working_key = key::queue_working_key(&self.namespace, &self.worker_id);
        Ok(con.llen(&working_key).await?)
    }

    /// Number of tasks currently leased across every worker known to
    /// this namespace, as opposed to [`Queue::number_in_progress`],
    /// which only counts this worker's own leases.
    pub async fn number_in_progress_all(&self) -> Result<u64, DqError> {
        let mut con = self.connection().await?;
        let workers_key = key::queue_workers_key(&self.namespace);
        let workers: Vec<String> = con.smembers(&workers_key).await?;
        let mut total = 0u64;
        for worker in workers {
            let working_key = key::queue_working_key(&self.namespace, &worker);
            total += con.llen::<_, u64>(&working_key).await?;
        }
        Ok(total)
    }

    /// Number of workers with recorded state in this namespace
    /// (whether or not their beacon is still live).
    pub async fn number_active_workers(&self) -> Result<u64, DqError> {
        let mut con = self.connection().await?;
        let workers_key = key::queue_workers_key(&self.namespace);
        Ok(con.scard(&workers_key).await?)
    }

    /// Number of entries tracked for deduplication.
    pub async fn number_of_entries(&self) -> Result<u64, DqError> {
        let mut con = self.connection().await?;
        let entries_key = key::queue_entries_key(&self.namespace);
        Ok(con.scard(&entries_key).await?)
    }
}

/// Builder for a [`Queue`].
///
/// `namespace` and `content_kind` are required; everything else has
/// the defaults documented on the individual setter.
pub struct QueueBuilder {
    connection_info: String,
    namespace: Option<Namespace>,
    codec: Option<Codec>,
    worker_id: String,
    strategy: Strategy,
    track_entries: bool,
    track_working_entries: bool,
    work_ttl: Duration,
    pipes: HashMap<String, Queue>,
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self {
            connection_info: "redis://127.0.0.1/".to_owned(),
            namespace: None,
            codec: None,
            worker_id: DEFAULT_WORKER_ID.to_owned(),
            strategy: Strategy::default(),
            track_entries: false,
            track_working_entries: true,
            work_ttl: DEFAULT_WORK_TTL,
            pipes: HashMap::new(),
        }
    }
}

impl QueueBuilder {
    /// Sets the Redis server connection URL. Default:
    /// `redis://127.0.0.1/`.
    pub fn server(mut self, connection_info: impl Into<String>) -> Self {
        self.connection_info = connection_info.into();
        self
    }

    /// Sets the namespace (required).
    ///
    /// # Errors
    ///
    /// Returns [`DqError::Config`] if `namespace` is empty.
    pub fn namespace(mut self, namespace: impl TryInto<Namespace, Error = DqError>) -> Result<Self, DqError> {
        self.namespace = Some(namespace.try_into()?);
        Ok(self)
    }

    /// Sets the declared content kind, using the default encoding for
    /// that kind (required, unless [`QueueBuilder::codec`] is used
    /// instead).
    pub fn content_kind(mut self, kind: ContentKind) -> Self {
        self.codec = Some(Codec::new(kind));
        self
    }

    /// Sets a fully custom codec, e.g. one built with
    /// [`Codec::structured_with_hook`].
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Sets this worker's identifier. Default: `"global"`.
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets the push/pop ordering strategy. Default: [`Strategy::Fifo`].
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enables deduplication via the entries set. Default: `false`.
    pub fn track_entries(mut self, track_entries: bool) -> Self {
        self.track_entries = track_entries;
        self
    }

    /// Controls whether a lease keeps the dedup entry. Default: `true`.
    pub fn track_working_entries(mut self, track_working_entries: bool) -> Self {
        self.track_working_entries = track_working_entries;
        self
    }

    /// Sets the liveness-beacon TTL. Default: 60 seconds.
    pub fn work_ttl(mut self, work_ttl: Duration) -> Self {
        self.work_ttl = work_ttl;
        self
    }

    /// Registers a completion-routing pipe: `complete(key,
    /// Some(label))` will push the task into `target` as part of the
    /// same atomic batch.
    pub fn pipe(mut self, label: impl Into<String>, target: Queue) -> Self {
        self.pipes.insert(label.into(), target);
        self
    }

    /// Builds the [`Queue`].
    ///
    /// # Errors
    ///
    /// Returns [`DqError::Config`] if no namespace or content kind/codec
    /// was set, or if the connection URL is invalid.
    pub fn build(self) -> Result<Queue, DqError> {
        let namespace = self
            .namespace
            .ok_or_else(|| DqError::config("queue namespace is required"))?;
        let codec = self
            .codec
            .ok_or_else(|| DqError::config("queue content kind or codec is required"))?;
        Ok(Queue {
            client: Client::open(self.connection_info)?,
            connection: OnceCell::new(),
            namespace,
            codec,
            worker_id: self.worker_id,
            strategy: self.strategy,
            track_entries: self.track_entries,
            track_working_entries: self.track_working_entries,
            work_ttl: self.work_ttl,
            pipes: self.pipes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_namespace() {
        let err = Queue::builder()
            .content_kind(ContentKind::String)
            .build()
            .unwrap_err();
        assert!(matches!(err, DqError::Config(_)));
    }

    #[test]
    fn build_requires_codec() {
        let err = Queue::builder()
            .namespace("stuff")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, DqError::Config(_)));
    }

    #[test]
    fn build_rejects_empty_namespace() {
        let err = Queue::builder().namespace("").unwrap_err();
        assert!(matches!(err, DqError::Config(_)));
    }

    #[test]
    fn build_succeeds_with_namespace_and_kind() {
        let queue = Queue::builder()
            .namespace("stuff")
            .unwrap()
            .content_kind(ContentKind::String)
            .build()
            .unwrap();
        assert_eq!(queue.namespace().as_str(), "stuff");
    }
}
