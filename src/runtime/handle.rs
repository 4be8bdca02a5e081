use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use hashbrown::HashMap;
use serde_json::Value;
use tokio::{
    sync::{broadcast, watch},
    time::Duration,
};

use crate::{
    config::ReadOptions,
    core::store::{DbError, DocStore, PollResult, QueryResult},
    op::Op,
    query::poll,
    snapshot::Snapshot,
    types::{DocId, Version},
};

use super::events::StoreEvent;

/// Failure of a handle call.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The store rejected or failed the call.
    #[error(transparent)]
    Db(#[from] DbError),
    /// [`StoreHandle::close`] was called.
    #[error("already closed")]
    AlreadyClosed,
    /// The deferred open failed.
    #[error("store failed to open: {0}")]
    ConnectFailed(String),
    /// The blocking task panicked or was cancelled.
    #[error("store task failed: {0}")]
    TaskFailed(String),
}

impl RuntimeError {
    /// Stable numeric code, where one is defined.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Db(err) => err.code(),
            Self::AlreadyClosed => Some(5101),
            Self::ConnectFailed(_) | Self::TaskFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
enum ConnectState {
    Pending,
    Ready(Arc<DocStore>),
    Failed(String),
}

/// Cloneable async front end to a [`DocStore`].
///
/// Calls run on tokio's blocking pool. Calls issued while a deferred open is
/// still running wait for it to finish.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    state: watch::Receiver<ConnectState>,
    closed: Arc<AtomicBool>,
    events_tx: broadcast::Sender<StoreEvent>,
}

/// Wraps an already open store.
pub fn spawn_store(store: DocStore) -> StoreHandle {
    let (_, state) = watch::channel(ConnectState::Ready(Arc::new(store)));
    new_handle(state)
}

/// Opens a store on the blocking pool. The handle is usable immediately.
pub fn connect<F>(open: F) -> StoreHandle
where
    F: FnOnce() -> Result<DocStore, DbError> + Send + 'static,
{
    let (state_tx, state) = watch::channel(ConnectState::Pending);
    tokio::spawn(async move {
        let next = match tokio::task::spawn_blocking(open).await {
            Ok(Ok(store)) => ConnectState::Ready(Arc::new(store)),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "store open failed");
                ConnectState::Failed(err.to_string())
            }
            Err(err) => ConnectState::Failed(err.to_string()),
        };
        let _ = state_tx.send(next);
    });
    new_handle(state)
}

fn new_handle(state: watch::Receiver<ConnectState>) -> StoreHandle {
    let (events_tx, _) = broadcast::channel::<StoreEvent>(1024);
    StoreHandle {
        state,
        closed: Arc::new(AtomicBool::new(false)),
        events_tx,
    }
}

impl StoreHandle {
    /// Subscribes to commit events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    async fn store(&self) -> Result<Arc<DocStore>, RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::AlreadyClosed);
        }
        let mut state = self.state.clone();
        let current = state
            .wait_for(|s| !matches!(s, ConnectState::Pending))
            .await
            .map_err(|_| RuntimeError::ConnectFailed("opener dropped".to_string()))?
            .clone();
        match current {
            ConnectState::Ready(store) => Ok(store),
            ConnectState::Failed(reason) => Err(RuntimeError::ConnectFailed(reason)),
            ConnectState::Pending => Err(RuntimeError::ConnectFailed("still pending".to_string())),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(&DocStore) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store().await?;
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| RuntimeError::TaskFailed(err.to_string()))?
            .map_err(RuntimeError::from)
    }

    async fn poll_delay(&self) -> Result<(), RuntimeError> {
        let delay = self.store().await?.config().poll_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    /// See [`DocStore::commit`]. Successful commits are broadcast.
    pub async fn commit(
        &self,
        collection: &str,
        id: &str,
        op: Op,
        snapshot: Snapshot,
    ) -> Result<bool, RuntimeError> {
        let (c, i, o) = (collection.to_string(), id.to_string(), op.clone());
        let version = snapshot.v;
        let succeeded = self.run(move |store| store.commit(&c, &i, &o, &snapshot)).await?;
        if succeeded {
            let _ = self.events_tx.send(StoreEvent::Committed {
                collection: collection.to_string(),
                id: id.to_string(),
                version,
                op,
            });
        }
        Ok(succeeded)
    }

    /// See [`DocStore::get_snapshot`].
    pub async fn get_snapshot(
        &self,
        collection: &str,
        id: &str,
        fields: Option<Vec<String>>,
        options: ReadOptions,
    ) -> Result<Snapshot, RuntimeError> {
        let (c, i) = (collection.to_string(), id.to_string());
        self.run(move |store| store.get_snapshot(&c, &i, fields.as_deref(), options))
            .await
    }

    /// See [`DocStore::get_snapshot_bulk`].
    pub async fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: Vec<DocId>,
        fields: Option<Vec<String>>,
        options: ReadOptions,
    ) -> Result<HashMap<DocId, Snapshot>, RuntimeError> {
        let c = collection.to_string();
        self.run(move |store| store.get_snapshot_bulk(&c, &ids, fields.as_deref(), options))
            .await
    }

    /// See [`DocStore::get_ops`].
    pub async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        to: Option<Version>,
        options: ReadOptions,
    ) -> Result<Vec<Op>, RuntimeError> {
        let (c, i) = (collection.to_string(), id.to_string());
        self.run(move |store| store.get_ops(&c, &i, from, to, options)).await
    }

    /// See [`DocStore::get_ops_bulk`].
    pub async fn get_ops_bulk(
        &self,
        collection: &str,
        from_map: HashMap<DocId, Version>,
        to_map: Option<HashMap<DocId, Version>>,
        options: ReadOptions,
    ) -> Result<HashMap<DocId, Vec<Op>>, RuntimeError> {
        let c = collection.to_string();
        self.run(move |store| store.get_ops_bulk(&c, &from_map, to_map.as_ref(), options))
            .await
    }

    /// See [`DocStore::get_ops_to_snapshot`].
    pub async fn get_ops_to_snapshot(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        snapshot: Snapshot,
        options: ReadOptions,
    ) -> Result<Vec<Op>, RuntimeError> {
        let (c, i) = (collection.to_string(), id.to_string());
        self.run(move |store| store.get_ops_to_snapshot(&c, &i, from, &snapshot, options))
            .await
    }

    /// See [`DocStore::get_committed_op_version`].
    pub async fn get_committed_op_version(
        &self,
        collection: &str,
        id: &str,
        snapshot: Snapshot,
        op: Op,
    ) -> Result<Option<Version>, RuntimeError> {
        let (c, i) = (collection.to_string(), id.to_string());
        self.run(move |store| store.get_committed_op_version(&c, &i, &snapshot, &op))
            .await
    }

    /// See [`DocStore::query`].
    pub async fn query(
        &self,
        collection: &str,
        query: Value,
        fields: Option<Vec<String>>,
        options: ReadOptions,
    ) -> Result<QueryResult, RuntimeError> {
        let c = collection.to_string();
        self.run(move |store| store.query(&c, &query, fields.as_deref(), options))
            .await
    }

    /// See [`DocStore::query_poll`]; waits the configured poll delay first.
    pub async fn query_poll(&self, collection: &str, query: Value) -> Result<PollResult, RuntimeError> {
        self.poll_delay().await?;
        let c = collection.to_string();
        self.run(move |store| store.query_poll(&c, &query)).await
    }

    /// See [`DocStore::query_poll_doc`]; waits the configured poll delay first.
    pub async fn query_poll_doc(&self, collection: &str, id: &str, query: Value) -> Result<bool, RuntimeError> {
        self.poll_delay().await?;
        let (c, i) = (collection.to_string(), id.to_string());
        self.run(move |store| store.query_poll_doc(&c, &i, &query)).await
    }

    /// See [`DocStore::can_poll_doc`].
    pub fn can_poll_doc(&self, _collection: &str, query: &Value) -> bool {
        poll::can_poll_doc(query)
    }

    /// See [`DocStore::skip_poll`].
    pub fn skip_poll(&self, _collection: &str, _id: &str, op: &Op, query: &Value) -> bool {
        poll::skip_poll(op, query)
    }

    /// Rejects every later call on this handle and its clones.
    pub fn close(&self) -> Result<(), RuntimeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::AlreadyClosed);
        }
        Ok(())
    }
}
