//! Pagination coordinator
//!
//! Tracks the loaded window and load state of each paginated list and merges
//! fetched pages into the [`Store`]. Fetching goes through [`PageFetcher`] so
//! the HTTP client can be swapped for a fake in tests.
//!
//! A fetch has three steps: [`PaginationCoordinator::begin`] computes the
//! page request and marks the list `Loading`, the returned [`FetchTicket`] is
//! fetched (inline or on a spawned task), and [`PaginationCoordinator::complete`]
//! merges the result. The engine runs the middle step off its event loop; the
//! `load_*` helpers run all three inline.
//!
//! ## Windows per list
//!
//! | List | Initial page | Backward | Forward |
//! |------|--------------|----------|---------|
//! | messages | newest `last: n` | older, `before: start` | newer, `after: end` |
//! | file changes, hooks | newest `first: n` | - | older, `after: end` |
//!
//! Live insertions never move the window, so a message that arrives ahead of
//! the loaded tail leaves a gap until a forward load covers it.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::connection::{
    Connection, ConnectionKey, Direction, Edge, InsertPosition, ListKind, PageInfo, PageRequest,
};
use crate::error::{Error, Result};
use crate::store::{AppendOutcome, EdgeOrder, Store};
use crate::types::EntityKind;

/// Source of connection pages and single nodes.
pub trait PageFetcher: Send + Sync + 'static {
    /// Fetch one page of the connection identified by `key`
    fn fetch_page(
        &self,
        key: &ConnectionKey,
        request: PageRequest,
    ) -> BoxFuture<'static, Result<Connection<Value>>>;

    /// Fetch a session by bare session id
    fn fetch_session(&self, session_id: &str) -> BoxFuture<'static, Result<Option<Value>>>;

    /// Fetch a single node by global id
    fn fetch_node(&self, kind: EntityKind, id: &str) -> BoxFuture<'static, Result<Option<Value>>>;
}

/// Load state of one list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    /// Last fetch failed; already merged data is kept and the load can be retried
    Failed(String),
}

/// Snapshot of a list's window for rendering
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListWindow {
    pub page_info: PageInfo,
    pub total_count: i64,
    pub loaded: usize,
    pub load_state: LoadState,
}

impl ListWindow {
    /// Whether a load in `direction` could return more items
    pub fn has_more(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.page_info.has_next_page,
            Direction::Backward => self.page_info.has_previous_page,
        }
    }
}

/// A fetch that has been started and must be completed or dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: ConnectionKey,
    pub request: PageRequest,
    /// How the page is merged into the connection
    pub merge: Direction,
    generation: u64,
}

#[derive(Debug, Default)]
struct ListState {
    load_state: LoadState,
    generation: u64,
    inflight: Option<AbortHandle>,
}

/// Coordinates page loads for every list of the store.
pub struct PaginationCoordinator<F: PageFetcher> {
    fetcher: Arc<F>,
    page_size: usize,
    lists: HashMap<ConnectionKey, ListState>,
}

impl<F: PageFetcher> PaginationCoordinator<F> {
    pub fn new(fetcher: Arc<F>, page_size: usize) -> Self {
        Self {
            fetcher,
            page_size: page_size.max(1),
            lists: HashMap::new(),
        }
    }

    pub fn fetcher(&self) -> &Arc<F> {
        &self.fetcher
    }

    pub fn load_state(&self, key: &ConnectionKey) -> LoadState {
        self.lists
            .get(key)
            .map(|l| l.load_state.clone())
            .unwrap_or_default()
    }

    pub fn window(&self, store: &Store, key: &ConnectionKey) -> ListWindow {
        let load_state = self.load_state(key);
        match store.connection(key) {
            Some(state) => ListWindow {
                page_info: state.page_info().clone(),
                total_count: state.total_count(),
                loaded: state.len(),
                load_state,
            },
            None => ListWindow {
                load_state,
                ..Default::default()
            },
        }
    }

    /// Missing message index ranges in the loaded window
    pub fn gaps(&self, store: &Store, key: &ConnectionKey) -> Vec<(i64, i64)> {
        store
            .connection(key)
            .map(|c| c.index_gaps())
            .unwrap_or_default()
    }

    // ============================================
    // Fetch lifecycle
    // ============================================

    /// Start the first load of a list (or reload it from the newest page).
    pub fn begin_initial(&mut self, key: &ConnectionKey) -> Option<FetchTicket> {
        let (request, merge) = match key.list {
            ListKind::Messages => (PageRequest::backward(self.page_size, None), Direction::Backward),
            _ => (PageRequest::forward(self.page_size, None), Direction::Forward),
        };
        self.start(key, request, merge)
    }

    /// Start loading more of a list in `direction`.
    ///
    /// Returns `None` if a fetch for the list is already in flight or there is
    /// nothing more to load that way.
    pub fn begin(
        &mut self,
        store: &Store,
        key: &ConnectionKey,
        direction: Direction,
    ) -> Option<FetchTicket> {
        let Some(state) = store.connection(key).filter(|c| c.is_fetched()) else {
            return self.begin_initial(key);
        };

        let info = state.page_info();
        let request = match direction {
            Direction::Backward => {
                if !info.has_previous_page {
                    return None;
                }
                PageRequest::backward(self.page_size, info.start_cursor.clone())
            }
            Direction::Forward => {
                // Index-ordered lists also page forward to cover gaps left by live insertions
                let gaps = matches!(state.order(), EdgeOrder::Ascending(_))
                    && !state.index_gaps().is_empty();
                if !info.has_next_page && !gaps {
                    return None;
                }
                PageRequest::forward(self.page_size, info.end_cursor.clone())
            }
        };
        self.start(key, request, direction)
    }

    /// Start fetching the newest items of a list after a change notification
    /// that carried no node.
    pub fn begin_refresh(&mut self, store: &Store, key: &ConnectionKey) -> Option<FetchTicket> {
        let Some(state) = store.connection(key).filter(|c| c.is_fetched()) else {
            return self.begin_initial(key);
        };
        match key.list {
            ListKind::Messages => {
                let request =
                    PageRequest::forward(self.page_size, state.page_info().end_cursor.clone());
                self.start(key, request, Direction::Forward)
            }
            // Newest-first lists: re-read the head and prepend what is new
            _ => self.start(
                key,
                PageRequest::forward(self.page_size, None),
                Direction::Backward,
            ),
        }
    }

    fn start(
        &mut self,
        key: &ConnectionKey,
        request: PageRequest,
        merge: Direction,
    ) -> Option<FetchTicket> {
        let list = self.lists.entry(key.clone()).or_default();
        if list.load_state == LoadState::Loading {
            tracing::debug!(connection = %key, "Fetch already in flight");
            return None;
        }
        list.load_state = LoadState::Loading;
        list.generation += 1;
        list.inflight = None;

        tracing::debug!(connection = %key, ?request, "Starting page fetch");
        Some(FetchTicket {
            key: key.clone(),
            request,
            merge,
            generation: list.generation,
        })
    }

    /// The fetch future for a ticket
    pub fn fetch(&self, ticket: &FetchTicket) -> BoxFuture<'static, Result<Connection<Value>>> {
        self.fetcher.fetch_page(&ticket.key, ticket.request.clone())
    }

    /// Remember the task running a ticket so [`cancel`](Self::cancel) can abort it.
    pub fn track(&mut self, ticket: &FetchTicket, handle: AbortHandle) {
        if let Some(list) = self.lists.get_mut(&ticket.key) {
            if list.generation == ticket.generation {
                list.inflight = Some(handle);
            }
        }
    }

    /// Merge a finished fetch. Returns the number of new edges.
    ///
    /// Results for a cancelled ticket are discarded. On failure the list moves
    /// to `Failed` and nothing already merged is touched.
    pub fn complete(
        &mut self,
        store: &mut Store,
        ticket: FetchTicket,
        result: Result<Connection<Value>>,
    ) -> Result<usize> {
        let list = self.lists.entry(ticket.key.clone()).or_default();
        if list.generation != ticket.generation || list.load_state != LoadState::Loading {
            tracing::debug!(connection = %ticket.key, "Discarding result of cancelled fetch");
            return Err(Error::Cancelled(ticket.key.to_string()));
        }
        list.inflight = None;

        let merged = result.and_then(|page| store.populate_connection(&ticket.key, page, ticket.merge));
        match merged {
            Ok(added) => {
                list.load_state = LoadState::Idle;
                tracing::debug!(connection = %ticket.key, added, "Page merged");
                Ok(added)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(connection = %ticket.key, error = %message, "Page fetch failed");
                list.load_state = LoadState::Failed(message.clone());
                Err(Error::Fetch {
                    list: ticket.key.to_string(),
                    message,
                })
            }
        }
    }

    /// Abort an in-flight fetch for a list. Returns `true` if one was running.
    pub fn cancel(&mut self, key: &ConnectionKey) -> bool {
        let Some(list) = self.lists.get_mut(key) else {
            return false;
        };
        let was_loading = list.load_state == LoadState::Loading;
        if let Some(handle) = list.inflight.take() {
            handle.abort();
        }
        list.generation += 1;
        if was_loading {
            list.load_state = LoadState::Idle;
            tracing::debug!(connection = %key, "Cancelled page fetch");
        }
        was_loading
    }

    /// Cancel and forget every list under `parent`
    pub fn forget_parent(&mut self, parent: &str) {
        let keys: Vec<ConnectionKey> = self
            .lists
            .keys()
            .filter(|k| k.parent == parent)
            .cloned()
            .collect();
        for key in keys {
            self.cancel(&key);
            self.lists.remove(&key);
        }
    }

    // ============================================
    // Inline helpers
    // ============================================

    /// Fetch and merge the first page of a list
    pub async fn load_initial(&mut self, store: &mut Store, key: &ConnectionKey) -> Result<usize> {
        match self.begin_initial(key) {
            Some(ticket) => self.run(store, ticket).await,
            None => Ok(0),
        }
    }

    /// Fetch and merge the next page in `direction`; `Ok(0)` if there is none
    pub async fn load_more(
        &mut self,
        store: &mut Store,
        key: &ConnectionKey,
        direction: Direction,
    ) -> Result<usize> {
        match self.begin(store, key, direction) {
            Some(ticket) => self.run(store, ticket).await,
            None => Ok(0),
        }
    }

    /// Fetch and merge the newest items of a list
    pub async fn refresh(&mut self, store: &mut Store, key: &ConnectionKey) -> Result<usize> {
        match self.begin_refresh(store, key) {
            Some(ticket) => self.run(store, ticket).await,
            None => Ok(0),
        }
    }

    async fn run(&mut self, store: &mut Store, ticket: FetchTicket) -> Result<usize> {
        let result = self.fetch(&ticket).await;
        self.complete(store, ticket, result)
    }

    /// Merge a live insertion at the tail of a list, whatever history is loaded.
    pub fn merge_subscription_insertion(
        &mut self,
        store: &mut Store,
        key: &ConnectionKey,
        edge: Edge<Value>,
    ) -> Result<AppendOutcome> {
        store.append_to_connection(key, edge, InsertPosition::Tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves a fixed list of message indexes with cursor `c{index}`.
    struct FakeFetcher {
        indexes: Vec<i64>,
        fail: Mutex<bool>,
        requests: Mutex<Vec<PageRequest>>,
    }

    impl FakeFetcher {
        fn new(indexes: Vec<i64>) -> Self {
            Self {
                indexes,
                fail: Mutex::new(false),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    fn node(index: i64) -> Edge<Value> {
        Edge {
            node: serde_json::json!({"id": format!("m{index}"), "messageIndex": index}),
            cursor: format!("c{index}"),
        }
    }

    impl PageFetcher for FakeFetcher {
        fn fetch_page(
            &self,
            _key: &ConnectionKey,
            request: PageRequest,
        ) -> BoxFuture<'static, Result<Connection<Value>>> {
            self.requests.lock().unwrap().push(request.clone());
            let fail = *self.fail.lock().unwrap();
            let all = self.indexes.clone();
            Box::pin(async move {
                if fail {
                    return Err(Error::Transport("connection refused".to_string()));
                }
                let cursor_pos = |c: &Option<String>| {
                    c.as_ref()
                        .and_then(|c| all.iter().position(|i| format!("c{i}") == *c))
                };
                let start = cursor_pos(&request.after).map_or(0, |p| p + 1);
                let end = cursor_pos(&request.before).unwrap_or(all.len());
                let mut slice = &all[start..end];
                if let Some(first) = request.first {
                    slice = &slice[..first.min(slice.len())];
                } else if let Some(last) = request.last {
                    slice = &slice[slice.len().saturating_sub(last)..];
                }
                let first_pos = start + all[start..end].iter().position(|i| Some(i) == slice.first()).unwrap_or(0);
                let last_pos = first_pos + slice.len();
                Ok(Connection {
                    edges: slice.iter().map(|i| node(*i)).collect(),
                    page_info: PageInfo {
                        has_next_page: last_pos < all.len(),
                        has_previous_page: first_pos > 0,
                        start_cursor: slice.first().map(|i| format!("c{i}")),
                        end_cursor: slice.last().map(|i| format!("c{i}")),
                    },
                    total_count: all.len() as i64,
                })
            })
        }

        fn fetch_session(&self, _session_id: &str) -> BoxFuture<'static, Result<Option<Value>>> {
            Box::pin(async { Ok(None) })
        }

        fn fetch_node(&self, _kind: EntityKind, _id: &str) -> BoxFuture<'static, Result<Option<Value>>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn indexes(store: &Store, key: &ConnectionKey) -> Vec<i64> {
        store
            .connection(key)
            .unwrap()
            .edges()
            .iter()
            .filter_map(|e| e.sort_key)
            .collect()
    }

    #[tokio::test]
    async fn test_initial_then_older_pages() {
        let fetcher = Arc::new(FakeFetcher::new((1..=5).collect()));
        let mut pager = PaginationCoordinator::new(fetcher, 2);
        let mut store = Store::default();
        let key = ConnectionKey::messages("S1");

        assert_eq!(pager.load_initial(&mut store, &key).await.unwrap(), 2);
        assert_eq!(indexes(&store, &key), vec![4, 5]);
        assert!(pager.window(&store, &key).has_more(Direction::Backward));

        pager.load_more(&mut store, &key, Direction::Backward).await.unwrap();
        pager.load_more(&mut store, &key, Direction::Backward).await.unwrap();
        assert_eq!(indexes(&store, &key), vec![1, 2, 3, 4, 5]);

        let window = pager.window(&store, &key);
        assert!(!window.has_more(Direction::Backward));
        assert_eq!(window.total_count, 5);
        assert_eq!(
            pager.load_more(&mut store, &key, Direction::Backward).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_failure_preserves_data_and_is_retryable() {
        let fetcher = Arc::new(FakeFetcher::new((1..=4).collect()));
        let mut pager = PaginationCoordinator::new(fetcher.clone(), 2);
        let mut store = Store::default();
        let key = ConnectionKey::messages("S1");
        pager.load_initial(&mut store, &key).await.unwrap();

        *fetcher.fail.lock().unwrap() = true;
        let err = pager
            .load_more(&mut store, &key, Direction::Backward)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(pager.load_state(&key), LoadState::Failed(_)));
        assert_eq!(indexes(&store, &key), vec![3, 4]);

        *fetcher.fail.lock().unwrap() = false;
        pager.load_more(&mut store, &key, Direction::Backward).await.unwrap();
        assert_eq!(pager.load_state(&key), LoadState::Idle);
        assert_eq!(indexes(&store, &key), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_cancelled_ticket_is_discarded() {
        let fetcher = Arc::new(FakeFetcher::new((1..=3).collect()));
        let mut pager = PaginationCoordinator::new(fetcher, 10);
        let mut store = Store::default();
        let key = ConnectionKey::messages("S1");

        let ticket = pager.begin_initial(&key).unwrap();
        assert!(pager.begin_initial(&key).is_none());
        let result = pager.fetch(&ticket).await;

        assert!(pager.cancel(&key));
        let err = pager.complete(&mut store, ticket, result).unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!store.has_connection(&key));
        assert_eq!(pager.load_state(&key), LoadState::Idle);
    }

    #[tokio::test]
    async fn test_gap_filled_by_forward_load() {
        let fetcher = Arc::new(FakeFetcher::new((1..=5).collect()));
        let mut pager = PaginationCoordinator::new(fetcher.clone(), 10);
        let mut store = Store::default();
        let key = ConnectionKey::messages("S1");

        // Window covers 1..2 as of the first fetch
        store
            .populate_connection(
                &key,
                Connection {
                    edges: vec![node(1), node(2)],
                    page_info: PageInfo {
                        start_cursor: Some("c1".to_string()),
                        end_cursor: Some("c2".to_string()),
                        ..Default::default()
                    },
                    total_count: 2,
                },
                Direction::Backward,
            )
            .unwrap();
        pager
            .merge_subscription_insertion(&mut store, &key, node(5))
            .unwrap();
        assert_eq!(pager.gaps(&store, &key), vec![(3, 4)]);

        pager.load_more(&mut store, &key, Direction::Forward).await.unwrap();
        assert_eq!(indexes(&store, &key), vec![1, 2, 3, 4, 5]);
        assert!(pager.gaps(&store, &key).is_empty());
        assert_eq!(
            fetcher.requests.lock().unwrap().last().unwrap().after.as_deref(),
            Some("c2")
        );
    }
}
