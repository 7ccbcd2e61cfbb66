//! Local state of one paginated connection.

use serde_json::Value;

use crate::connection::{Direction, InsertPosition, ListKind, PageInfo};

/// Edge as held by the store: the node lives in the record table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRef {
    pub node_id: String,
    pub cursor: String,
    /// Ordering key for index-ordered connections
    pub sort_key: Option<i64>,
}

/// How edges are ordered within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOrder {
    /// Ascending by an integer node field; one edge per key.
    Ascending(&'static str),
    /// Server order, newest first for file changes and hook executions.
    AsReceived,
}

impl EdgeOrder {
    pub fn for_list(list: ListKind) -> Self {
        match list {
            ListKind::Messages => EdgeOrder::Ascending("messageIndex"),
            ListKind::FileChanges | ListKind::HookExecutions | ListKind::Sessions => {
                EdgeOrder::AsReceived
            }
        }
    }

    /// Read the ordering key from a node
    pub fn sort_key(&self, node: &Value) -> Option<i64> {
        match self {
            EdgeOrder::Ascending(field) => node.get(*field).and_then(Value::as_i64),
            EdgeOrder::AsReceived => None,
        }
    }
}

/// Result of inserting a single edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The node id is already in the connection; nothing changed.
    Duplicate,
    /// Another node held the same ordering key and was displaced.
    Replaced { previous: String },
}

/// Loaded window of a connection plus its edges.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    order: EdgeOrder,
    edges: Vec<EdgeRef>,
    page_info: PageInfo,
    total_count: i64,
    fetched: bool,
}

impl ConnectionState {
    pub fn new(order: EdgeOrder) -> Self {
        Self {
            order,
            edges: Vec::new(),
            page_info: PageInfo::default(),
            total_count: 0,
            fetched: false,
        }
    }

    pub fn order(&self) -> EdgeOrder {
        self.order
    }

    pub fn edges(&self) -> &[EdgeRef] {
        &self.edges
    }

    pub fn page_info(&self) -> &PageInfo {
        &self.page_info
    }

    pub fn total_count(&self) -> i64 {
        self.total_count
    }

    /// Whether at least one page has been merged
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.edges.iter().any(|e| e.node_id == node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().map(|e| e.node_id.as_str())
    }

    /// Insert one edge without duplicating its node.
    ///
    /// Index-ordered connections place the edge by key and ignore `position`;
    /// an edge without a key goes after every keyed edge, in arrival order.
    /// Everything else honors `position`.
    pub fn insert(&mut self, edge: EdgeRef, position: InsertPosition) -> InsertOutcome {
        if self.contains(&edge.node_id) {
            return InsertOutcome::Duplicate;
        }

        let outcome = match (self.order, edge.sort_key) {
            (EdgeOrder::Ascending(_), Some(key)) => {
                if let Some(existing) = self.edges.iter_mut().find(|e| e.sort_key == Some(key)) {
                    let previous = std::mem::replace(existing, edge).node_id;
                    InsertOutcome::Replaced { previous }
                } else {
                    let idx = self
                        .edges
                        .iter()
                        .position(|e| e.sort_key.map_or(true, |k| k > key))
                        .unwrap_or(self.edges.len());
                    self.edges.insert(idx, edge);
                    InsertOutcome::Inserted
                }
            }
            (EdgeOrder::Ascending(_), None) => {
                self.edges.push(edge);
                InsertOutcome::Inserted
            }
            _ => {
                match position {
                    InsertPosition::Head => self.edges.insert(0, edge),
                    InsertPosition::Tail => self.edges.push(edge),
                }
                InsertOutcome::Inserted
            }
        };

        self.total_count = self.total_count.max(self.edges.len() as i64);
        outcome
    }

    /// Insert an edge pushed by the server.
    ///
    /// Like [`insert`](Self::insert), but a new node also counts toward
    /// `total_count`, since the server total it was fetched with predates it.
    pub fn insert_live(&mut self, edge: EdgeRef, position: InsertPosition) -> InsertOutcome {
        let before = self.total_count;
        let outcome = self.insert(edge, position);
        if outcome == InsertOutcome::Inserted {
            self.total_count = (before + 1).max(self.edges.len() as i64);
        }
        outcome
    }

    /// Merge a fetched page. Returns the number of edges that were new.
    ///
    /// Forward pages extend the end of the window, backward pages the start.
    /// Live insertions never move the window cursors, so a later fetch from
    /// the old cursor still covers any gap they skipped over.
    pub fn merge_page(
        &mut self,
        edges: Vec<EdgeRef>,
        page_info: PageInfo,
        total_count: i64,
        direction: Direction,
    ) -> usize {
        let mut added = 0;
        let mut head = 0;

        for edge in edges {
            let position = match direction {
                Direction::Forward => InsertPosition::Tail,
                Direction::Backward => InsertPosition::Head,
            };

            if self.order == EdgeOrder::AsReceived && direction == Direction::Backward {
                // Keep the page's own order when prepending
                if self.contains(&edge.node_id) {
                    continue;
                }
                self.edges.insert(head, edge);
                head += 1;
                added += 1;
                continue;
            }

            if self.insert(edge, position) != InsertOutcome::Duplicate {
                added += 1;
            }
        }

        if !self.fetched {
            self.page_info = page_info;
        } else {
            match direction {
                Direction::Forward => {
                    if page_info.end_cursor.is_some() {
                        self.page_info.end_cursor = page_info.end_cursor;
                    }
                    self.page_info.has_next_page = page_info.has_next_page;
                }
                Direction::Backward => {
                    if page_info.start_cursor.is_some() {
                        self.page_info.start_cursor = page_info.start_cursor;
                    }
                    self.page_info.has_previous_page = page_info.has_previous_page;
                }
            }
        }

        self.fetched = true;
        self.total_count = total_count.max(self.edges.len() as i64);
        added
    }

    /// Missing key ranges between loaded edges (inclusive bounds).
    ///
    /// Only meaningful for index-ordered connections; gaps are reported, never filled.
    pub fn index_gaps(&self) -> Vec<(i64, i64)> {
        let keys: Vec<i64> = self.edges.iter().filter_map(|e| e.sort_key).collect();
        keys.windows(2)
            .filter(|w| w[1] - w[0] > 1)
            .map(|w| (w[0] + 1, w[1] - 1))
            .collect()
    }
}
