//! # browse-sync-core
//!
//! Client-side data synchronization for browsing live coding-agent sessions
//! served by a coordinator over GraphQL.
//!
//! This library provides:
//! - A normalized record store with paginated connections
//! - A graphql-transport-ws connection manager with resubscribe on reconnect
//! - Routing of subscription payloads into store updates
//! - Cursor pagination with gap detection
//! - Projections (todo counts, hook stats, activity) over the store
//!
//! ## Architecture
//!
//! Data flows in one direction:
//! - **Transport:** HTTP queries for pages, a WebSocket for pushed events
//! - **Sync:** [`router`] and [`pagination`] turn responses into store mutations
//! - **Store:** [`Store`] holds records and connections and announces changes
//! - **Views:** [`projection`] derives what a session view shows
//!
//! [`SyncEngine`] runs all of it on one task.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use browse_sync_core::{Config, ConnectionManager, CoordinatorClient, SyncEngine, WsOptions};
//!
//! # async fn run() -> browse_sync_core::Result<()> {
//! let config = Config::load()?;
//! let client = Arc::new(CoordinatorClient::new(&config.coordinator)?);
//! let connection = ConnectionManager::connect(WsOptions::from(&config.coordinator));
//! let engine = SyncEngine::start(&config.sync, client, connection);
//!
//! let _watch = engine.watch_session("S1").await?;
//! let mut changes = engine.changes();
//! while let Ok(change) = changes.recv().await {
//!     println!("{change:?}");
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use connection::{Connection, ConnectionKey, Direction, Edge, ListKind, PageInfo, PageRequest};
pub use engine::{SessionWatch, SyncEngine, TopicWatch};
pub use error::{Error, Result};
pub use pagination::{ListWindow, LoadState, PageFetcher, PaginationCoordinator};
pub use projection::SessionSummary;
pub use router::{Followup, Router, SyncEvent};
pub use store::{Store, StoreChange};
pub use subscription::Topic;
pub use transport::{
    ConnectionManager, ConnectionState, CoordinatorClient, SubscriptionEvent, SubscriptionId,
    WsOptions,
};
pub use types::*;

// Public modules
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod format;
pub mod logging;
pub mod node;
pub mod pagination;
pub mod projection;
pub mod protocol;
pub mod router;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod types;
