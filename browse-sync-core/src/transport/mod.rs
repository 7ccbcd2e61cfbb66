//! Coordinator transports: GraphQL over HTTP for queries and pages,
//! `graphql-transport-ws` for subscriptions.

pub mod http;
pub mod ws;

pub use http::CoordinatorClient;
pub use ws::{ConnectionManager, ConnectionState, SubscriptionEvent, SubscriptionId, WsOptions};
