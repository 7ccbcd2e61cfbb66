//! HTTP client for the coordinator's GraphQL endpoint
//!
//! Queries are plain `POST {query, variables}` requests. Paginated lists are
//! read through [`PageFetcher`], which the pagination coordinator drives.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::CoordinatorConfig;
use crate::connection::{Connection, ConnectionKey, ListKind, PageRequest};
use crate::error::{Error, Result};
use crate::node::bare_session_id;
use crate::pagination::PageFetcher;
use crate::protocol::ExecutionResult;
use crate::subscription::{
    CHECKPOINT_FIELDS, FILE_CHANGE_FIELDS, HOOK_EXECUTION_FIELDS, MESSAGE_FIELDS, SESSION_FIELDS,
    TASK_FIELDS, TODO_FIELDS,
};
use crate::types::EntityKind;

const PAGE_INFO_FIELDS: &str = "pageInfo { hasNextPage hasPreviousPage startCursor endCursor } totalCount";

/// Request body for POST /graphql
#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: &'a Value,
}

/// GraphQL-over-HTTP client for the coordinator
#[derive(Clone)]
pub struct CoordinatorClient {
    http_client: reqwest::Client,
    endpoint: Arc<str>,
    base_url: Arc<str>,
}

impl CoordinatorClient {
    /// Create a client from configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: Arc::from(config.http_url.as_str()),
            base_url: Arc::from(config.base_url().as_str()),
        })
    }

    /// Run a GraphQL query and return its `data`.
    ///
    /// A response with `errors` fails with [`Error::GraphQl`] even if partial
    /// data came back.
    pub async fn query(&self, query: &str, variables: Value) -> Result<Value> {
        let response = self
            .http_client
            .post(&*self.endpoint)
            .json(&GraphQlRequest {
                query,
                variables: &variables,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::Transport(format!(
                "coordinator returned {}: {}",
                status, error_text
            )));
        }

        let body: ExecutionResult = response.json().await?;
        graphql_data(body)
    }

    /// Check if the coordinator is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);

        match self.http_client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Health check failed");
                Ok(false)
            }
        }
    }

    /// Fetch one page of a connection
    pub async fn page(&self, key: &ConnectionKey, request: &PageRequest) -> Result<Connection<Value>> {
        let (query, variables) = page_query(key, request)?;
        let data = self.query(&query, variables).await?;
        extract_connection(key, &data)
    }

    /// Fetch a session by bare session id, with its todos and tasks nested
    /// as connections
    pub async fn session(&self, session_id: &str) -> Result<Option<Value>> {
        let query = format!(
            "query Session($id: String!) {{ session(id: $id) {{ {SESSION_FIELDS} \
             todos {{ edges {{ cursor node {{ {TODO_FIELDS} }} }} }} \
             tasks {{ edges {{ cursor node {{ {TASK_FIELDS} }} }} }} }} }}"
        );
        let data = self.query(&query, json!({ "id": session_id })).await?;
        Ok(non_null(data.get("session")))
    }

    /// Fetch one node by global id
    pub async fn node(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        let fields = match kind {
            EntityKind::Session => SESSION_FIELDS,
            EntityKind::Message => MESSAGE_FIELDS,
            EntityKind::FileChange => FILE_CHANGE_FIELDS,
            EntityKind::HookExecution => HOOK_EXECUTION_FIELDS,
            EntityKind::Todo => TODO_FIELDS,
            EntityKind::Task => TASK_FIELDS,
            EntityKind::Checkpoint => CHECKPOINT_FIELDS,
            other => {
                return Err(Error::Protocol(format!("{other} cannot be fetched by id")));
            }
        };
        let query = format!(
            "query Node($id: ID!) {{ node(id: $id) {{ ... on {kind} {{ {fields} }} }} }}"
        );
        let data = self.query(&query, json!({ "id": id })).await?;
        Ok(non_null(data.get("node")))
    }
}

impl PageFetcher for CoordinatorClient {
    fn fetch_page(
        &self,
        key: &ConnectionKey,
        request: PageRequest,
    ) -> BoxFuture<'static, Result<Connection<Value>>> {
        let client = self.clone();
        let key = key.clone();
        Box::pin(async move { client.page(&key, &request).await })
    }

    fn fetch_session(&self, session_id: &str) -> BoxFuture<'static, Result<Option<Value>>> {
        let client = self.clone();
        let session_id = session_id.to_string();
        Box::pin(async move { client.session(&session_id).await })
    }

    fn fetch_node(&self, kind: EntityKind, id: &str) -> BoxFuture<'static, Result<Option<Value>>> {
        let client = self.clone();
        let id = id.to_string();
        Box::pin(async move { client.node(kind, &id).await })
    }
}

fn graphql_data(body: ExecutionResult) -> Result<Value> {
    if let Some(messages) = body.error_messages() {
        return Err(Error::GraphQl(messages));
    }
    body.data
        .ok_or_else(|| Error::Protocol("response has neither data nor errors".to_string()))
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

/// Build the query document and variables for one page of `key`
fn page_query(key: &ConnectionKey, request: &PageRequest) -> Result<(String, Value)> {
    let mut variables = serde_json::to_value(request)?;
    let args = "first: $first, after: $after, last: $last, before: $before";
    let params = "$first: Int, $after: String, $last: Int, $before: String";

    let query = match key.list {
        ListKind::Sessions => {
            if key.parent != "root" {
                variables["projectId"] = json!(key.parent);
            }
            format!(
                "query Sessions({params}, $projectId: String) {{ \
                 sessions({args}, projectId: $projectId) {{ \
                 edges {{ cursor node {{ {SESSION_FIELDS} }} }} {PAGE_INFO_FIELDS} }} }}"
            )
        }
        list => {
            variables["id"] = json!(bare_session_id(&key.parent));
            let fields = match list {
                ListKind::Messages => MESSAGE_FIELDS,
                ListKind::FileChanges => FILE_CHANGE_FIELDS,
                _ => HOOK_EXECUTION_FIELDS,
            };
            format!(
                "query SessionPage($id: String!, {params}) {{ session(id: $id) {{ \
                 {field}({args}) {{ \
                 edges {{ cursor node {{ {fields} }} }} {PAGE_INFO_FIELDS} }} }} }}",
                field = list.field()
            )
        }
    };
    Ok((query, variables))
}

/// Pull the connection for `key` out of a page response
fn extract_connection(key: &ConnectionKey, data: &Value) -> Result<Connection<Value>> {
    let raw = match key.list {
        ListKind::Sessions => data.get("sessions"),
        list => {
            let session = data
                .get("session")
                .filter(|s| !s.is_null())
                .ok_or_else(|| Error::SessionNotFound(key.parent.clone()))?;
            session.get(list.field())
        }
    };

    match raw {
        // The coordinator returns null for lists a session never had
        None | Some(Value::Null) => Ok(Connection::default()),
        Some(value) => Ok(serde_json::from_value(value.clone())?),
    }
}
