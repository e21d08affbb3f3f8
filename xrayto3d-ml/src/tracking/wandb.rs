//! Read-only access to runs on the hosted Weights & Biases tracker (GraphQL API).

use crate::config::TrackingConfig;
use crate::error::MlError;
use crate::tracking::{RunFilter, RunRecord, RunState, RunStore, newest_first};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};

const RUNS_QUERY: &str = r#"
query Runs($entity: String!, $project: String!, $filters: JSONString, $cursor: String) {
  project(name: $project, entityName: $entity) {
    runs(filters: $filters, first: 100, after: $cursor, order: "-created_at") {
      edges {
        node { name group state tags config createdAt heartbeatAt }
      }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

const MAX_PAGES: usize = 50;

pub struct WandbRunStore {
    client: reqwest::Client,
    base_url: String,
    entity: String,
    api_key: String,
}

impl WandbRunStore {
    pub fn new(base_url: &str, entity: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            entity: entity.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Result<Self, MlError> {
        let entity = config.entity.as_deref().ok_or_else(|| {
            MlError::Config("tracking.entity is required for the wandb backend".to_string())
        })?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            MlError::Config(format!(
                "environment variable {} is not set",
                config.api_key_env
            ))
        })?;
        Ok(Self::new(&config.base_url, entity, &api_key))
    }

    async fn fetch_page(
        &self,
        project: &str,
        filter: &RunFilter,
        cursor: Option<&str>,
    ) -> Result<RunPage, MlError> {
        let body = json!({
            "query": RUNS_QUERY,
            "variables": {
                "entity": self.entity,
                "project": project,
                "filters": server_filters(filter).to_string(),
                "cursor": cursor,
            }
        });

        let response = self
            .client
            .post(format!("{}/graphql", self.base_url))
            .basic_auth("api", Some(&self.api_key))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MlError::tracking(format!(
                "run query failed with status {}",
                response.status()
            )));
        }
        let text = response.text().await?;
        parse_runs_page(&text, project)
    }
}

#[async_trait]
impl RunStore for WandbRunStore {
    fn name(&self) -> &str {
        "wandb"
    }

    async fn query(&self, project: &str, filter: &RunFilter) -> Result<Vec<RunRecord>, MlError> {
        let mut runs = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(project, filter, cursor.as_deref()).await?;
            runs.extend(page.runs.into_iter().filter(|r| filter.matches(r)));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        newest_first(&mut runs);
        tracing::debug!(project, runs = runs.len(), "Fetched runs from wandb");
        Ok(runs)
    }
}

/// MongoDB-style filter understood by the runs endpoint.
fn server_filters(filter: &RunFilter) -> Value {
    let mut clauses: Vec<Value> = filter.tags.iter().map(|t| json!({ "tags": t })).collect();
    if let Some(state) = filter.state {
        if let Ok(state) = serde_json::to_value(state) {
            clauses.push(json!({ "state": state }));
        }
    }
    json!({ "$and": clauses })
}

pub(crate) struct RunPage {
    pub runs: Vec<RunRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<ResponseData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct ResponseData {
    project: Option<ProjectNode>,
}

#[derive(Deserialize)]
struct ProjectNode {
    runs: RunConnection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunConnection {
    edges: Vec<RunEdge>,
    page_info: PageInfo,
}

#[derive(Deserialize)]
struct RunEdge {
    node: RunNode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunNode {
    name: String,
    #[serde(default)]
    group: Option<String>,
    state: RunState,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    config: Option<String>,
    created_at: String,
    #[serde(default)]
    heartbeat_at: Option<String>,
}

pub(crate) fn parse_runs_page(body: &str, project: &str) -> Result<RunPage, MlError> {
    let response: GraphQlResponse = serde_json::from_str(body)?;
    if let Some(err) = response.errors.first() {
        return Err(MlError::tracking(err.message.clone()));
    }
    let connection = response
        .data
        .and_then(|d| d.project)
        .ok_or_else(|| MlError::not_found(format!("tracking project {project}")))?
        .runs;

    let mut runs = Vec::with_capacity(connection.edges.len());
    for RunEdge { node } in connection.edges {
        let config = match node.config.as_deref() {
            Some(raw) if !raw.is_empty() => unwrap_config(serde_json::from_str(raw)?),
            _ => Map::new(),
        };
        let created_at = parse_timestamp(&node.created_at);
        runs.push(RunRecord {
            id: node.name,
            project: project.to_string(),
            group: node.group.unwrap_or_default(),
            tags: node.tags,
            config,
            state: node.state,
            metrics: None,
            environment: None,
            created_at,
            updated_at: node
                .heartbeat_at
                .as_deref()
                .map(parse_timestamp)
                .unwrap_or(created_at),
        });
    }

    let next_cursor = if connection.page_info.has_next_page {
        connection.page_info.end_cursor
    } else {
        None
    };
    Ok(RunPage { runs, next_cursor })
}

/// Stored config values are wrapped as `{"value": ..., "desc": ...}`.
fn unwrap_config(raw: Map<String, Value>) -> Map<String, Value> {
    raw.into_iter()
        .map(|(k, v)| match v {
            Value::Object(mut inner) if inner.contains_key("value") => {
                (k, inner.remove("value").unwrap_or(Value::Null))
            }
            other => (k, other),
        })
        .collect()
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc())
        })
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
