//! GitHub commits authored by the configured user across their public,
//! non-fork repositories. Each repository is its own watermarked stream.

use std::time::Duration;

use async_trait::async_trait;
use footprint_core::catalog::column;
use footprint_core::{
    ColumnDef, ColumnType, EntityDef, MetricDef, MetricQuery, Since, SourceDefinition, SourceId,
    SourceRecord,
};
use footprint_storage::{FetchError, FetchedResponse, HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::json::{bool_at, present, str_at, timestamp_at};
use crate::{
    http_fetcher, require, send, unknown_stream, Connector, ConnectorError, ConnectorSettings,
    Page, PageToken, StreamSpec,
};

const SOURCE: SourceId = SourceId::Github;
const API_BASE: &str = "https://api.github.com";
const STREAM_PREFIX: &str = "commits:";
pub const PAGE_SIZE: usize = 100;
const MESSAGE_CHARS: usize = 200;

const COMMIT_COLUMNS: &[ColumnDef] = &[
    column("repo", ColumnType::Text),
    column("message", ColumnType::Text),
    column("author_date", ColumnType::Text),
    column("url", ColumnType::Text),
];

pub static DEFINITION: SourceDefinition = SourceDefinition {
    source: SOURCE,
    entities: &[EntityDef {
        entity: "commit",
        table: "commits",
        key_column: "sha",
        columns: COMMIT_COLUMNS,
        parent: None,
    }],
    metric_queries: &[MetricQuery {
        name: "commits",
        sql: "SELECT author_date AS bucket_ts, repo FROM commits WHERE author_date IS NOT NULL",
        metrics: &[
            MetricDef::count("commits"),
            MetricDef::count_distinct("repos_touched", "repo"),
        ],
    }],
    comparison_metrics: &["commits", "repos_touched"],
};

/// URL of the `rel="next"` entry of a `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let url = pieces.next()?.trim().strip_prefix('<')?.strip_suffix('>')?;
        pieces
            .any(|param| param.trim() == r#"rel="next""#)
            .then(|| url.to_string())
    })
}

/// Full names of the public repositories the user owns, forks excluded.
pub fn owned_public_repos(repos: &[JsonValue]) -> Vec<String> {
    repos
        .iter()
        .filter(|r| bool_at(r, &["fork"]) != Some(true) && bool_at(r, &["private"]) != Some(true))
        .filter_map(|r| str_at(r, &["full_name"]).map(str::to_string))
        .collect()
}

/// First line of the commit message, at most `MESSAGE_CHARS` characters.
fn summary_line(commit: &JsonValue, path: &[&str]) -> Option<String> {
    let message = str_at(commit, path)?;
    let first = message.lines().next().unwrap_or_default().trim_end();
    Some(first.chars().take(MESSAGE_CHARS).collect())
}

pub fn normalize_commit(repo: &str, commit: &JsonValue) -> Option<SourceRecord> {
    let sha = str_at(commit, &["sha"])?;
    let authored = timestamp_at(commit, &["commit", "author", "date"])?;
    Some(
        SourceRecord::new("commit", sha)
            .field("repo", repo)
            .field_opt("message", present(commit, &["commit", "message"], summary_line))
            .field_opt("author_date", present(commit, &["commit", "author", "date"], str_at))
            .field_opt("url", present(commit, &["html_url"], str_at))
            .observed_at(Some(authored)),
    )
}

pub fn normalize_commit_page(
    repo: &str,
    body: &JsonValue,
    link: Option<&str>,
) -> Result<Page, ConnectorError> {
    let commits = body
        .as_array()
        .ok_or_else(|| ConnectorError::malformed(SOURCE, "commit list is not an array"))?;
    let items = commits
        .iter()
        .filter_map(|c| {
            let record = normalize_commit(repo, c);
            if record.is_none() {
                debug!(repo, "commit without sha or author date");
            }
            record
        })
        .collect();
    let next = link.and_then(parse_next_link).map(PageToken::Url);
    Ok(Page::new(items, next).with_upstream_count(commits.len()))
}

fn decode(response: FetchedResponse) -> Result<(JsonValue, Option<String>), ConnectorError> {
    let link = response.header("link").map(str::to_string);
    let body = response
        .json()
        .map_err(|err| ConnectorError::from_fetch(SOURCE, err))?;
    Ok((body, link))
}

pub struct GithubConnector {
    http: HttpFetcher,
    token: String,
    username: String,
    api_base: String,
}

impl GithubConnector {
    pub fn new(settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let token = require(SOURCE, &settings.credentials.github_token, "GITHUB_TOKEN")?;
        let username = require(SOURCE, &settings.credentials.github_username, "GITHUB_USERNAME")?;
        let http = http_fetcher(SOURCE, &settings.http, Duration::from_millis(100))?;
        Ok(Self {
            http,
            token,
            username,
            api_base: API_BASE.to_string(),
        })
    }

    #[cfg(test)]
    fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn get(&self, url: impl Into<String>) -> HttpRequest {
        HttpRequest::get(url)
            .bearer(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get_json(&self, request: &HttpRequest) -> Result<(JsonValue, Option<String>), ConnectorError> {
        decode(send(&self.http, SOURCE, request).await?)
    }
}

#[async_trait]
impl Connector for GithubConnector {
    fn source(&self) -> SourceId {
        SOURCE
    }

    async fn validate_credentials(&self) -> Result<(), ConnectorError> {
        send(&self.http, SOURCE, &self.get(format!("{}/user", self.api_base)))
            .await
            .map(|_| ())
    }

    async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError> {
        let mut request = self
            .get(format!("{}/users/{}/repos", self.api_base, self.username))
            .query("type", "owner")
            .query("sort", "updated")
            .query("per_page", PAGE_SIZE);
        let mut repos = Vec::new();
        loop {
            let (body, link) = self.get_json(&request).await?;
            let page = body
                .as_array()
                .ok_or_else(|| ConnectorError::malformed(SOURCE, "repository list is not an array"))?;
            repos.extend(owned_public_repos(page));
            match link.as_deref().and_then(parse_next_link) {
                Some(next) => request = self.get(next),
                None => break,
            }
        }
        info!(repos = repos.len(), "found public repositories");

        Ok(repos
            .into_iter()
            .map(|repo| {
                StreamSpec::new(format!("{STREAM_PREFIX}{repo}"), "commit")
                    .inclusive()
                    .page_size(PAGE_SIZE)
                    .scope(repo)
            })
            .collect())
    }

    async fn fetch_page(
        &self,
        stream: &StreamSpec,
        since: Option<&Since>,
        page: Option<&PageToken>,
    ) -> Result<Page, ConnectorError> {
        let Some(repo) = stream.scope.as_deref() else {
            return Err(unknown_stream(SOURCE, stream));
        };
        let request = match page {
            // Link URLs already carry every query parameter.
            Some(PageToken::Url(url)) => self.get(url.clone()),
            _ => {
                let mut request = self
                    .get(format!("{}/repos/{repo}/commits", self.api_base))
                    .query("author", &self.username)
                    .query("per_page", PAGE_SIZE);
                if let Some(Since::After(at)) = since {
                    request = request.query("since", at.format("%Y-%m-%dT%H:%M:%SZ"));
                }
                request
            }
        };

        let response = match self.http.send(SOURCE.as_str(), &request).await {
            Ok(response) => response,
            // An empty repository answers 409.
            Err(FetchError::HttpStatus { status: 409, .. }) => {
                debug!(repo, "repository is empty");
                return Ok(Page::default());
            }
            // Deleted, renamed away or legally blocked since it was listed.
            Err(FetchError::HttpStatus { status: status @ (404 | 451), .. }) => {
                warn!(repo, status, "repository unavailable; skipping");
                return Ok(Page::default());
            }
            Err(err) => return Err(ConnectorError::from_fetch(SOURCE, err)),
        };
        let (body, link) = decode(response)?;
        normalize_commit_page(repo, &body, link.as_deref())
    }
}
