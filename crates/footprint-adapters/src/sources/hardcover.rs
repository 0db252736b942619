//! Hardcover finished books over GraphQL. The API offers no change filter,
//! so every run re-reads the whole shelf and relies on idempotent upserts.

use std::time::Duration;

use async_trait::async_trait;
use footprint_core::catalog::column;
use footprint_core::{
    Aggregate, ColumnDef, ColumnType, EntityDef, MetricDef, MetricQuery, Since, SourceDefinition,
    SourceId, SourceRecord,
};
use footprint_storage::{HttpFetcher, HttpRequest};
use serde_json::{json, Value as JsonValue};

use crate::json::{f64_at, id_string, present, str_at};
use crate::{
    fetch_json, http_fetcher, require, unknown_stream, Connector, ConnectorError,
    ConnectorSettings, Page, PageToken, StreamSpec,
};

const SOURCE: SourceId = SourceId::Hardcover;
const API_URL: &str = "https://api.hardcover.app/v1/graphql";
const READ_STATUS: i64 = 3;

pub const BOOKS_STREAM: &str = "books";
pub const PAGE_SIZE: usize = 100;

const FINISHED_BOOKS_QUERY: &str = r#"
query FinishedBooks($status: Int!, $limit: Int!, $offset: Int!) {
  me {
    user_books(
      where: {status_id: {_eq: $status}}
      order_by: {id: asc}
      limit: $limit
      offset: $offset
    ) {
      id
      rating
      date_added
      reviewed_at
      book {
        title
        slug
        cached_contributors
      }
    }
  }
}
"#;

const BOOK_COLUMNS: &[ColumnDef] = &[
    column("title", ColumnType::Text),
    column("author", ColumnType::Text),
    column("rating", ColumnType::Real),
    column("date_added", ColumnType::Text),
    column("reviewed_at", ColumnType::Text),
    column("date_read", ColumnType::Text),
    column("user_book_id", ColumnType::Text),
];

pub static DEFINITION: SourceDefinition = SourceDefinition {
    source: SOURCE,
    entities: &[EntityDef {
        entity: "book",
        table: "books",
        key_column: "slug",
        columns: BOOK_COLUMNS,
        parent: None,
    }],
    metric_queries: &[MetricQuery {
        name: "finished_books",
        sql: "SELECT date_read AS bucket_ts, rating FROM books WHERE date_read IS NOT NULL",
        metrics: &[
            MetricDef::count("books_finished"),
            MetricDef::stat("avg_rating", Aggregate::Average, "rating"),
        ],
    }],
    comparison_metrics: &["books_finished"],
};

/// First contributor's name; contributors come either as `{author: {name}}`
/// or as `{name}`.
fn first_author(contributors: Option<&JsonValue>) -> Option<&str> {
    let first = contributors?.as_array()?.first()?;
    str_at(first, &["author", "name"]).or_else(|| str_at(first, &["name"]))
}

pub fn normalize_user_book(user_book: &JsonValue) -> Option<SourceRecord> {
    let book = user_book.get("book")?;
    let slug = str_at(book, &["slug"])?;
    let reviewed_at = str_at(user_book, &["reviewed_at"]);
    let date_added = str_at(user_book, &["date_added"]);
    Some(
        SourceRecord::new("book", slug)
            .field_opt("title", present(book, &["title"], str_at))
            .field("author", json!(first_author(book.get("cached_contributors"))))
            .field_opt("rating", present(user_book, &["rating"], f64_at))
            .field("date_added", json!(date_added))
            .field("reviewed_at", json!(reviewed_at))
            .field("date_read", json!(reviewed_at.or(date_added)))
            .field_opt("user_book_id", present(user_book, &["id"], id_string)),
    )
}

pub fn normalize_books_page(body: &JsonValue, offset: usize) -> Result<Page, ConnectorError> {
    if let Some(errors) = body.get("errors").and_then(JsonValue::as_array) {
        let messages: Vec<&str> = errors
            .iter()
            .filter_map(|e| str_at(e, &["message"]))
            .collect();
        return Err(ConnectorError::malformed(
            SOURCE,
            format!("graphql errors: {}", messages.join("; ")),
        ));
    }
    // `me` is a list holding the authenticated user.
    let user_books = body
        .pointer("/data/me/0/user_books")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ConnectorError::malformed(SOURCE, "response has no user_books"))?;

    let items = user_books.iter().filter_map(normalize_user_book).collect();
    let next = (user_books.len() >= PAGE_SIZE).then_some(PageToken::Offset(offset + user_books.len()));
    Ok(Page::new(items, next).with_upstream_count(user_books.len()))
}

pub struct HardcoverConnector {
    http: HttpFetcher,
    token: String,
}

impl HardcoverConnector {
    pub fn new(settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let token = require(
            SOURCE,
            &settings.credentials.hardcover_token,
            "HARDCOVER_ACCESS_TOKEN",
        )?;
        let http = http_fetcher(SOURCE, &settings.http, Duration::from_secs(1))?;
        Ok(Self { http, token })
    }

    fn graphql(&self, query: &str, variables: JsonValue) -> HttpRequest {
        // Tokens copied from the settings page already carry the scheme.
        let token = self.token.strip_prefix("Bearer ").unwrap_or(&self.token);
        HttpRequest::post_json(API_URL, json!({"query": query, "variables": variables}))
            .bearer(token)
    }
}

#[async_trait]
impl Connector for HardcoverConnector {
    fn source(&self) -> SourceId {
        SOURCE
    }

    async fn validate_credentials(&self) -> Result<(), ConnectorError> {
        let body = fetch_json(&self.http, SOURCE, &self.graphql("{ me { id } }", json!({}))).await?;
        if body.pointer("/data/me/0/id").is_some() {
            Ok(())
        } else {
            Err(ConnectorError::Auth {
                source_id: SOURCE,
                message: "token did not resolve to a user".into(),
            })
        }
    }

    async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError> {
        Ok(vec![StreamSpec::new(BOOKS_STREAM, "book").page_size(PAGE_SIZE)])
    }

    async fn fetch_page(
        &self,
        stream: &StreamSpec,
        _since: Option<&Since>,
        page: Option<&PageToken>,
    ) -> Result<Page, ConnectorError> {
        if stream.name != BOOKS_STREAM {
            return Err(unknown_stream(SOURCE, stream));
        }
        let offset = match page {
            Some(PageToken::Offset(offset)) => *offset,
            _ => 0,
        };
        let request = self.graphql(
            FINISHED_BOOKS_QUERY,
            json!({"status": READ_STATUS, "limit": PAGE_SIZE, "offset": offset}),
        );
        let body = fetch_json(&self.http, SOURCE, &request).await?;
        normalize_books_page(&body, offset)
    }
}
