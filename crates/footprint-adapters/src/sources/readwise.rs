//! Readwise highlights (v2 export) and Reader documents (v3 list).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use footprint_core::catalog::column;
use footprint_core::{
    Aggregate, ColumnDef, ColumnType, EntityDef, MetricDef, MetricQuery, ParentDef, Since,
    SourceDefinition, SourceId, SourceRecord,
};
use footprint_storage::{format_timestamp, HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;

use super::copy_fields;
use crate::json::{id_string, parse_minutes, str_at, timestamp_at};
use crate::{
    fetch_json, http_fetcher, require, send, unknown_stream, Connector, ConnectorError,
    ConnectorSettings, Page, PageToken, StreamSpec,
};

const SOURCE: SourceId = SourceId::Readwise;
const V2_BASE: &str = "https://readwise.io/api/v2";
const V3_BASE: &str = "https://readwise.io/api/v3";

pub const BOOKS_STREAM: &str = "books";
pub const DOCUMENTS_STREAM: &str = "documents";

const BOOK_COLUMNS: &[ColumnDef] = &[
    column("title", ColumnType::Text),
    column("author", ColumnType::Text),
    column("readable_title", ColumnType::Text),
    column("source", ColumnType::Text),
    column("category", ColumnType::Text),
    column("cover_image_url", ColumnType::Text),
    column("unique_url", ColumnType::Text),
    column("document_note", ColumnType::Text),
    column("summary", ColumnType::Text),
    column("readwise_url", ColumnType::Text),
    column("source_url", ColumnType::Text),
    column("asin", ColumnType::Text),
    column("is_deleted", ColumnType::Integer),
];

const HIGHLIGHT_COLUMNS: &[ColumnDef] = &[
    column("book_id", ColumnType::Text),
    column("text", ColumnType::Text),
    column("note", ColumnType::Text),
    column("location", ColumnType::Integer),
    column("location_type", ColumnType::Text),
    column("color", ColumnType::Text),
    column("url", ColumnType::Text),
    column("highlighted_at", ColumnType::Text),
    column("created_at", ColumnType::Text),
    column("updated_at", ColumnType::Text),
    column("is_favorite", ColumnType::Integer),
    column("is_discard", ColumnType::Integer),
    column("is_deleted", ColumnType::Integer),
];

const DOCUMENT_COLUMNS: &[ColumnDef] = &[
    column("url", ColumnType::Text),
    column("source_url", ColumnType::Text),
    column("title", ColumnType::Text),
    column("author", ColumnType::Text),
    column("source", ColumnType::Text),
    column("category", ColumnType::Text),
    column("location", ColumnType::Text),
    column("site_name", ColumnType::Text),
    column("word_count", ColumnType::Integer),
    column("reading_time", ColumnType::Text),
    column("reading_time_mins", ColumnType::Integer),
    column("notes", ColumnType::Text),
    column("summary", ColumnType::Text),
    column("parent_id", ColumnType::Text),
    column("reading_progress", ColumnType::Real),
    column("published_date", ColumnType::Text),
    column("first_opened_at", ColumnType::Text),
    column("last_opened_at", ColumnType::Text),
    column("saved_at", ColumnType::Text),
    column("last_moved_at", ColumnType::Text),
    column("created_at", ColumnType::Text),
    column("updated_at", ColumnType::Text),
];

pub static DEFINITION: SourceDefinition = SourceDefinition {
    source: SOURCE,
    entities: &[
        EntityDef {
            entity: "book",
            table: "books",
            key_column: "user_book_id",
            columns: BOOK_COLUMNS,
            parent: None,
        },
        EntityDef {
            entity: "highlight",
            table: "highlights",
            key_column: "highlight_id",
            columns: HIGHLIGHT_COLUMNS,
            parent: Some(ParentDef {
                entity: "book",
                column: "book_id",
            }),
        },
        EntityDef {
            entity: "document",
            table: "documents",
            key_column: "document_id",
            columns: DOCUMENT_COLUMNS,
            parent: None,
        },
    ],
    metric_queries: &[
        MetricQuery {
            name: "archived_documents",
            sql: "SELECT last_moved_at AS bucket_ts, word_count, reading_time_mins \
                  FROM documents \
                  WHERE location = 'archive' AND last_moved_at IS NOT NULL",
            metrics: &[
                MetricDef::count("articles"),
                MetricDef::sum("words", "word_count"),
                MetricDef::sum("reading_time_mins", "reading_time_mins"),
                MetricDef::stat("max_words_per_article", Aggregate::Max, "word_count")
                    .integer()
                    .or_zero(),
                MetricDef::stat("median_words_per_article", Aggregate::Median, "word_count")
                    .integer()
                    .or_zero(),
                MetricDef::stat("min_words_per_article", Aggregate::Min, "word_count")
                    .integer()
                    .or_zero(),
            ],
        },
        MetricQuery {
            name: "highlights",
            sql: "SELECT highlighted_at AS bucket_ts FROM highlights \
                  WHERE highlighted_at IS NOT NULL AND COALESCE(is_deleted, 0) = 0",
            metrics: &[MetricDef::count("highlights")],
        },
    ],
    comparison_metrics: &["articles", "words", "reading_time_mins"],
};

const BOOK_FIELDS: &[&str] = &[
    "title",
    "author",
    "readable_title",
    "source",
    "category",
    "cover_image_url",
    "unique_url",
    "document_note",
    "summary",
    "readwise_url",
    "source_url",
    "asin",
    "is_deleted",
];

const HIGHLIGHT_FIELDS: &[&str] = &[
    "text",
    "note",
    "location",
    "location_type",
    "color",
    "url",
    "highlighted_at",
    "created_at",
    "updated_at",
    "is_favorite",
    "is_discard",
    "is_deleted",
];

const DOCUMENT_FIELDS: &[&str] = &[
    "url",
    "source_url",
    "title",
    "author",
    "source",
    "category",
    "location",
    "site_name",
    "word_count",
    "reading_time",
    "notes",
    "summary",
    "parent_id",
    "reading_progress",
    "published_date",
    "first_opened_at",
    "last_opened_at",
    "saved_at",
    "last_moved_at",
    "created_at",
    "updated_at",
];

/// Records of one export result: the book first, then its highlights, each
/// of which carries the book's attributes in case the book record fails.
pub fn normalize_export_book(book: &JsonValue) -> Vec<SourceRecord> {
    let Some(book_id) = id_string(book, &["user_book_id"]) else {
        return Vec::new();
    };
    let book_record = copy_fields(SourceRecord::new("book", book_id.clone()), book, BOOK_FIELDS);
    let embedded: BTreeMap<String, JsonValue> = book_record.fields.clone();

    let mut records = vec![book_record];
    let highlights = book
        .get("highlights")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for highlight in highlights {
        let Some(highlight_id) = id_string(highlight, &["id"]) else {
            continue;
        };
        let record = copy_fields(
            SourceRecord::new("highlight", highlight_id),
            highlight,
            HIGHLIGHT_FIELDS,
        )
        .observed_at(timestamp_at(highlight, &["updated_at"]))
        .parent("book", Some(book_id.clone()), Some(embedded.clone()));
        records.push(record);
    }
    records
}

pub fn normalize_document(document: &JsonValue) -> Option<SourceRecord> {
    let id = id_string(document, &["id"])?;
    let mut record = copy_fields(SourceRecord::new("document", id), document, DOCUMENT_FIELDS)
        .observed_at(timestamp_at(document, &["updated_at"]));
    if let Some(minutes) = str_at(document, &["reading_time"]).and_then(parse_minutes) {
        record = record.field("reading_time_mins", minutes);
    }
    Some(record)
}

fn results(body: &JsonValue) -> Result<&[JsonValue], ConnectorError> {
    body.get("results")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| ConnectorError::malformed(SOURCE, "response has no `results` array"))
}

fn next_cursor(body: &JsonValue) -> Option<PageToken> {
    id_string(body, &["nextPageCursor"]).map(PageToken::Cursor)
}

pub fn normalize_export_page(body: &JsonValue) -> Result<Page, ConnectorError> {
    let books = results(body)?;
    let items = books.iter().flat_map(normalize_export_book).collect();
    Ok(Page::new(items, next_cursor(body)).with_upstream_count(books.len()))
}

pub fn normalize_document_page(body: &JsonValue) -> Result<Page, ConnectorError> {
    let documents = results(body)?;
    let items = documents.iter().filter_map(normalize_document).collect();
    Ok(Page::new(items, next_cursor(body)).with_upstream_count(documents.len()))
}

pub struct ReadwiseConnector {
    http: HttpFetcher,
    token: String,
}

impl ReadwiseConnector {
    pub fn new(settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let token = require(
            SOURCE,
            &settings.credentials.readwise_token,
            "READWISE_ACCESS_TOKEN",
        )?;
        // 20 requests per minute on both APIs.
        let http = http_fetcher(SOURCE, &settings.http, Duration::from_secs(3))?;
        Ok(Self { http, token })
    }

    fn request(&self, url: String, since: Option<&Since>, page: Option<&PageToken>) -> HttpRequest {
        let mut request = HttpRequest::get(url).header("Authorization", format!("Token {}", self.token));
        if let Some(Since::After(at)) = since {
            request = request.query("updatedAfter", format_timestamp(*at));
        }
        if let Some(PageToken::Cursor(cursor)) = page {
            request = request.query("pageCursor", cursor);
        }
        request
    }
}

#[async_trait]
impl Connector for ReadwiseConnector {
    fn source(&self) -> SourceId {
        SOURCE
    }

    async fn validate_credentials(&self) -> Result<(), ConnectorError> {
        let request = HttpRequest::get(format!("{V2_BASE}/auth/"))
            .header("Authorization", format!("Token {}", self.token));
        send(&self.http, SOURCE, &request).await.map(|_| ())
    }

    async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError> {
        Ok(vec![
            StreamSpec::new(BOOKS_STREAM, "highlight"),
            StreamSpec::new(DOCUMENTS_STREAM, "document"),
        ])
    }

    async fn fetch_page(
        &self,
        stream: &StreamSpec,
        since: Option<&Since>,
        page: Option<&PageToken>,
    ) -> Result<Page, ConnectorError> {
        match stream.name.as_str() {
            BOOKS_STREAM => {
                let mut request = self.request(format!("{V2_BASE}/export/"), since, page);
                if since.is_some() {
                    request = request.query("includeDeleted", "true");
                }
                normalize_export_page(&fetch_json(&self.http, SOURCE, &request).await?)
            }
            DOCUMENTS_STREAM => {
                let request = self.request(format!("{V3_BASE}/list/"), since, page);
                normalize_document_page(&fetch_json(&self.http, SOURCE, &request).await?)
            }
            _ => Err(unknown_stream(SOURCE, stream)),
        }
    }
}
