//! Foursquare/Swarm check-ins (v2 API) with places resolved through the
//! Places API when a key is configured.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use footprint_core::catalog::column;
use footprint_core::{
    ColumnDef, ColumnType, EntityDef, MetricDef, MetricQuery, ParentDef, ParentLink, Since,
    SourceDefinition, SourceId, SourceRecord,
};
use footprint_storage::{FetchError, HttpFetcher, HttpRequest};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::json::{at, bool_at, f64_at, i64_at, id_string, present, str_at};
use crate::{
    fetch_json, http_fetcher, require, send, unknown_stream, Connector, ConnectorError,
    ConnectorSettings, Page, PageToken, StreamSpec,
};

const SOURCE: SourceId = SourceId::Foursquare;
const V2_BASE: &str = "https://api.foursquare.com/v2";
const V2_VERSION: &str = "20250617";
const PLACES_BASE: &str = "https://places-api.foursquare.com";
const PLACES_VERSION: &str = "2025-06-17";
const PLACE_FIELDS: &str = "fsq_place_id,name,latitude,longitude,categories,location,website,tel";

pub const CHECKINS_STREAM: &str = "checkins";
pub const PAGE_SIZE: usize = 200;

const PLACE_COLUMNS: &[ColumnDef] = &[
    column("name", ColumnType::Text),
    column("latitude", ColumnType::Real),
    column("longitude", ColumnType::Real),
    column("address", ColumnType::Text),
    column("locality", ColumnType::Text),
    column("region", ColumnType::Text),
    column("postcode", ColumnType::Text),
    column("country", ColumnType::Text),
    column("formatted_address", ColumnType::Text),
    column("category_id", ColumnType::Text),
    column("category_name", ColumnType::Text),
    column("website", ColumnType::Text),
    column("tel", ColumnType::Text),
];

const CHECKIN_COLUMNS: &[ColumnDef] = &[
    column("fsq_place_id", ColumnType::Text),
    column("created_at", ColumnType::Integer),
    column("type", ColumnType::Text),
    column("shout", ColumnType::Text),
    column("private", ColumnType::Integer),
    column("visibility", ColumnType::Text),
    column("is_mayor", ColumnType::Integer),
    column("liked", ColumnType::Integer),
    column("comments_count", ColumnType::Integer),
];

pub static DEFINITION: SourceDefinition = SourceDefinition {
    source: SOURCE,
    entities: &[
        EntityDef {
            entity: "place",
            table: "places",
            key_column: "fsq_place_id",
            columns: PLACE_COLUMNS,
            parent: None,
        },
        EntityDef {
            entity: "checkin",
            table: "checkins",
            key_column: "checkin_id",
            columns: CHECKIN_COLUMNS,
            parent: Some(ParentDef {
                entity: "place",
                column: "fsq_place_id",
            }),
        },
    ],
    metric_queries: &[MetricQuery {
        name: "checkins",
        sql: "SELECT created_at AS bucket_ts, fsq_place_id FROM checkins \
              WHERE created_at IS NOT NULL",
        metrics: &[
            MetricDef::count("checkins"),
            MetricDef::count_distinct("unique_places", "fsq_place_id"),
        ],
    }],
    comparison_metrics: &["checkins", "unique_places"],
};

/// Place attributes from a v2 check-in's embedded venue.
pub fn venue_place_fields(venue: &JsonValue) -> BTreeMap<String, JsonValue> {
    let category = venue
        .get("categories")
        .and_then(JsonValue::as_array)
        .and_then(|cats| {
            cats.iter()
                .find(|c| bool_at(c, &["primary"]) == Some(true))
                .or_else(|| cats.first())
        });
    let formatted = venue
        .pointer("/location/formattedAddress")
        .and_then(JsonValue::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(JsonValue::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|s| !s.is_empty());

    let record = SourceRecord::new("place", "")
        .field_opt("name", present(venue, &["name"], str_at))
        .field_opt("latitude", present(venue, &["location", "lat"], f64_at))
        .field_opt("longitude", present(venue, &["location", "lng"], f64_at))
        .field_opt("address", present(venue, &["location", "address"], str_at))
        .field_opt("locality", present(venue, &["location", "city"], str_at))
        .field_opt("region", present(venue, &["location", "state"], str_at))
        .field_opt("postcode", present(venue, &["location", "postalCode"], str_at))
        .field_opt("country", present(venue, &["location", "country"], str_at))
        .field("formatted_address", json!(formatted))
        .field("category_id", json!(category.and_then(|c| id_string(c, &["id"]))))
        .field("category_name", json!(category.and_then(|c| str_at(c, &["name"]))));
    record.fields
}

/// Place record from a Places API detail response.
pub fn normalize_place(place: &JsonValue) -> Option<SourceRecord> {
    let id = id_string(place, &["fsq_place_id"]).or_else(|| id_string(place, &["fsq_id"]))?;
    let category = place
        .get("categories")
        .and_then(JsonValue::as_array)
        .and_then(|cats| cats.first());
    Some(
        SourceRecord::new("place", id)
            .field_opt("name", present(place, &["name"], str_at))
            .field_opt("latitude", present(place, &["latitude"], f64_at))
            .field_opt("longitude", present(place, &["longitude"], f64_at))
            .field_opt("address", present(place, &["location", "address"], str_at))
            .field_opt("locality", present(place, &["location", "locality"], str_at))
            .field_opt("region", present(place, &["location", "region"], str_at))
            .field_opt("postcode", present(place, &["location", "postcode"], str_at))
            .field_opt("country", present(place, &["location", "country"], str_at))
            .field(
                "formatted_address",
                json!(str_at(place, &["location", "formatted_address"])),
            )
            .field(
                "category_id",
                json!(category.and_then(|c| {
                    id_string(c, &["fsq_category_id"]).or_else(|| id_string(c, &["id"]))
                })),
            )
            .field("category_name", json!(category.and_then(|c| str_at(c, &["name"]))))
            .field_opt("website", present(place, &["website"], str_at))
            .field_opt("tel", present(place, &["tel"], str_at)),
    )
}

pub fn normalize_checkin(checkin: &JsonValue) -> Option<SourceRecord> {
    let id = id_string(checkin, &["id"])?;
    let created_at = i64_at(checkin, &["createdAt"]);
    let venue = at(checkin, &["venue"]);
    let place_id = venue.and_then(|v| id_string(v, &["id"]));
    let embedded = venue.map(venue_place_fields);

    Some(
        SourceRecord::new("checkin", id)
            .field_opt("created_at", present(checkin, &["createdAt"], i64_at))
            .field_opt("type", present(checkin, &["type"], str_at))
            .field_opt("shout", present(checkin, &["shout"], str_at))
            .field_opt("private", present(checkin, &["private"], bool_at))
            .field_opt("visibility", present(checkin, &["visibility"], str_at))
            .field_opt("is_mayor", present(checkin, &["isMayor"], bool_at))
            .field_opt("liked", present(checkin, &["like"], bool_at))
            .field_opt("comments_count", present(checkin, &["comments", "count"], i64_at))
            .observed_at(created_at.and_then(|s| DateTime::from_timestamp(s, 0)))
            .parent("place", place_id, embedded),
    )
}

/// Normalizes one page of check-ins, newest first. Check-ins at or before
/// `since` were pulled by an earlier run; reaching one ends the stream.
pub fn normalize_checkin_page(
    body: &JsonValue,
    since: Option<&Since>,
    offset: usize,
) -> Result<Page, ConnectorError> {
    let items = body
        .pointer("/response/checkins/items")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ConnectorError::malformed(SOURCE, "response has no check-in items"))?;
    let floor = match since {
        Some(Since::After(at)) => Some(at.timestamp()),
        _ => None,
    };

    let mut records = Vec::with_capacity(items.len());
    let mut reached_floor = false;
    for item in items {
        let Some(created_at) = i64_at(item, &["createdAt"]) else {
            debug!(id = ?id_string(item, &["id"]), "check-in without createdAt; skipped");
            continue;
        };
        if floor.is_some_and(|floor| created_at <= floor) {
            reached_floor = true;
            break;
        }
        match normalize_checkin(item) {
            Some(record) => records.push(record),
            None => debug!("check-in without id"),
        }
    }

    let next = (!reached_floor && items.len() >= PAGE_SIZE)
        .then_some(PageToken::Offset(offset + items.len()));
    let upstream_count = if reached_floor { 0 } else { items.len() };
    Ok(Page::new(records, next).with_upstream_count(upstream_count))
}

pub struct FoursquareConnector {
    http: HttpFetcher,
    token: String,
    places_key: Option<String>,
    places_base: String,
}

impl FoursquareConnector {
    pub fn new(settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let token = require(
            SOURCE,
            &settings.credentials.foursquare_token,
            "FOURSQUARE_ACCESS_TOKEN",
        )?;
        let places_key = settings
            .credentials
            .foursquare_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        let http = http_fetcher(SOURCE, &settings.http, Duration::from_secs(1))?;
        Ok(Self {
            http,
            token,
            places_key,
            places_base: PLACES_BASE.to_string(),
        })
    }

    #[cfg(test)]
    fn with_places_base(mut self, base: impl Into<String>) -> Self {
        self.places_base = base.into();
        self
    }

    fn v2(&self, path: &str) -> HttpRequest {
        HttpRequest::get(format!("{V2_BASE}{path}"))
            .header("Authorization", format!("OAuth {}", self.token))
            .query("v", V2_VERSION)
    }
}

#[async_trait]
impl Connector for FoursquareConnector {
    fn source(&self) -> SourceId {
        SOURCE
    }

    async fn validate_credentials(&self) -> Result<(), ConnectorError> {
        send(&self.http, SOURCE, &self.v2("/users/self")).await.map(|_| ())
    }

    async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError> {
        Ok(vec![StreamSpec::new(CHECKINS_STREAM, "checkin").page_size(PAGE_SIZE)])
    }

    async fn fetch_page(
        &self,
        stream: &StreamSpec,
        since: Option<&Since>,
        page: Option<&PageToken>,
    ) -> Result<Page, ConnectorError> {
        if stream.name != CHECKINS_STREAM {
            return Err(unknown_stream(SOURCE, stream));
        }
        let offset = match page {
            Some(PageToken::Offset(offset)) => *offset,
            _ => 0,
        };
        let request = self
            .v2("/users/self/checkins")
            .query("limit", PAGE_SIZE)
            .query("offset", offset);
        let body = fetch_json(&self.http, SOURCE, &request).await?;
        normalize_checkin_page(&body, since, offset)
    }

    async fn resolve_parent(&self, link: &ParentLink) -> Result<Option<SourceRecord>, ConnectorError> {
        let (Some(key), Some(api_key)) = (&link.key, &self.places_key) else {
            return Ok(None);
        };
        let request = HttpRequest::get(format!("{}/places/{key}", self.places_base))
            .bearer(api_key)
            .header("Accept", "application/json")
            .header("X-Places-Api-Version", PLACES_VERSION)
            .query("fields", PLACE_FIELDS);
        let response = match self.http.send(SOURCE.as_str(), &request).await {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status: 404, .. }) => {
                warn!(place = %key, "place not found; using embedded venue");
                return Ok(None);
            }
            // A rejected key is fatal for the run; a flaky lookup is not.
            Err(err) => match ConnectorError::from_fetch(SOURCE, err) {
                ConnectorError::Transient { message, .. } => {
                    warn!(place = %key, error = %message, "place lookup failed; using embedded venue");
                    return Ok(None);
                }
                other => return Err(other),
            },
        };
        let body: JsonValue = response
            .json()
            .map_err(|err| ConnectorError::from_fetch(SOURCE, err))?;
        Ok(normalize_place(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fixtures::{load_json, serve_status};
    use crate::Credentials;
    use chrono::{TimeZone, Utc};
    use footprint_storage::{BackoffPolicy, HttpClientConfig};
    use std::path::PathBuf;

    async fn connector_with_places_at(status: u16, reason: &str) -> FoursquareConnector {
        let base = serve_status(status, reason, r#"{"message":"nope"}"#).await;
        let settings = ConnectorSettings {
            credentials: Credentials {
                foursquare_token: Some("token".into()),
                foursquare_api_key: Some("places-key".into()),
                ..Credentials::default()
            },
            import_dir: PathBuf::from("imports"),
            http: HttpClientConfig {
                backoff: BackoffPolicy {
                    max_retries: 0,
                    ..BackoffPolicy::default()
                },
                ..HttpClientConfig::default()
            },
        };
        FoursquareConnector::new(&settings)
            .expect("connector")
            .with_places_base(base)
    }

    fn place_link() -> ParentLink {
        ParentLink {
            entity: "place",
            key: Some("4b0588a1f964a520".into()),
            embedded: None,
        }
    }

    #[test]
    fn checkins_carry_the_venue_as_embedded_parent() {
        let body = load_json("foursquare/checkins_page.json");
        let page = normalize_checkin_page(&body, None, 0).expect("page");
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.next, None, "short page ends the stream");

        let first = &page.items[0];
        assert_eq!(first.key, "chk-3");
        assert_eq!(first.fields["created_at"], 1740819600);
        assert_eq!(first.fields["private"], true);
        assert_eq!(
            first.observed_at,
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).single()
        );
        let parent = first.parent.as_ref().expect("parent");
        assert_eq!(parent.key.as_deref(), Some("4b0588a1f964a520"));
        let venue = parent.embedded.as_ref().expect("embedded venue");
        assert_eq!(venue["name"], "Blue Bottle Coffee");
        assert_eq!(venue["locality"], "Berlin");
        assert_eq!(venue["category_name"], "Coffee Shop");
        assert_eq!(venue["formatted_address"], "Torstr. 1, 10119 Berlin, Germany");

        let no_venue = &page.items[2];
        assert_eq!(no_venue.parent.as_ref().and_then(|p| p.key.clone()), None);
    }

    #[test]
    fn reaching_the_watermark_stops_pagination() {
        let body = load_json("foursquare/checkins_page.json");
        // chk-2 was created at 1740733200; it and everything older is known.
        let since = Since::After(Utc.timestamp_opt(1740733200, 0).single().expect("ts"));
        let page = normalize_checkin_page(&body, Some(&since), 0).expect("page");
        let keys: Vec<&str> = page.items.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["chk-3"]);
        assert_eq!(page.next, None);
    }

    #[test]
    fn full_pages_continue_by_offset() {
        let items: Vec<JsonValue> = (0..PAGE_SIZE)
            .map(|i| json!({"id": format!("c{i}"), "createdAt": 1_700_000_000 - i as i64}))
            .collect();
        let body = json!({"response": {"checkins": {"count": 500, "items": items}}});
        let page = normalize_checkin_page(&body, None, 400).expect("page");
        assert_eq!(page.upstream_count, PAGE_SIZE);
        assert_eq!(page.next, Some(PageToken::Offset(400 + PAGE_SIZE)));
    }

    #[test]
    fn checkins_without_created_at_are_skipped() {
        let body = json!({"response": {"checkins": {"items": [
            {"id": "new", "createdAt": 1_740_900_000},
            {"id": "undated"},
            {"id": "between", "createdAt": 1_740_850_000},
            {"id": "old", "createdAt": 1_740_700_000},
        ]}}});
        let since = Since::After(Utc.timestamp_opt(1_740_800_000, 0).single().expect("ts"));
        let page = normalize_checkin_page(&body, Some(&since), 0).expect("page");
        let keys: Vec<&str> = page.items.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["new", "between"]);
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn rejected_places_key_fails_the_lookup() {
        let connector = connector_with_places_at(401, "Unauthorized").await;
        let err = connector.resolve_parent(&place_link()).await.err().expect("auth error");
        assert!(matches!(err, ConnectorError::Auth { source_id: SourceId::Foursquare, .. }), "{err}");
    }

    #[tokio::test]
    async fn unknown_or_unavailable_places_fall_back_to_the_embedded_venue() {
        let missing = connector_with_places_at(404, "Not Found").await;
        assert!(missing.resolve_parent(&place_link()).await.expect("lookup").is_none());

        let flaky = connector_with_places_at(503, "Service Unavailable").await;
        assert!(flaky.resolve_parent(&place_link()).await.expect("lookup").is_none());
    }

    #[test]
    fn places_api_detail_normalizes() {
        let place = normalize_place(&load_json("foursquare/place.json")).expect("place");
        assert_eq!(place.key, "4b0588a1f964a520");
        assert_eq!(place.fields["latitude"], 52.5291);
        assert_eq!(place.fields["category_id"], "13035");
        assert_eq!(place.fields["website"], "https://bluebottlecoffee.com");
    }
}
