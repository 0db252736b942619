use footprint_core::{SourceDefinition, SourceId, SourceRecord};
use serde_json::Value as JsonValue;

pub mod foursquare;
pub mod github;
pub mod hardcover;
pub mod letterboxd;
pub mod overcast;
pub mod readwise;
pub mod strong;

pub fn definition_for(source: SourceId) -> &'static SourceDefinition {
    match source {
        SourceId::Readwise => &readwise::DEFINITION,
        SourceId::Foursquare => &foursquare::DEFINITION,
        SourceId::Letterboxd => &letterboxd::DEFINITION,
        SourceId::Overcast => &overcast::DEFINITION,
        SourceId::Strong => &strong::DEFINITION,
        SourceId::Hardcover => &hardcover::DEFINITION,
        SourceId::Github => &github::DEFINITION,
    }
}

/// Copies the named top-level attributes of `value` onto `record` as-is.
pub(crate) fn copy_fields(mut record: SourceRecord, value: &JsonValue, names: &[&str]) -> SourceRecord {
    for name in names {
        if let Some(v) = value.get(*name) {
            record = record.field(name, v.clone());
        }
    }
    record
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::{Path, PathBuf};

    use serde_json::Value as JsonValue;

    use crate::ExportBundle;

    pub fn fixture_path(relative: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .join(relative)
    }

    pub fn load_json(relative: &str) -> JsonValue {
        let path = fixture_path(relative);
        let data = std::fs::read_to_string(&path)
            .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()));
        serde_json::from_str(&data).expect("fixture json")
    }

    pub fn load_bundle(path: impl AsRef<Path>) -> ExportBundle {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()));
        serde_json::from_str(&data).expect("bundle json")
    }

    /// Serves every request on a local port with the same canned status and
    /// JSON body, returning the base URL.
    pub async fn serve_status(status: u16, reason: &str, body: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }
}
