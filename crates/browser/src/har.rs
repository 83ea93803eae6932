//! HAR 1.2 document built from a session's recorded traffic.

use serde::Serialize;

use crate::netwatch::{TraceEntry, TraceSnapshot};

const PAGE_ID: &str = "page_1";

#[derive(Debug, Serialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub pages: Vec<HarPage>,
    pub entries: Vec<HarEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPage {
    pub started_date_time: String,
    pub id: String,
    pub title: String,
    pub page_timings: HarPageTimings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPageTimings {
    pub on_content_load: f64,
    pub on_load: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub pageref: String,
    pub started_date_time: String,
    /// Total elapsed milliseconds, `-1` when the exchange never finished.
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: HarCache,
    pub timings: HarTimings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<HarCookie>,
    pub headers: Vec<HarHeader>,
    pub query_string: Vec<HarHeader>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: i64,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<HarCookie>,
    pub headers: Vec<HarHeader>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
}

#[derive(Debug, Serialize)]
pub struct HarCookie {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct HarHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct HarCache {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarTimings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

/// Build the HAR document for one session. The snapshot covers the whole
/// session lifetime because recording starts before the first navigation.
pub fn build(page_url: &str, snapshot: &TraceSnapshot) -> Har {
    let comment = (snapshot.dropped > 0)
        .then(|| format!("{} requests beyond the trace cap were not recorded", snapshot.dropped));

    Har {
        log: HarLog {
            version: "1.2".to_string(),
            creator: HarCreator {
                name: "pagecast".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            pages: vec![HarPage {
                started_date_time: snapshot.started.to_rfc3339(),
                id: PAGE_ID.to_string(),
                title: page_url.to_string(),
                page_timings: HarPageTimings {
                    on_content_load: -1.0,
                    on_load: -1.0,
                },
            }],
            entries: snapshot.entries.iter().map(entry_from).collect(),
            comment,
        },
    }
}

fn entry_from(trace: &TraceEntry) -> HarEntry {
    let time = trace
        .finished
        .map(|end| (end - trace.started).num_milliseconds().max(0) as f64)
        .unwrap_or(-1.0);

    let http_version = trace
        .protocol
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    let redirect_url = trace
        .response_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("location"))
        .map(|(_, value)| value.clone())
        .unwrap_or_default();

    HarEntry {
        pageref: PAGE_ID.to_string(),
        started_date_time: trace.started.to_rfc3339(),
        time,
        request: HarRequest {
            method: trace.method.clone(),
            url: trace.url.clone(),
            http_version: http_version.clone(),
            cookies: Vec::new(),
            headers: Vec::new(),
            query_string: Vec::new(),
            headers_size: -1,
            body_size: -1,
        },
        response: HarResponse {
            status: trace.status,
            status_text: trace.status_text.clone(),
            http_version,
            cookies: Vec::new(),
            headers: trace
                .response_headers
                .iter()
                .map(|(name, value)| HarHeader {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            content: HarContent {
                size: trace.body_size.max(0.0) as i64,
                mime_type: trace.mime_type.clone(),
            },
            redirect_url,
            headers_size: -1,
            body_size: trace.body_size.max(0.0) as i64,
        },
        cache: HarCache {},
        timings: HarTimings {
            send: -1.0,
            wait: -1.0,
            receive: -1.0,
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn snapshot_with(entries: Vec<TraceEntry>, dropped: u64) -> TraceSnapshot {
        TraceSnapshot {
            started: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            entries,
            dropped,
        }
    }

    fn finished_entry() -> TraceEntry {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        TraceEntry {
            started,
            url: "https://example.com/".to_string(),
            method: "GET".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            mime_type: "text/html".to_string(),
            protocol: Some("h2".to_string()),
            response_headers: vec![("Content-Type".to_string(), "text/html".to_string())],
            body_size: 1234.0,
            finished: Some(started + chrono::Duration::milliseconds(250)),
        }
    }

    #[test]
    fn document_shape() {
        let har = build("https://example.com/", &snapshot_with(vec![finished_entry()], 0));
        assert_eq!(har.log.version, "1.2");
        assert_eq!(har.log.creator.name, "pagecast");
        assert_eq!(har.log.pages.len(), 1);
        assert_eq!(har.log.pages[0].title, "https://example.com/");
        assert_eq!(har.log.entries.len(), 1);
        assert!(har.log.comment.is_none());

        let entry = &har.log.entries[0];
        assert_eq!(entry.time, 250.0);
        assert_eq!(entry.response.status, 200);
        assert_eq!(entry.response.http_version, "h2");
        assert_eq!(entry.response.body_size, 1234);
    }

    #[test]
    fn unfinished_entries_get_negative_time() {
        let mut entry = finished_entry();
        entry.finished = None;
        let har = build("https://example.com/", &snapshot_with(vec![entry], 0));
        assert_eq!(har.log.entries[0].time, -1.0);
    }

    #[test]
    fn dropped_entries_are_noted() {
        let har = build("https://example.com/", &snapshot_with(Vec::new(), 7));
        assert!(har.log.comment.as_deref().unwrap().contains('7'));
    }

    #[test]
    fn redirect_url_comes_from_the_location_header() {
        let mut entry = finished_entry();
        entry.status = 302;
        entry
            .response_headers
            .push(("Location".to_string(), "https://next.example/".to_string()));
        let har = build("https://example.com/", &snapshot_with(vec![entry], 0));
        assert_eq!(har.log.entries[0].response.redirect_url, "https://next.example/");
    }

    #[test]
    fn serialized_field_names_follow_the_format() {
        let har = build("https://example.com/", &snapshot_with(vec![finished_entry()], 0));
        let value = serde_json::to_value(&har).unwrap();

        assert!(value["log"]["pages"][0]["startedDateTime"].is_string());
        assert!(value["log"]["pages"][0]["pageTimings"]["onLoad"].is_number());

        let entry = &value["log"]["entries"][0];
        assert_eq!(entry["pageref"], "page_1");
        assert!(entry["request"]["httpVersion"].is_string());
        assert!(entry["response"]["redirectURL"].is_string());
        assert!(entry["response"]["content"]["mimeType"].is_string());
    }
}
