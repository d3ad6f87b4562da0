use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde_json::{Map, Value};

use crate::config::LookupSettings;
use crate::domain::MetadataRecord;
use crate::error::JoinError;

/// Fields every lookup response is expected to carry.
pub const EXPECTED_FIELDS: [&str; 6] = ["corpusId", "paperId", "title", "doi", "arxivId", "url"];

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(PaperResponse),
    RateLimited { retry_after: Option<Duration> },
}

pub trait MetadataLookup: Send + Sync {
    fn fetch_paper(&self, id: &str) -> Result<LookupOutcome, JoinError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperResponse {
    pub raw: Value,
}

impl PaperResponse {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        EXPECTED_FIELDS
            .iter()
            .copied()
            .filter(|field| self.raw.get(field).is_none())
            .collect()
    }

    pub fn to_record(&self) -> MetadataRecord {
        MetadataRecord {
            doc_id: self.scalar("corpusId"),
            doc_hash: self.scalar("paperId"),
            title: self.scalar("title"),
            doi: self.scalar("doi"),
            arxiv_id: self.scalar("arxivId"),
            url: self.scalar("url"),
        }
    }

    fn scalar(&self, field: &str) -> Option<String> {
        let value = match self.raw.get(field)? {
            Value::String(value) => value.clone(),
            Value::Number(value) => value.to_string(),
            _ => return None,
        };
        (!value.is_empty()).then_some(value)
    }
}

#[derive(Clone)]
pub struct SemanticScholarHttpClient {
    client: Client,
    base_url: String,
}

impl SemanticScholarHttpClient {
    pub fn new(settings: &LookupSettings) -> Result<Self, JoinError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("scirex-join/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| JoinError::LookupHttp(err.to_string()))?,
        );

        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("S2_API_KEY").ok())
            .filter(|key| !key.trim().is_empty());
        if let Some(api_key) = api_key {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(api_key.trim())
                    .map_err(|err| JoinError::LookupHttp(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| JoinError::LookupHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn paper_url(&self, id: &str) -> String {
        format!("{}/{id}", self.base_url)
    }
}

impl MetadataLookup for SemanticScholarHttpClient {
    fn fetch_paper(&self, id: &str) -> Result<LookupOutcome, JoinError> {
        let response = self
            .client
            .get(self.paper_url(id))
            .send()
            .map_err(|err| JoinError::LookupHttp(err.to_string()))?;

        let status = response.status();
        let disposition = classify_status(status, response.headers());
        match disposition {
            StatusDisposition::ReadBody => {}
            StatusDisposition::Outcome(outcome) => {
                tracing::debug!(id, status = status.as_u16(), "lookup answered without a body");
                return Ok(outcome);
            }
            StatusDisposition::Fail => {
                let message = response
                    .text()
                    .unwrap_or_else(|_| "metadata lookup failed".to_string());
                return Err(JoinError::LookupStatus {
                    status: status.as_u16(),
                    message,
                });
            }
        }

        let body = response
            .text()
            .map_err(|err| JoinError::LookupHttp(err.to_string()))?;
        match serde_json::from_str::<Value>(&body) {
            Ok(raw) => Ok(LookupOutcome::Found(PaperResponse::new(raw))),
            Err(err) => {
                tracing::warn!(id, error = %err, "lookup response is not JSON");
                Ok(LookupOutcome::Found(PaperResponse::empty()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusDisposition {
    ReadBody,
    Outcome(LookupOutcome),
    Fail,
}

/// 429 is a rate limit, 404 an empty paper, any other non-success is fatal.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> StatusDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return StatusDisposition::Outcome(LookupOutcome::RateLimited {
            retry_after: retry_after(headers),
        });
    }
    if status == StatusCode::NOT_FOUND {
        return StatusDisposition::Outcome(LookupOutcome::Found(PaperResponse::empty()));
    }
    if status.is_success() {
        StatusDisposition::ReadBody
    } else {
        StatusDisposition::Fail
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_uses_corpus_id_as_doc_id() {
        let response = PaperResponse::new(json!({
            "corpusId": 4565,
            "paperId": "9f67b3edc67a35c884bd532a5e73fa3a7f3660d8",
            "title": "Some Title",
            "doi": null,
            "arxivId": "1512.03385",
            "url": "https://www.semanticscholar.org/paper/9f67"
        }));

        assert!(response.missing_fields().is_empty());
        let record = response.to_record();
        assert_eq!(record.doc_id.as_deref(), Some("4565"));
        assert_eq!(
            record.doc_hash.as_deref(),
            Some("9f67b3edc67a35c884bd532a5e73fa3a7f3660d8")
        );
        assert_eq!(record.doi, None);
        assert_eq!(record.arxiv_id.as_deref(), Some("1512.03385"));
    }

    #[test]
    fn missing_fields_are_listed_not_filled() {
        let response = PaperResponse::new(json!({ "title": "Only Title" }));
        assert_eq!(
            response.missing_fields(),
            vec!["corpusId", "paperId", "doi", "arxivId", "url"]
        );
        let record = response.to_record();
        assert_eq!(record.title.as_deref(), Some("Only Title"));
        assert_eq!(record.doc_id, None);
    }

    #[test]
    fn string_fields_are_kept_verbatim() {
        let record = PaperResponse::new(json!({
            "title": "Deep Learning ",
            "doi": " 10.1/x",
            "arxivId": ""
        }))
        .to_record();
        assert_eq!(record.title.as_deref(), Some("Deep Learning "));
        assert_eq!(record.doi.as_deref(), Some(" 10.1/x"));
        assert_eq!(record.arxiv_id, None);
    }

    fn headers(retry_after: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn too_many_requests_is_rate_limited() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers(Some(" 120 "))),
            StatusDisposition::Outcome(LookupOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
            })
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers(None)),
            StatusDisposition::Outcome(LookupOutcome::RateLimited { retry_after: None })
        );
    }

    #[test]
    fn non_numeric_retry_after_is_ignored() {
        assert_eq!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                &headers(Some("Wed, 21 Oct 2015 07:28:00 GMT"))
            ),
            StatusDisposition::Outcome(LookupOutcome::RateLimited { retry_after: None })
        );
    }

    #[test]
    fn not_found_is_an_empty_paper() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, &headers(None)),
            StatusDisposition::Outcome(LookupOutcome::Found(PaperResponse::empty()))
        );
    }

    #[test]
    fn success_reads_body_and_other_errors_fail() {
        assert_eq!(
            classify_status(StatusCode::OK, &headers(None)),
            StatusDisposition::ReadBody
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, &headers(None)),
            StatusDisposition::Fail
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &headers(Some("5"))),
            StatusDisposition::Fail
        );
    }

    #[test]
    fn empty_response_yields_empty_record() {
        assert!(PaperResponse::empty().to_record().is_empty());
    }
}
