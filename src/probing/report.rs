//! Case report lookups against the PACER iquery endpoint.
//!
//! A lookup answers one question: does caselink ID `n` exist in court `c`,
//! and if so what does its header say. Missing and sealed cases are both
//! reported as absent.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReportError;

/// Phrases PACER shows instead of a case header.
const ABSENT_MARKERS: [&str; 4] = [
    "cannot find case",
    "no case found",
    "this case is sealed",
    "invalid case",
];

/// Header fields of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseReport {
    pub court: String,
    pub pacer_case_id: i64,
    pub docket_number: String,
    pub case_name: Option<String>,
    pub date_filed: Option<NaiveDate>,
}

impl CaseReport {
    pub fn new(
        court: impl Into<String>,
        pacer_case_id: i64,
        docket_number: impl Into<String>,
    ) -> Self {
        Self {
            court: court.into(),
            pacer_case_id,
            docket_number: docket_number.into(),
            case_name: None,
            date_filed: None,
        }
    }

    pub fn with_case_name(mut self, name: impl Into<String>) -> Self {
        self.case_name = Some(name.into());
        self
    }

    pub fn with_date_filed(mut self, date: NaiveDate) -> Self {
        self.date_filed = Some(date);
        self
    }
}

/// Source of case reports.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Fetches the report for one caselink ID. `Ok(None)` means the case does
    /// not exist or is not visible.
    async fn fetch_case(
        &self,
        court: &str,
        pacer_case_id: i64,
    ) -> Result<Option<CaseReport>, ReportError>;

    async fn case_exists(&self, court: &str, pacer_case_id: i64) -> Result<bool, ReportError> {
        Ok(self.fetch_case(court, pacer_case_id).await?.is_some())
    }
}

/// Extracts case headers from iquery HTML.
#[derive(Debug, Clone)]
pub struct ReportParser {
    docket_number: Regex,
    date_filed: Regex,
    tags: Regex,
}

impl ReportParser {
    pub fn new() -> Result<Self, ReportError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ReportError::Parse(format!("invalid pattern: {e}")))
        };
        Ok(Self {
            docket_number: compile(r"\b(?:\d{1,2}:)?\d{2}-(?:[A-Za-z]{1,5}-)?\d{3,6}(?:-[A-Za-z0-9]+)*")?,
            date_filed: compile(r"(?i)date\s+filed:\s*(\d{2}/\d{2}/\d{4})")?,
            tags: compile(r"<[^>]*>")?,
        })
    }

    /// Parses a response body. Returns `None` when no case header is present.
    pub fn parse(&self, court: &str, pacer_case_id: i64, html: &str) -> Option<CaseReport> {
        let lowered = html.to_lowercase();
        if ABSENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            return None;
        }

        let found = self.docket_number.find(html)?;
        let mut report = CaseReport::new(court, pacer_case_id, found.as_str());

        // The case name is the first text run after the docket number.
        let rest = &html[found.end()..];
        let until_break = rest
            .find("<br")
            .map(|end| &rest[..end])
            .filter(|segment| !self.strip_tags(segment).is_empty())
            .unwrap_or(rest);
        let name = self.strip_tags(until_break);
        let name = name.lines().map(str::trim).find(|line| !line.is_empty());
        if let Some(name) = name {
            report = report.with_case_name(name);
        }

        if let Some(date) = self
            .date_filed
            .captures(html)
            .and_then(|c| c.get(1))
            .and_then(|m| NaiveDate::parse_from_str(m.as_str(), "%m/%d/%Y").ok())
        {
            report = report.with_date_filed(date);
        }

        Some(report)
    }

    fn strip_tags(&self, fragment: &str) -> String {
        self.tags
            .replace_all(fragment, "\n")
            .replace("&nbsp;", " ")
            .replace("&amp;", "&")
            .trim()
            .to_string()
    }
}

/// HTTP client for the iquery endpoint.
pub struct PacerReportClient {
    client: Client,
    base_url: String,
    cookie: Option<String>,
    parser: ReportParser,
}

impl PacerReportClient {
    /// Creates a client. `base_url` contains a `{court}` placeholder, e.g.
    /// `https://ecf.{court}.uscourts.gov`.
    pub fn new(
        base_url: impl Into<String>,
        cookie: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ReportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReportError::RequestFailed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            cookie,
            parser: ReportParser::new()?,
        })
    }

    pub fn query_url(&self, court: &str, pacer_case_id: i64) -> String {
        let base = self.base_url.replace("{court}", court);
        format!("{}/cgi-bin/iquery.pl?{}", base.trim_end_matches('/'), pacer_case_id)
    }
}

#[async_trait]
impl ReportSource for PacerReportClient {
    async fn fetch_case(
        &self,
        court: &str,
        pacer_case_id: i64,
    ) -> Result<Option<CaseReport>, ReportError> {
        let url = self.query_url(court, pacer_case_id);
        let mut request = self
            .client
            .get(&url)
            .header(USER_AGENT, concat!("iquery-sweep/", env!("CARGO_PKG_VERSION")));
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReportError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ReportError::RateLimited {
                court: court.to_string(),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ReportError::Status {
                court: court.to_string(),
                case_id: pacer_case_id,
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ReportError::RequestFailed(e.to_string()))?;

        let report = self.parser.parse(court, pacer_case_id, &body);
        debug!(court, pacer_case_id, found = report.is_some(), "Fetched case report");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CASE_PAGE: &str = r#"
        <div id="cmecfMainContent">
        <center><b>1:21-cv-01234-ABC</b> Smith v. Jones Manufacturing &amp; Co.<br>
        Judge A. Person, presiding<br>
        Date filed: 09/28/2021<br>
        Date of last filing: 10/02/2021</center>
        </div>"#;

    #[test]
    fn test_parse_case_header() {
        let parser = ReportParser::new().unwrap();
        let report = parser.parse("nysd", 561234, CASE_PAGE).unwrap();

        assert_eq!(report.court, "nysd");
        assert_eq!(report.pacer_case_id, 561234);
        assert_eq!(report.docket_number, "1:21-cv-01234-ABC");
        assert_eq!(
            report.case_name.as_deref(),
            Some("Smith v. Jones Manufacturing & Co.")
        );
        assert_eq!(report.date_filed, NaiveDate::from_ymd_opt(2021, 9, 28));
    }

    #[test]
    fn test_parse_bankruptcy_numbers() {
        let parser = ReportParser::new().unwrap();
        let html = "<center><b>23-10456-mg</b></center><b>In re Example LLC</b><br>";
        let report = parser.parse("nysb", 10, html).unwrap();
        assert_eq!(report.docket_number, "23-10456-mg");
        assert_eq!(report.case_name.as_deref(), Some("In re Example LLC"));

        let html = "<center><b>23-bk-10456</b></center><br><b>In re Example LLC</b><br>";
        let report = parser.parse("nysb", 10, html).unwrap();
        assert_eq!(report.docket_number, "23-bk-10456");
        assert_eq!(report.case_name.as_deref(), Some("In re Example LLC"));
        assert!(report.date_filed.is_none());
    }

    #[test]
    fn test_parse_absent_case() {
        let parser = ReportParser::new().unwrap();
        assert!(parser
            .parse("nysd", 1, "<p>Cannot find case 1:21-cv-00001</p>")
            .is_none());
        assert!(parser
            .parse("nysd", 1, "<p>This case is SEALED.</p>")
            .is_none());
        assert!(parser.parse("nysd", 1, "<html><body></body></html>").is_none());
    }

    #[test]
    fn test_query_url() {
        let client = PacerReportClient::new(
            "https://ecf.{court}.uscourts.gov/",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.query_url("cand", 412),
            "https://ecf.cand.uscourts.gov/cgi-bin/iquery.pl?412"
        );
    }
}
