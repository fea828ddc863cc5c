//! Case report lookups and frontier probing.

pub mod engine;
pub mod report;

pub use engine::{
    find_frontier, CaseProbe, FrontierProber, ProbeConfig, ProbeError, ProbeOutcome, SearchResult,
};
pub use report::{CaseReport, PacerReportClient, ReportParser, ReportSource};
