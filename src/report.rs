//! Machine-readable status records printed on stdout.
//!
//! One record per finished phase (a relocation, then optionally its
//! verification), either as a `key=value` line or as a single JSON object
//! (`--json`). Paths containing whitespace or quotes are quoted.

use serde::Serialize;
use std::path::Path;

use crate::errors::{StepError, VerifyError};
use crate::relocate::{RelocationOutcome, RelocationPlan};
use crate::verify::VerifyReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Committed,
    RolledBack,
    DryRun,
    Verified,
    VerifyFailed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Committed => "committed",
            Status::RolledBack => "rolled_back",
            Status::DryRun => "dry_run",
            Status::Verified => "verified",
            Status::VerifyFailed => "verify_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sites: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_patched: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_removed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn display(p: &Path) -> Option<String> {
    Some(p.display().to_string())
}

impl StatusRecord {
    fn empty(status: Status, code: i32) -> Self {
        Self {
            status,
            mode: None,
            step: None,
            kind: None,
            code,
            source: None,
            destination: None,
            sites: None,
            files_patched: None,
            passed: None,
            failed: None,
            warnings: None,
            source_removed: None,
            message: None,
        }
    }

    pub fn committed(outcome: &RelocationOutcome) -> Self {
        Self {
            mode: Some(outcome.mode.as_str()),
            source: display(&outcome.source),
            destination: display(&outcome.environment.root),
            sites: Some(outcome.sites),
            files_patched: Some(outcome.patch.files_patched),
            warnings: Some(outcome.warnings.len()),
            source_removed: (outcome.mode == crate::relocate::Mode::Move).then_some(outcome.source_removed),
            ..Self::empty(Status::Committed, 0)
        }
    }

    pub fn rolled_back(err: &StepError, source: &Path, destination: &Path) -> Self {
        Self {
            step: Some(err.step.as_str()),
            kind: Some(err.kind()),
            source: display(source),
            destination: display(destination),
            message: Some(err.error.to_string()),
            ..Self::empty(Status::RolledBack, err.code())
        }
    }

    pub fn dry_run(plan: &RelocationPlan) -> Self {
        Self {
            source: display(&plan.roots.source),
            destination: display(&plan.roots.destination),
            sites: Some(plan.scan.sites.len()),
            files_patched: Some(plan.scan.fingerprints.len()),
            warnings: Some(plan.warnings.len()),
            ..Self::empty(Status::DryRun, 0)
        }
    }

    pub fn verified(report: &VerifyReport, fail_code: i32) -> Self {
        let ok = report.all_ok();
        let passed = report.passed();
        Self {
            destination: display(&report.root),
            passed: Some(passed),
            failed: Some(report.outcomes.len() - passed),
            message: (!report.prefix_matches).then(|| "interpreter prefix does not match the environment root".to_string()),
            ..Self::empty(
                if ok { Status::Verified } else { Status::VerifyFailed },
                if ok { 0 } else { fail_code },
            )
        }
    }

    /// The interpreter could not be run at all.
    pub fn verify_error(err: &VerifyError, root: &Path) -> Self {
        Self {
            kind: Some(err.kind()),
            destination: display(root),
            message: Some(err.to_string()),
            ..Self::empty(Status::VerifyFailed, err.code())
        }
    }

    /// `key=value` form. The free-text message is left out; it goes to stderr.
    pub fn to_line(&self) -> String {
        let mut parts = vec![format!("status={}", self.status.as_str())];
        let mut push = |k: &str, v: Option<String>| {
            if let Some(v) = v {
                parts.push(format!("{k}={v}"));
            }
        };
        push("mode", self.mode.map(str::to_string));
        push("step", self.step.map(str::to_string));
        push("kind", self.kind.map(str::to_string));
        push("code", Some(self.code.to_string()));
        push("source", self.source.as_deref().map(quote));
        push("destination", self.destination.as_deref().map(quote));
        push("sites", self.sites.map(|n| n.to_string()));
        push("files_patched", self.files_patched.map(|n| n.to_string()));
        push("passed", self.passed.map(|n| n.to_string()));
        push("failed", self.failed.map(|n| n.to_string()));
        push("warnings", self.warnings.map(|n| n.to_string()));
        push("source_removed", self.source_removed.map(|b| b.to_string()));
        parts.join(" ")
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"status\":\"{}\",\"error\":\"{e}\"}}", self.status.as_str()))
    }

    pub fn render(&self, json: bool) -> String {
        if json { self.to_json() } else { self.to_line() }
    }
}

fn quote(s: &str) -> String {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '"' || c == '=') {
        format!("{s:?}")
    } else {
        s.to_string()
    }
}
