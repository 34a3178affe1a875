// SPDX-License-Identifier: MIT
//! Pre-flight SQL safety policies.
//!
//! These run over the raw SQL text *before* a statement enters the guarded
//! executor: a denylist of destructive constructs, a table/column blacklist,
//! a WHERE-clause requirement for writes, and auto-LIMIT injection for bare
//! SELECTs. Like the timeout planner's shape detection, everything here is a
//! regex approximation over the text, not a SQL parse; the checks guard the
//! top-level statement only (a `WITH` prologue ahead of UPDATE/DELETE is not
//! inspected).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::SafetySettings;

/// A policy rejection: which rule fired and why.
#[derive(Debug, Clone)]
pub struct PolicyViolation {
    pub rule: &'static str,
    pub message: String,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

/// Destructive or privilege-changing constructs that never pass, regardless
/// of blacklists.
static DENY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)\bDROP\s+(TABLE|DATABASE|SCHEMA|INDEX|VIEW|SEQUENCE|ROLE|USER)\b")
                .expect("regex: drop"),
            "DROP statements are not allowed",
        ),
        (
            Regex::new(r"(?i)\bTRUNCATE\b").expect("regex: truncate"),
            "TRUNCATE is not allowed",
        ),
        (
            Regex::new(r"(?i)\bALTER\s+(TABLE|DATABASE|SCHEMA|ROLE|USER|SYSTEM)\b")
                .expect("regex: alter"),
            "ALTER statements are not allowed",
        ),
        (
            Regex::new(r"(?i)\b(GRANT|REVOKE)\b").expect("regex: grant"),
            "privilege changes are not allowed",
        ),
        (
            Regex::new(r"(?i)\bCREATE\s+(ROLE|USER|EXTENSION)\b").expect("regex: create role"),
            "role, user, and extension creation is not allowed",
        ),
        (
            Regex::new(r"(?i)\bCOPY\b[\s\S]*\bPROGRAM\b").expect("regex: copy program"),
            "COPY ... PROGRAM is not allowed",
        ),
        (
            Regex::new(r";\s*\S").expect("regex: multi-statement"),
            "multiple statements per call are not allowed",
        ),
    ]
});

static UPDATE_DELETE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(UPDATE|DELETE)\b").expect("regex: write head"));
static WHERE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("regex: where"));
static SELECT_HEAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*SELECT\b").expect("regex: select head"));
static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bLIMIT\b").expect("regex: limit"));
static RETURNING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bRETURNING\b([\s\S]*)$").expect("regex: returning"));

/// Compiled blacklist plus the auto-LIMIT setting.
#[derive(Debug)]
pub struct SafetyPolicy {
    table_patterns: Vec<(Regex, String)>,
    column_patterns: Vec<(Regex, String)>,
    default_row_limit: u64,
}

impl SafetyPolicy {
    pub fn new(settings: &SafetySettings) -> Self {
        let compile = |names: &[String]| {
            names
                .iter()
                .filter_map(|name| {
                    let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
                    match Regex::new(&pattern) {
                        Ok(re) => Some((re, name.clone())),
                        Err(_) => None,
                    }
                })
                .collect::<Vec<_>>()
        };
        Self {
            table_patterns: compile(&settings.blacklist_tables),
            column_patterns: compile(&settings.blacklist_columns),
            default_row_limit: settings.default_row_limit,
        }
    }

    /// Checks applied to every statement, read or write.
    pub fn check(&self, sql: &str) -> Result<(), PolicyViolation> {
        for (pattern, reason) in DENY_PATTERNS.iter() {
            if pattern.is_match(sql) {
                return Err(PolicyViolation {
                    rule: "denylist",
                    message: (*reason).to_string(),
                });
            }
        }
        for (pattern, name) in &self.table_patterns {
            if pattern.is_match(sql) {
                return Err(PolicyViolation {
                    rule: "table_blacklist",
                    message: format!("table '{name}' is blacklisted"),
                });
            }
        }
        for (pattern, name) in &self.column_patterns {
            if pattern.is_match(sql) {
                return Err(PolicyViolation {
                    rule: "column_blacklist",
                    message: format!("column '{name}' is blacklisted"),
                });
            }
        }
        Ok(())
    }

    /// Additional checks for write statements: top-level UPDATE/DELETE must
    /// carry a WHERE clause, and a RETURNING clause may not expose
    /// blacklisted columns.
    pub fn check_write(&self, sql: &str) -> Result<(), PolicyViolation> {
        self.check(sql)?;

        if UPDATE_DELETE_RE.is_match(sql) && !WHERE_RE.is_match(sql) {
            return Err(PolicyViolation {
                rule: "where_required",
                message: "UPDATE and DELETE require a WHERE clause".to_string(),
            });
        }

        if let Some(captures) = RETURNING_RE.captures(sql) {
            let returning = captures.get(1).map(|m| m.as_str()).unwrap_or("");
            for (pattern, name) in &self.column_patterns {
                if pattern.is_match(returning) {
                    return Err(PolicyViolation {
                        rule: "returning_blacklist",
                        message: format!("RETURNING may not expose blacklisted column '{name}'"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Append `LIMIT n` to a bare SELECT that has none.
    pub fn inject_limit(&self, sql: &str) -> String {
        let trimmed = sql.trim_end().trim_end_matches(';').trim_end();
        if SELECT_HEAD_RE.is_match(trimmed) && !LIMIT_RE.is_match(trimmed) {
            format!("{trimmed} LIMIT {}", self.default_row_limit)
        } else {
            trimmed.to_string()
        }
    }
}
