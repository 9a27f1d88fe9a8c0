//! Funnel drop-off analysis for uploaded `step_name,users` tables.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::table::{self, SkippedRow, TableError};

/// Placeholder handed to the reasoning prompt when no funnel was uploaded.
pub const NO_FUNNEL_TEXT: &str = "No funnel data provided.";

/// One funnel step with its loss relative to the previous step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelRow {
    /// Step label as uploaded.
    pub step_name: String,
    /// Users that reached this step.
    pub users: u64,
    /// Users lost since the previous step; `None` for the first row.
    ///
    /// Negative when the count grows between steps.
    pub drop_off: Option<i128>,
    /// `drop_off` as a percentage of the previous step's users.
    ///
    /// `None` for the first row and when the previous step had zero users.
    pub drop_off_pct: Option<f64>,
}

/// Parsed funnel plus derived insight sentences.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunnelReport {
    /// Rows in funnel order (first row = top of funnel).
    pub rows: Vec<FunnelRow>,
    /// One sentence per step transition that lost users.
    pub insights: Vec<String>,
    /// Rows that could not be parsed.
    pub skipped: Vec<SkippedRow>,
}

impl FunnelReport {
    /// Renders the table and insights as the `funnel_text` prompt block.
    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return NO_FUNNEL_TEXT.to_string();
        }
        let mut out = String::from("step_name | users | drop_off | drop_off_pct\n");
        for row in &self.rows {
            let drop = row
                .drop_off
                .map(|value| value.to_string())
                .unwrap_or_else(|| "-".to_string());
            let pct = row
                .drop_off_pct
                .map(|value| format!("{value:.1}%"))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "{} | {} | {} | {}\n",
                row.step_name, row.users, drop, pct
            ));
        }
        if !self.insights.is_empty() {
            out.push_str("\nInsights:\n");
            for insight in &self.insights {
                out.push_str("- ");
                out.push_str(insight);
                out.push('\n');
            }
        }
        out.trim_end().to_string()
    }
}

/// Opens and parses a funnel CSV from disk.
pub fn load_funnel(path: &Path) -> Result<FunnelReport, TableError> {
    let file = File::open(path).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_funnel(file)
}

/// Parses a funnel CSV with at least `step_name` and `users` columns.
///
/// Rows with an empty step name or a non-integer user count are skipped and
/// reported; drop-off is always computed against the previous accepted row.
pub fn parse_funnel<R: Read>(reader: R) -> Result<FunnelReport, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();
    let step_idx = table::column_index(&headers, "step_name")?;
    let users_idx = table::column_index(&headers, "users")?;

    let mut report = FunnelReport::default();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let line = err.position().map(|pos| pos.line());
                report.skipped.push(SkippedRow::new(line, err.to_string()));
                continue;
            }
        };
        let step_name = table::field(&record, step_idx);
        if step_name.is_empty() {
            report.skipped.push(SkippedRow::at(&record, "empty step_name"));
            continue;
        }
        let raw_users = table::field(&record, users_idx);
        let Some(users) = table::parse_count(raw_users) else {
            report.skipped.push(SkippedRow::at(
                &record,
                format!("users `{raw_users}` is not a non-negative integer"),
            ));
            continue;
        };

        let (drop_off, drop_off_pct) = match report.rows.last() {
            Some(prev) => {
                let drop = i128::from(prev.users) - i128::from(users);
                let pct = (prev.users > 0).then(|| drop as f64 / prev.users as f64 * 100.0);
                if let Some(pct) = pct.filter(|_| drop >= 0) {
                    report.insights.push(format!(
                        "{pct:.1}% users drop from '{}' to '{}'.",
                        prev.step_name, step_name
                    ));
                }
                (Some(drop), pct)
            }
            None => (None, None),
        };
        report.rows.push(FunnelRow {
            step_name: step_name.to_string(),
            users,
            drop_off,
            drop_off_pct,
        });
    }

    if !report.skipped.is_empty() {
        warn!(skipped = report.skipped.len(), "dropped malformed funnel rows");
    }
    debug!(steps = report.rows.len(), "parsed funnel");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_drop_off_insights() {
        let csv = "step_name,users\nLanding,1000\nSignup,400\nPurchase,100\n";
        let report = parse_funnel(csv.as_bytes()).expect("parse");

        assert_eq!(
            report.insights,
            vec![
                "60.0% users drop from 'Landing' to 'Signup'.".to_string(),
                "75.0% users drop from 'Signup' to 'Purchase'.".to_string(),
            ]
        );
        assert_eq!(report.rows[0].drop_off, None);
        assert_eq!(report.rows[0].drop_off_pct, None);
        assert_eq!(report.rows[1].drop_off, Some(600));
        assert_eq!(report.rows[2].drop_off, Some(300));
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn skips_bad_rows_but_keeps_going() {
        let csv = "users,step_name,notes\n500,Home,x\nlots,Broken,y\n250,Cart,z\n";
        let report = parse_funnel(csv.as_bytes()).expect("parse");

        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].line, Some(3));
        assert_eq!(
            report.insights,
            vec!["50.0% users drop from 'Home' to 'Cart'.".to_string()]
        );
    }

    #[test]
    fn growth_and_empty_steps_emit_no_insight() {
        let csv = "step_name,users\nA,0\nB,10\nC,20\n";
        let report = parse_funnel(csv.as_bytes()).expect("parse");

        assert_eq!(report.rows[1].drop_off, Some(-10));
        assert_eq!(report.rows[1].drop_off_pct, None);
        assert_eq!(report.rows[2].drop_off_pct, Some(-100.0));
        assert!(report.insights.is_empty());
    }

    #[test]
    fn huge_counts_do_not_wrap() {
        let csv = "step_name,users\nTop,18446744073709551615\nBottom,0\nRebound,18446744073709551615\n";
        let report = parse_funnel(csv.as_bytes()).expect("parse");

        assert_eq!(report.rows[1].drop_off, Some(i128::from(u64::MAX)));
        assert_eq!(report.rows[1].drop_off_pct, Some(100.0));
        assert_eq!(report.rows[2].drop_off, Some(-i128::from(u64::MAX)));
        assert_eq!(report.insights, vec!["100.0% users drop from 'Top' to 'Bottom'."]);
    }

    #[test]
    fn missing_users_column_is_an_error() {
        let err = parse_funnel("step_name,visits\nA,1\n".as_bytes()).unwrap_err();
        assert!(matches!(err, TableError::MissingColumn("users")));
    }

    #[test]
    fn render_lists_rows_and_insights() {
        let csv = "step_name,users\nLanding,1000\nSignup,400\n";
        let text = parse_funnel(csv.as_bytes()).unwrap().render();
        assert!(text.contains("Landing | 1000 | - | -"));
        assert!(text.contains("Signup | 400 | 600 | 60.0%"));
        assert!(text.ends_with("- 60.0% users drop from 'Landing' to 'Signup'."));
        assert_eq!(FunnelReport::default().render(), NO_FUNNEL_TEXT);
    }
}
