//! Lenient parsing and prioritisation of LLM-proposed recommendations.

use std::io::{Read, Write};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::table::{clean_field, SkippedRow, TableError};

/// Confidence assigned when the model left the field empty or non-numeric.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Column order the reasoning prompt asks the model to emit.
pub const INPUT_COLUMNS: [&str; 6] = [
    "URL",
    "Issue",
    "Evidence",
    "Suggested Fix",
    "Impact",
    "Confidence",
];

/// Column order of the exported report.
pub const REPORT_COLUMNS: [&str; 8] = [
    "URL",
    "Issue",
    "Evidence",
    "Suggested Fix",
    "Impact",
    "Confidence",
    "Effort",
    "PriorityScore",
];

/// Words in a fix that mark it as a copy/CTA change.
pub const LOW_EFFORT_KEYWORDS: &[&str] = &[
    "text",
    "copy",
    "cta",
    "headline",
    "wording",
    "label",
    "microcopy",
    "button text",
    "call to action",
    "call-to-action",
];

/// Implementation effort bucket; the discriminant is the priority divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Effort {
    /// Copy or CTA tweaks.
    Low = 1,
    /// Anything else.
    High = 2,
}

impl Effort {
    /// Divisor applied to the confidence-derived score.
    pub fn weight(self) -> u8 {
        self as u8
    }

    /// Maps an exported weight back to a bucket.
    pub fn from_weight(weight: u8) -> Option<Self> {
        match weight {
            1 => Some(Effort::Low),
            2 => Some(Effort::High),
            _ => None,
        }
    }
}

/// Estimates how expensive a suggested fix is to ship.
pub trait EffortPolicy {
    /// Effort bucket for the given fix text.
    fn effort(&self, fix: &str) -> Effort;
}

/// Keyword heuristic: fixes mentioning copy/CTA wording are low effort.
///
/// Coarse: it has not been validated against real experiment outcomes.
#[derive(Debug, Clone)]
pub struct KeywordEffort {
    keywords: Vec<String>,
}

impl KeywordEffort {
    /// Builds a policy from custom keywords (matched case-insensitively).
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|kw| kw.as_ref().trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .collect(),
        }
    }
}

impl Default for KeywordEffort {
    fn default() -> Self {
        Self::new(LOW_EFFORT_KEYWORDS)
    }
}

impl EffortPolicy for KeywordEffort {
    fn effort(&self, fix: &str) -> Effort {
        let fix = fix.to_lowercase();
        if self.keywords.iter().any(|kw| fix.contains(kw.as_str())) {
            Effort::Low
        } else {
            Effort::High
        }
    }
}

/// One scored row of the final report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    /// Page the issue was observed on.
    pub url: String,
    /// Friction point.
    pub issue: String,
    /// Supporting evidence.
    pub evidence: String,
    /// Proposed change.
    pub suggested_fix: String,
    /// Expected impact, free text.
    pub impact: String,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    /// Effort bucket.
    pub effort: Effort,
    /// `confidence * 10 / effort`.
    pub priority_score: f64,
}

/// Scored recommendations, highest priority first.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScoredTable {
    /// Recommendations sorted by descending priority.
    pub rows: Vec<Recommendation>,
    /// Model output lines that did not fit the six-column contract.
    pub skipped: Vec<SkippedRow>,
}

/// Scores raw model CSV with the default keyword effort policy.
pub fn score(csv_text: &str) -> Option<ScoredTable> {
    score_with(csv_text, &KeywordEffort::default())
}

/// Scores raw model CSV.
///
/// Returns `None` when the text is blank or when no row survives parsing.
pub fn score_with(csv_text: &str, policy: &dyn EffortPolicy) -> Option<ScoredTable> {
    if csv_text.trim().is_empty() {
        return None;
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());

    let mut table = ScoredTable::default();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let line = err.position().map(|pos| pos.line());
                table.skipped.push(SkippedRow::new(line, err.to_string()));
                continue;
            }
        };
        let fields: Vec<&str> = record.iter().map(clean_field).collect();
        if fields.iter().all(|value| value.is_empty()) {
            continue;
        }
        if fields.len() != INPUT_COLUMNS.len() {
            table.skipped.push(SkippedRow::at(
                &record,
                format!("expected {} fields, found {}", INPUT_COLUMNS.len(), fields.len()),
            ));
            continue;
        }
        if is_header(&fields) {
            continue;
        }

        let confidence = coerce_confidence(fields[5]);
        let effort = policy.effort(fields[3]);
        table.rows.push(Recommendation {
            url: fields[0].to_string(),
            issue: fields[1].to_string(),
            evidence: fields[2].to_string(),
            suggested_fix: fields[3].to_string(),
            impact: fields[4].to_string(),
            confidence,
            effort,
            priority_score: priority_score(confidence, effort),
        });
    }

    if !table.skipped.is_empty() {
        warn!(skipped = table.skipped.len(), "dropped malformed recommendation rows");
    }
    if table.rows.is_empty() {
        return None;
    }
    // `sort_by` is stable, so equal scores keep model order.
    table
        .rows
        .sort_by(|a, b| b.priority_score.total_cmp(&a.priority_score));
    debug!(rows = table.rows.len(), "scored recommendations");
    Some(table)
}

/// Extracts the first decimal number from `raw`, clamped into [0, 1].
///
/// Falls back to [`DEFAULT_CONFIDENCE`] when no number is present.
pub fn coerce_confidence(raw: &str) -> f64 {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let pattern = NUMBER.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?|\.\d+").expect("valid regex"));
    pattern
        .find(raw)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE)
}

/// `confidence * 10 / effort`.
pub fn priority_score(confidence: f64, effort: Effort) -> f64 {
    confidence * 10.0 / f64::from(effort.weight())
}

fn is_header(fields: &[&str]) -> bool {
    fields
        .iter()
        .zip(INPUT_COLUMNS)
        .all(|(field, column)| field.eq_ignore_ascii_case(column))
}

impl ScoredTable {
    /// Writes the report CSV with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(REPORT_COLUMNS)?;
        for row in &self.rows {
            let confidence = row.confidence.to_string();
            let effort = row.effort.weight().to_string();
            let priority = row.priority_score.to_string();
            writer.write_record([
                row.url.as_str(),
                row.issue.as_str(),
                row.evidence.as_str(),
                row.suggested_fix.as_str(),
                row.impact.as_str(),
                confidence.as_str(),
                effort.as_str(),
                priority.as_str(),
            ])?;
        }
        writer.flush().map_err(|err| TableError::Csv(err.into()))?;
        Ok(())
    }

    /// Renders the report CSV into a string.
    pub fn to_csv_string(&self) -> Result<String, TableError> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Reads a report previously produced by [`ScoredTable::write_csv`].
    ///
    /// Unlike model output this is strict: a bad row fails the whole read.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        for column in REPORT_COLUMNS {
            crate::table::column_index(&headers, column)?;
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            let text = |idx: usize| record.get(idx).unwrap_or("").to_string();
            let number = |idx: usize| {
                let raw = record.get(idx).unwrap_or("");
                raw.parse::<f64>().map_err(|_| TableError::InvalidValue {
                    column: REPORT_COLUMNS[idx],
                    value: raw.to_string(),
                })
            };
            let raw_effort = record.get(6).unwrap_or("");
            let effort = raw_effort
                .parse::<u8>()
                .ok()
                .and_then(Effort::from_weight)
                .ok_or_else(|| TableError::InvalidValue {
                    column: "Effort",
                    value: raw_effort.to_string(),
                })?;
            rows.push(Recommendation {
                url: text(0),
                issue: text(1),
                evidence: text(2),
                suggested_fix: text(3),
                impact: text(4),
                confidence: number(5)?,
                effort,
                priority_score: number(7)?,
            });
        }
        Ok(Self {
            rows,
            skipped: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cta_fix_is_low_effort() {
        let csv = r#""http://a.com","Low CTA contrast","Button blends with background","Increase CTA button contrast","High","0.8""#;
        let table = score(csv).expect("one row");
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.url, "http://a.com");
        assert_eq!(row.effort, Effort::Low);
        assert!((row.confidence - 0.8).abs() < 1e-12);
        assert!((row.priority_score - 8.0).abs() < 1e-9);
    }

    #[test]
    fn button_text_fix_is_low_effort() {
        assert!(LOW_EFFORT_KEYWORDS.contains(&"button text"));
        assert_eq!(
            KeywordEffort::default().effort("Rewrite the Button Text to name the offer"),
            Effort::Low
        );
        let multi_word = KeywordEffort::new(["button text"]);
        assert_eq!(multi_word.effort("Shorter BUTTON TEXT"), Effort::Low);
        assert_eq!(multi_word.effort("Move the button above the fold"), Effort::High);
    }

    #[test]
    fn non_numeric_confidence_defaults() {
        let csv = r#""http://a.com/pricing","Long form","12 fields","Remove optional fields","Medium","unsure""#;
        let row = &score(csv).unwrap().rows[0];
        assert_eq!(row.confidence, 0.5);
        assert_eq!(row.effort, Effort::High);
        assert!((row.priority_score - 2.5).abs() < 1e-12);
    }

    #[test]
    fn confidence_coercion_cases() {
        assert_eq!(coerce_confidence("0.7 (estimated)"), 0.7);
        assert_eq!(coerce_confidence("~.65"), 0.65);
        assert_eq!(coerce_confidence("high"), DEFAULT_CONFIDENCE);
        assert_eq!(coerce_confidence(""), DEFAULT_CONFIDENCE);
        assert_eq!(coerce_confidence("85"), 1.0);
        assert_eq!(coerce_confidence("-0.3"), 0.3);
        assert_eq!(coerce_confidence("0.6-0.8"), 0.6);
    }

    #[test]
    fn blank_output_is_no_recommendations() {
        assert!(score("").is_none());
        assert!(score("  \n\t ").is_none());
    }

    #[test]
    fn header_only_output_is_no_recommendations() {
        assert!(score(r#""URL","Issue","Evidence","Suggested Fix","Impact","Confidence""#).is_none());
    }

    #[test]
    fn malformed_rows_are_skipped_and_reported() {
        let csv = "\
\"URL\", \"Issue\", \"Evidence\", \"Suggested Fix\", \"Impact\", \"Confidence\"
Here are my recommendations:
\"https://s.io\", \"Weak headline\", \"Generic\", \"Rewrite headline text\", \"High\", \"0.9\"
\"https://s.io/cart\",\"Surprise shipping\",\"Fee at last step\",\"Show shipping early\",\"High\"
\"https://s.io/cart\",\"No trust badges\",\"None visible\",\"Add payment badges\",\"Medium\",\"0.6\"
";
        let table = score(csv).expect("rows survive");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.skipped.len(), 2);
        assert_eq!(table.skipped[0].line, Some(2));
        assert_eq!(table.skipped[1].line, Some(4));
        assert_eq!(table.rows[0].issue, "Weak headline");
        assert_eq!(table.rows[0].suggested_fix, "Rewrite headline text");
    }

    #[test]
    fn rows_sorted_by_priority_with_stable_ties() {
        let csv = "\
a,first tie,e,Redesign checkout,h,0.6
b,top,e,Change button copy,h,0.9
c,second tie,e,Rebuild pricing page,h,0.6
d,low,e,Add reviews,h,0.1
";
        let table = score(csv).unwrap();
        let issues: Vec<&str> = table.rows.iter().map(|r| r.issue.as_str()).collect();
        assert_eq!(issues, vec!["top", "first tie", "second tie", "low"]);
        assert!(table
            .rows
            .windows(2)
            .all(|pair| pair[0].priority_score >= pair[1].priority_score));
        for row in &table.rows {
            let expected = row.confidence * 10.0 / f64::from(row.effort.weight());
            assert_eq!(row.priority_score, expected);
            assert!((0.0..=1.0).contains(&row.confidence));
        }
    }

    #[test]
    fn custom_effort_policy_is_honoured() {
        struct EverythingIsCheap;
        impl EffortPolicy for EverythingIsCheap {
            fn effort(&self, _fix: &str) -> Effort {
                Effort::Low
            }
        }
        let table = score_with("u,i,e,Rebuild checkout,h,0.4", &EverythingIsCheap).unwrap();
        assert_eq!(table.rows[0].effort, Effort::Low);
        assert!((table.rows[0].priority_score - 4.0).abs() < 1e-12);

        let custom = KeywordEffort::new(["Checkout"]);
        assert_eq!(custom.effort("rebuild CHECKOUT flow"), Effort::Low);
        assert_eq!(custom.effort("rewrite copy"), Effort::High);
    }

    #[test]
    fn export_then_import_preserves_rows_and_order() {
        let csv = "\
https://x.io,\"Hero, unclear\",Bounce 70%,Rewrite hero text,High,0.73
https://x.io/p,Slow page,LCP 5s,Compress images,Medium,0.41
https://x.io/c,Form length,9 fields,Trim form,Low,0.2
";
        let table = score(csv).unwrap();
        let exported = table.to_csv_string().unwrap();
        assert!(exported.starts_with(
            "URL,Issue,Evidence,Suggested Fix,Impact,Confidence,Effort,PriorityScore\n"
        ));

        let reread = ScoredTable::read_csv(exported.as_bytes()).unwrap();
        assert_eq!(reread.rows, table.rows);
        assert_eq!(reread.to_csv_string().unwrap(), exported);
    }

    #[test]
    fn import_rejects_unknown_effort() {
        let bad = "URL,Issue,Evidence,Suggested Fix,Impact,Confidence,Effort,PriorityScore\nu,i,e,f,h,0.5,3,1.6\n";
        assert!(matches!(
            ScoredTable::read_csv(bad.as_bytes()),
            Err(TableError::InvalidValue { column: "Effort", .. })
        ));
    }
}
