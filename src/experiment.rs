//! A/B test result ingestion: conversion rates and the losing variant.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::table::{self, SkippedRow, TableError};

/// Placeholder handed to the reasoning prompt when no A/B table was uploaded.
pub const NO_AB_TEXT: &str = "No A/B test data provided.";

/// One experiment arm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbVariant {
    /// Variant label.
    pub variant: String,
    /// Converted users.
    pub conversions: u64,
    /// Users exposed to the variant.
    pub users: u64,
}

impl AbVariant {
    /// `conversions / users`, or 0 when the variant saw no users.
    pub fn conversion_rate(&self) -> f64 {
        if self.users == 0 {
            0.0
        } else {
            self.conversions as f64 / self.users as f64
        }
    }
}

/// Parsed A/B table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AbReport {
    /// Variants in upload order.
    pub variants: Vec<AbVariant>,
    /// Rows that could not be parsed.
    pub skipped: Vec<SkippedRow>,
}

/// The failed idea derived from a losing variant, ready for the memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LosingIdea {
    /// Memory `issue` text.
    pub issue: String,
    /// Memory `fix` text.
    pub fix: String,
}

impl AbReport {
    /// Variant with the lowest conversion rate.
    ///
    /// Only arms that saw traffic count, and at least two are needed. Returns
    /// `None` when every measured arm converted at the same rate.
    pub fn losing_variant(&self) -> Option<&AbVariant> {
        self.decided_arms().map(|(loser, _)| loser)
    }

    /// Variant with the highest conversion rate, under the same rules as
    /// [`AbReport::losing_variant`].
    pub fn winning_variant(&self) -> Option<&AbVariant> {
        self.decided_arms().map(|(_, winner)| winner)
    }

    fn decided_arms(&self) -> Option<(&AbVariant, &AbVariant)> {
        let mut measured = self.variants.iter().filter(|variant| variant.users > 0);
        let first = measured.next()?;
        let (mut loser, mut winner, mut arms) = (first, first, 1usize);
        for candidate in measured {
            arms += 1;
            if candidate.conversion_rate() < loser.conversion_rate() {
                loser = candidate;
            }
            if candidate.conversion_rate() > winner.conversion_rate() {
                winner = candidate;
            }
        }
        (arms >= 2 && loser.conversion_rate() < winner.conversion_rate()).then_some((loser, winner))
    }

    /// Describes the losing variant as a failed CRO idea.
    pub fn losing_idea(&self) -> Option<LosingIdea> {
        let loser = self.losing_variant()?;
        let winner = self.winning_variant()?;
        Some(LosingIdea {
            issue: format!("A/B variant '{}' underperformed", loser.variant),
            fix: format!(
                "Variant '{}' converted at {:.2}% versus {:.2}% for '{}'",
                loser.variant,
                loser.conversion_rate() * 100.0,
                winner.conversion_rate() * 100.0,
                winner.variant
            ),
        })
    }

    /// Renders the `ab_text` prompt block.
    pub fn render(&self) -> String {
        if self.variants.is_empty() {
            return NO_AB_TEXT.to_string();
        }
        let mut out = String::from("variant | conversions | users | conversion_rate\n");
        for variant in &self.variants {
            out.push_str(&format!(
                "{} | {} | {} | {:.2}%\n",
                variant.variant,
                variant.conversions,
                variant.users,
                variant.conversion_rate() * 100.0
            ));
        }
        if let Some(loser) = self.losing_variant() {
            out.push_str(&format!("Losing variant: {}\n", loser.variant));
        }
        out.trim_end().to_string()
    }
}

/// Opens and parses an A/B results CSV from disk.
pub fn load_ab_results(path: &Path) -> Result<AbReport, TableError> {
    let file = File::open(path).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_ab_results(file)
}

/// Parses a CSV with `variant`, `conversions` and `users` columns.
pub fn parse_ab_results<R: Read>(reader: R) -> Result<AbReport, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();
    let variant_idx = table::column_index(&headers, "variant")?;
    let conversions_idx = table::column_index(&headers, "conversions")?;
    let users_idx = table::column_index(&headers, "users")?;

    let mut report = AbReport::default();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let line = err.position().map(|pos| pos.line());
                report.skipped.push(SkippedRow::new(line, err.to_string()));
                continue;
            }
        };
        let variant = table::field(&record, variant_idx);
        if variant.is_empty() {
            report.skipped.push(SkippedRow::at(&record, "empty variant"));
            continue;
        }
        let counts = (
            table::parse_count(table::field(&record, conversions_idx)),
            table::parse_count(table::field(&record, users_idx)),
        );
        let (Some(conversions), Some(users)) = counts else {
            report
                .skipped
                .push(SkippedRow::at(&record, "conversions/users must be integers"));
            continue;
        };
        if conversions > users {
            report.skipped.push(SkippedRow::at(
                &record,
                format!("{conversions} conversions exceed {users} users"),
            ));
            continue;
        }
        report.variants.push(AbVariant {
            variant: variant.to_string(),
            conversions,
            users,
        });
    }

    if !report.skipped.is_empty() {
        warn!(skipped = report.skipped.len(), "dropped malformed A/B rows");
    }
    debug!(variants = report.variants.len(), "parsed A/B results");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS: &str = "variant,conversions,users\ncontrol,50,1000\ngreen_cta,80,1000\nlong_form,20,1000\n";

    #[test]
    fn picks_lowest_conversion_rate_as_loser() {
        let report = parse_ab_results(RESULTS.as_bytes()).expect("parse");
        assert_eq!(report.variants.len(), 3);
        assert_eq!(report.losing_variant().unwrap().variant, "long_form");
        assert_eq!(report.winning_variant().unwrap().variant, "green_cta");
        assert!((report.variants[0].conversion_rate() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn losing_idea_names_both_arms() {
        let report = parse_ab_results(RESULTS.as_bytes()).unwrap();
        let idea = report.losing_idea().expect("loser");
        assert_eq!(idea.issue, "A/B variant 'long_form' underperformed");
        assert_eq!(
            idea.fix,
            "Variant 'long_form' converted at 2.00% versus 8.00% for 'green_cta'"
        );
    }

    #[test]
    fn single_variant_has_no_loser() {
        let report = parse_ab_results("variant,conversions,users\nonly,5,10\n".as_bytes()).unwrap();
        assert!(report.losing_variant().is_none());
        assert!(report.losing_idea().is_none());
        assert!(!report.render().contains("Losing variant"));
    }

    #[test]
    fn zero_users_and_bad_rows() {
        let csv = "variant,conversions,users\nempty,0,0\nbad,x,10\nodd,20,10\nok,1,10\n";
        let report = parse_ab_results(csv.as_bytes()).unwrap();
        assert_eq!(report.variants.len(), 2);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.variants[0].conversion_rate(), 0.0);
        // `empty` saw no traffic, so `ok` is the only measured arm.
        assert!(report.losing_variant().is_none());
        assert!(report.losing_idea().is_none());
    }

    #[test]
    fn tied_arms_have_no_loser() {
        let csv = "variant,conversions,users\nA,50,1000\nB,50,1000\n";
        let report = parse_ab_results(csv.as_bytes()).unwrap();
        assert!(report.losing_variant().is_none());
        assert!(report.winning_variant().is_none());
        assert!(report.losing_idea().is_none());
        assert!(!report.render().contains("Losing variant"));
    }

    #[test]
    fn zero_traffic_arm_is_not_a_loser() {
        let csv = "variant,conversions,users\nparked,0,0\nA,30,1000\nB,50,1000\n";
        let report = parse_ab_results(csv.as_bytes()).unwrap();
        let idea = report.losing_idea().expect("measured arms differ");
        assert_eq!(idea.issue, "A/B variant 'A' underperformed");
        assert_eq!(
            idea.fix,
            "Variant 'A' converted at 3.00% versus 5.00% for 'B'"
        );
    }

    #[test]
    fn render_reports_rates() {
        let text = parse_ab_results(RESULTS.as_bytes()).unwrap().render();
        assert!(text.contains("green_cta | 80 | 1000 | 8.00%"));
        assert!(text.ends_with("Losing variant: long_form"));
        assert_eq!(AbReport::default().render(), NO_AB_TEXT);
    }
}
