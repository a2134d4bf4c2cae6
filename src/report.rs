use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::{TermOverview, WithStatus};

const NO_STATUS: &str = "Sin estado";

/// Counts records per current status name, most frequent first.
pub fn count_by_status<T>(records: &[WithStatus<T>]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        let name = record.status_name().unwrap_or(NO_STATUS);
        *counts.entry(name.to_string()).or_insert(0) += 1;
    }

    let mut summary: Vec<(String, usize)> = counts.into_iter().collect();
    summary.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    summary
}

pub fn build_report(overview: &TermOverview) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Thesis Registry Report");
    let _ = writeln!(output, "Term {}", overview.term.period);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Proposals by Status");

    if overview.proposals.is_empty() {
        let _ = writeln!(output, "No proposals submitted this term.");
    } else {
        for (status, count) in count_by_status(&overview.proposals) {
            let _ = writeln!(output, "- {status}: {count}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Theses by Status");

    if overview.theses.is_empty() {
        let _ = writeln!(output, "No theses delivered this term.");
    } else {
        for (status, count) in count_by_status(&overview.theses) {
            let _ = writeln!(output, "- {status}: {count}");
        }
    }

    let mut defences: Vec<_> = overview.defences.iter().collect();
    defences.sort_by_key(|summary| summary.defence.scheduled_at);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Defences");

    if defences.is_empty() {
        let _ = writeln!(output, "No defences scheduled this term.");
    } else {
        for summary in defences {
            let grade = summary
                .defence
                .grade
                .map(|grade| grade.to_string())
                .unwrap_or_else(|| "pending".to_string());
            let mut mentions = Vec::new();
            if summary.defence.is_honorific_mention {
                mentions.push("honorific");
            }
            if summary.defence.is_publication_mention {
                mentions.push("publication");
            }
            let _ = write!(
                output,
                "- {} {} on {}: grade {}, jury {} + {} backup",
                summary.defence.code,
                summary.thesis_title,
                summary.defence.scheduled_at.format("%Y-%m-%d %H:%M"),
                grade,
                summary.principal_jurors,
                summary.backup_jurors
            );
            if !mentions.is_empty() {
                let _ = write!(output, " ({} mention)", mentions.join(", "));
            }
            let _ = writeln!(output);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::ledger::{LedgerSubject, StatusEvent};
    use crate::models::{Defence, DefenceSummary, Proposal, Term};

    fn proposal(code: &str, status: Option<&str>) -> WithStatus<Proposal> {
        WithStatus {
            record: Proposal {
                code: code.to_string(),
                submission_date: NaiveDate::from_ymd_opt(2019, 9, 30).unwrap(),
                title: format!("Propuesta {code}"),
                student1: None,
                student2: None,
                academic_tutor: "V-1".to_string(),
                industry_tutor: None,
                term_id: 1,
            },
            current_status: status.map(|name| StatusEvent {
                id: Uuid::new_v4(),
                subject: LedgerSubject::Proposal(code.to_string()),
                status_id: 1,
                status_name: name.to_string(),
                occurred_at: Utc.with_ymd_and_hms(2019, 10, 1, 8, 0, 0).unwrap(),
                seq: 1,
            }),
        }
    }

    #[test]
    fn counts_are_sorted_by_frequency() {
        let proposals = vec![
            proposal("P1", Some("Aprobada")),
            proposal("P2", Some("Por evaluar")),
            proposal("P3", Some("Aprobada")),
            proposal("P4", None),
        ];
        let counts = count_by_status(&proposals);
        assert_eq!(counts[0], ("Aprobada".to_string(), 2));
        assert!(counts.contains(&(NO_STATUS.to_string(), 1)));
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn report_lists_sections() {
        let overview = TermOverview {
            term: Term { id: 1, period: 201925 },
            proposals: vec![proposal("P1", Some("Aprobada"))],
            theses: Vec::new(),
            defences: vec![DefenceSummary {
                defence: Defence {
                    code: "DFTGP1".to_string(),
                    thesis_code: "TGP1".to_string(),
                    scheduled_at: Utc.with_ymd_and_hms(2020, 3, 2, 14, 0, 0).unwrap(),
                    grade: Some(20),
                    is_publication_mention: false,
                    is_honorific_mention: true,
                    corrections_submission_date: None,
                    was_grade_loaded: true,
                    observations: String::new(),
                },
                thesis_title: "Propuesta P1".to_string(),
                principal_jurors: 2,
                backup_jurors: 1,
            }],
        };

        let report = build_report(&overview);
        assert!(report.contains("Term 201925"));
        assert!(report.contains("- Aprobada: 1"));
        assert!(report.contains("No theses delivered this term."));
        assert!(report.contains(
            "- DFTGP1 Propuesta P1 on 2020-03-02 14:00: grade 20, jury 2 + 1 backup (honorific mention)"
        ));
    }
}
