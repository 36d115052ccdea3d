use std::fmt::Write as _;

use crate::schemas::grading::{GradingResult, QuestionScore, ResultRow};

const FEEDBACK_PREVIEW_CHARS: usize = 60;

pub(crate) fn table_rows(results: &[GradingResult]) -> Vec<ResultRow> {
    results
        .iter()
        .map(|result| ResultRow {
            student_name: result.student_name.clone(),
            total_score: result.total_score,
            feedback: result.feedback.clone(),
            source_file_name: result.source_file_name.clone(),
        })
        .collect()
}

/// The downloadable results document: a pretty-printed JSON array with
/// non-ASCII text kept as-is.
pub(crate) fn to_export_json(results: &[GradingResult]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(results)
}

#[cfg(test)]
pub(crate) fn from_export_json(document: &str) -> serde_json::Result<Vec<GradingResult>> {
    serde_json::from_str(document)
}

/// Per-question scores as a single spreadsheet cell.
pub(crate) fn scores_cell(scores: &[QuestionScore]) -> String {
    serde_json::to_string(scores).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn render_table(rows: &[ResultRow]) -> String {
    let headers = ["student_name", "total_score", "feedback", "source_file_name"];
    let cells: Vec<[String; 4]> = rows
        .iter()
        .map(|row| {
            [
                row.student_name.clone(),
                format_score(row.total_score),
                preview(&row.feedback),
                row.source_file_name.clone(),
            ]
        })
        .collect();

    let mut widths = headers.map(|header| header.chars().count());
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_line(&mut out, &headers.map(str::to_string), &widths);
    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    let _ = writeln!(out, "{}", rule.join("-+-"));
    for row in &cells {
        push_line(&mut out, row, &widths);
    }
    out
}

fn push_line(out: &mut String, cells: &[String; 4], widths: &[usize; 4]) {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths.iter())
        .map(|(cell, width)| {
            let pad = width.saturating_sub(cell.chars().count());
            format!("{cell}{}", " ".repeat(pad))
        })
        .collect();
    let _ = writeln!(out, "{}", padded.join(" | ").trim_end());
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{score:.0}")
    } else {
        format!("{score}")
    }
}

fn preview(feedback: &str) -> String {
    let single_line = feedback.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= FEEDBACK_PREVIEW_CHARS {
        return single_line;
    }
    let mut cut: String = single_line.chars().take(FEEDBACK_PREVIEW_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> Vec<GradingResult> {
        vec![
            GradingResult {
                student_name: "김민지".to_string(),
                scores: vec![
                    QuestionScore {
                        question_number: 1,
                        score: 10.0,
                        max_score: 10.0,
                        reason: "정답".to_string(),
                    },
                    QuestionScore {
                        question_number: 2,
                        score: 2.5,
                        max_score: 5.0,
                        reason: "오답: 계산 실수".to_string(),
                    },
                ],
                total_score: 12.5,
                feedback: "전반적으로 우수합니다.".to_string(),
                source_file_name: "a.pdf".to_string(),
            },
            GradingResult::degraded("Upload failed: connection reset")
                .with_source_file_name("b.pdf"),
        ]
    }

    #[test]
    fn rows_project_display_columns_in_order() {
        let rows = table_rows(&sample_batch());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].student_name, "김민지");
        assert_eq!(rows[0].total_score, 12.5);
        assert_eq!(rows[1].source_file_name, "b.pdf");
        assert_eq!(rows[1].student_name, "Error");
    }

    #[test]
    fn export_document_round_trips() {
        let batch = sample_batch();
        let document = to_export_json(&batch).expect("serialize");
        let parsed = from_export_json(&document).expect("parse");
        assert_eq!(parsed, batch);
    }

    #[test]
    fn export_document_is_indented_and_keeps_non_ascii() {
        let document = to_export_json(&sample_batch()).expect("serialize");
        assert!(document.contains("김민지"));
        assert!(!document.contains("\\u"));
        assert!(document.contains("\n  {"));
        assert!(document.contains("\"q_num\": 1"));
        assert!(document.contains("\"source_file_name\": \"a.pdf\""));
    }

    #[test]
    fn scores_cell_is_compact_json() {
        let batch = sample_batch();
        let cell = scores_cell(&batch[0].scores);
        assert!(cell.starts_with("[{\"q_num\":1,"));
        assert_eq!(scores_cell(&[]), "[]");
    }

    #[test]
    fn render_table_aligns_and_truncates_feedback() {
        let mut batch = sample_batch();
        batch[1].feedback = "x".repeat(200);
        let table = render_table(&table_rows(&batch));
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("student_name"));
        assert!(lines[2].contains("12.5"));
        assert!(lines[3].contains("..."));
        assert!(!lines[3].contains(&"x".repeat(61)));
        assert!(lines[3].contains(" 0 "));
    }
}
