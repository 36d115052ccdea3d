use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use crate::core::{config::Settings, telemetry};
use crate::services::documents::SubmissionFile;
use crate::services::export::{render_table, table_rows, to_export_json};
use crate::services::gemini::GeminiClient;
use crate::services::pacing;
use crate::services::sheets::SheetsExporter;
use crate::tasks::batch::BatchRunner;

const DEFAULT_OUTPUT: &str = "grading_results.json";
const USAGE: &str =
    "usage: grade-batch <reference> <student>... [--rules <file>] [--out <file>] [--sheet <url>]";

#[derive(Debug, PartialEq)]
pub(crate) struct CliArgs {
    pub(crate) reference: PathBuf,
    pub(crate) students: Vec<PathBuf>,
    pub(crate) rules: Option<PathBuf>,
    pub(crate) out: PathBuf,
    pub(crate) sheet: Option<String>,
}

pub(crate) fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut positional = Vec::new();
    let mut rules = None;
    let mut out = PathBuf::from(DEFAULT_OUTPUT);
    let mut sheet = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rules" => {
                rules = Some(PathBuf::from(
                    args.next().ok_or_else(|| anyhow!("--rules missing value"))?,
                ));
            }
            "--out" => {
                out = PathBuf::from(args.next().ok_or_else(|| anyhow!("--out missing value"))?);
            }
            "--sheet" => {
                sheet = Some(args.next().ok_or_else(|| anyhow!("--sheet missing value"))?);
            }
            "-h" | "--help" => bail!(USAGE),
            _ if arg.starts_with("--") => bail!("Unknown argument: {arg}\n{USAGE}"),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    let reference = positional.next().ok_or_else(|| anyhow!("missing reference file\n{USAGE}"))?;
    let students: Vec<PathBuf> = positional.collect();
    if students.is_empty() {
        bail!("at least one student file is required\n{USAGE}");
    }

    Ok(CliArgs { reference, students, rules, out, sheet })
}

pub(crate) async fn run(args: CliArgs) -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_cli_tracing(&settings)?;

    let allowed = &settings.uploads().allowed_document_extensions;
    let reference = SubmissionFile::read_from_path(&args.reference, allowed)
        .await
        .with_context(|| format!("Failed to load reference {}", args.reference.display()))?;

    let mut students = Vec::with_capacity(args.students.len());
    for path in &args.students {
        let student = SubmissionFile::read_from_path(path, allowed)
            .await
            .with_context(|| format!("Failed to load submission {}", path.display()))?;
        students.push(student);
    }

    let rules = match &args.rules {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read rules {}", path.display()))?,
        ),
        None => None,
    };

    // Resolve the exporter before grading so bad credentials fail fast.
    let exporter = match &args.sheet {
        Some(_) => Some(
            SheetsExporter::from_settings(&settings)?
                .ok_or_else(|| anyhow!("--sheet requires GOOGLE_SERVICE_ACCOUNT_FILE"))?,
        ),
        None => None,
    };

    let backend = GeminiClient::from_settings(&settings)?;
    let pacer = pacing::from_settings(&settings);
    let runner = BatchRunner::new(&backend, pacer.as_ref());

    let results = runner
        .run(&reference, &students, rules.as_deref(), |progress| {
            eprintln!(
                "[{}/{}] {} ({:.0}%)",
                progress.completed,
                progress.total,
                progress.file_name,
                progress.fraction() * 100.0
            );
        })
        .await?;

    println!("{}", render_table(&table_rows(&results)));

    let document = to_export_json(&results)?;
    tokio::fs::write(&args.out, document)
        .await
        .with_context(|| format!("Failed to write {}", args.out.display()))?;
    eprintln!("Results written to {}", args.out.display());

    if let (Some(exporter), Some(url)) = (exporter, args.sheet.as_deref()) {
        let rows = exporter
            .append_results(url, &results)
            .await
            .with_context(|| format!("Spreadsheet export failed; results are in {}", args.out.display()))?;
        eprintln!("Appended {rows} row(s) to spreadsheet");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_positional_files_and_flags() {
        let parsed = parse_args(args(&[
            "key.pdf",
            "--rules",
            "rules.txt",
            "a.pdf",
            "b.png",
            "--sheet",
            "https://docs.google.com/spreadsheets/d/abc/edit",
        ]))
        .expect("args");

        assert_eq!(parsed.reference, PathBuf::from("key.pdf"));
        assert_eq!(parsed.students, vec![PathBuf::from("a.pdf"), PathBuf::from("b.png")]);
        assert_eq!(parsed.rules, Some(PathBuf::from("rules.txt")));
        assert_eq!(parsed.out, PathBuf::from(DEFAULT_OUTPUT));
        assert_eq!(parsed.sheet.as_deref(), Some("https://docs.google.com/spreadsheets/d/abc/edit"));
    }

    #[test]
    fn out_overrides_default_path() {
        let parsed = parse_args(args(&["key.pdf", "a.pdf", "--out", "run1.json"])).expect("args");
        assert_eq!(parsed.out, PathBuf::from("run1.json"));
    }

    #[test]
    fn requires_at_least_one_student() {
        let err = parse_args(args(&["key.pdf"])).unwrap_err();
        assert!(err.to_string().contains("at least one student"));
    }

    #[test]
    fn rejects_unknown_flags_and_missing_values() {
        assert!(parse_args(args(&["key.pdf", "a.pdf", "--verbose"])).is_err());
        assert!(parse_args(args(&["key.pdf", "a.pdf", "--out"])).is_err());
    }
}
