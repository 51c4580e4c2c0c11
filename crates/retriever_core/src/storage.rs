use crate::model::RetrievalResult;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub fn save_results_jsonl(path: &Path, results: &[RetrievalResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    for result in results {
        let line = serde_json::to_string(result).context("serialize retrieval result")?;
        writer
            .write_all(line.as_bytes())
            .context("write result line")?;
        writer.write_all(b"\n").context("write newline")?;
    }

    writer.flush().context("flush output")
}

pub fn load_results_jsonl(path: &Path) -> Result<Vec<RetrievalResult>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut results = Vec::new();

    for line in reader.lines() {
        let line = line.context("read jsonl line")?;
        if line.trim().is_empty() {
            continue;
        }
        let result: RetrievalResult =
            serde_json::from_str(&line).context("parse retrieval result json")?;
        results.push(result);
    }

    Ok(results)
}

#[derive(Serialize)]
struct CsvRow<'a> {
    id: &'a str,
    question: &'a str,
    rank: Option<usize>,
    passages: String,
    context: &'a str,
    original_context: Option<&'a str>,
}

pub fn save_results_csv(path: &Path, results: &[RetrievalResult]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;

    for r in results {
        writer
            .serialize(CsvRow {
                id: &r.id,
                question: &r.question,
                rank: r.rank,
                passages: r
                    .retrieved
                    .iter()
                    .map(|p| p.index.to_string())
                    .collect::<Vec<_>>()
                    .join(";"),
                context: &r.context,
                original_context: r.original_context.as_deref(),
            })
            .context("write csv row")?;
    }

    writer.flush().context("flush csv output")
}

/// Write as CSV when the extension is `.csv`, JSONL otherwise.
pub fn save_results(path: &Path, results: &[RetrievalResult]) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => save_results_csv(path, results),
        _ => save_results_jsonl(path, results),
    }
}
