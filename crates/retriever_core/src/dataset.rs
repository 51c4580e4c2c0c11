use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, AsArray, Int64Array, ListArray, RecordBatch, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int32Type, Int64Type};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use tracing::info;

use crate::error::RetrievalError;
use crate::model::{Answers, QaDataset, QaExample};

pub const TRAIN_SPLIT: &str = "train";
pub const VALIDATION_SPLIT: &str = "validation";

/// Load the `train` and `validation` splits stored under `dir`.
///
/// Each split is either `<split>.parquet` (SQuAD column layout) or
/// `<split>.jsonl` with one [`QaExample`] per line.
pub fn load_dataset(dir: &Path) -> Result<QaDataset> {
    let train = load_split(dir, TRAIN_SPLIT)?;
    let validation = load_split(dir, VALIDATION_SPLIT)?;
    info!(
        train = train.len(),
        validation = validation.len(),
        "loaded dataset from {}",
        dir.display()
    );
    Ok(QaDataset { train, validation })
}

pub fn load_split(dir: &Path, split: &str) -> Result<Vec<QaExample>> {
    let parquet = dir.join(format!("{split}.parquet"));
    if parquet.exists() {
        return read_squad_parquet(&parquet);
    }

    let jsonl = dir.join(format!("{split}.jsonl"));
    if jsonl.exists() {
        return read_examples_jsonl(&jsonl);
    }

    Err(RetrievalError::MissingSplit {
        split: split.to_string(),
        dir: dir.display().to_string(),
    }
    .into())
}

/// Flatten several splits into one query set, preserving order.
pub fn concatenate(splits: &[&[QaExample]]) -> Vec<QaExample> {
    splits.iter().flat_map(|s| s.iter().cloned()).collect()
}

pub fn read_examples_jsonl(path: &Path) -> Result<Vec<QaExample>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("read jsonl line")?;
        if line.trim().is_empty() {
            continue;
        }
        let example: QaExample = serde_json::from_str(&line)
            .with_context(|| format!("parse qa example at {}:{}", path.display(), lineno + 1))?;
        out.push(example);
    }

    Ok(out)
}

fn list_of(item: DataType) -> DataType {
    DataType::List(Arc::new(Field::new("item", item, true)))
}

/// Cast `col` to `to`, so large strings/lists and wider integers read the
/// same as the canonical SQuAD types.
fn normalized(col: &ArrayRef, name: &str, to: &DataType) -> Result<ArrayRef> {
    cast(col, to)
        .with_context(|| format!("column '{name}' has unexpected type {}", col.data_type()))
}

/// Read all rows from a SQuAD-style parquet file.
pub fn read_squad_parquet(path: &Path) -> Result<Vec<QaExample>> {
    let file = File::open(path).with_context(|| format!("open parquet: {}", path.display()))?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(file).context("build parquet reader")?;
    let reader = builder.build().context("open parquet batch reader")?;

    let mut rows = Vec::new();
    for batch_result in reader {
        let batch: RecordBatch = batch_result.context("read parquet batch")?;
        let n = batch.num_rows();

        let string_col = |name: &str| -> Result<StringArray> {
            let col = batch
                .column_by_name(name)
                .with_context(|| format!("missing column '{name}'"))?;
            Ok(normalized(col, name, &DataType::Utf8)?.as_string::<i32>().clone())
        };
        let id_col = string_col("id")?;
        let context_col = string_col("context")?;
        let question_col = string_col("question")?;
        let title_col = match batch.column_by_name("title") {
            Some(_) => Some(string_col("title")?),
            None => None,
        };
        let document_col: Option<Int64Array> = batch
            .column_by_name("document_id")
            .map(|c| {
                normalized(c, "document_id", &DataType::Int64)
                    .map(|a| a.as_primitive::<Int64Type>().clone())
            })
            .transpose()?;

        // answers is a struct { answer_start: list<int>, text: list<string> }
        let answers_col = batch
            .column_by_name("answers")
            .context("missing column 'answers'")?;
        let answers_struct = answers_col.as_struct_opt().with_context(|| {
            format!(
                "column 'answers' has unexpected type {}",
                answers_col.data_type()
            )
        })?;
        let text_list: ListArray = normalized(
            answers_struct
                .column_by_name("text")
                .context("missing answers.text")?,
            "answers.text",
            &list_of(DataType::Utf8),
        )?
        .as_list::<i32>()
        .clone();
        let start_list: Option<ListArray> = answers_struct
            .column_by_name("answer_start")
            .map(|c| {
                normalized(c, "answers.answer_start", &list_of(DataType::Int32))
                    .map(|a| a.as_list::<i32>().clone())
            })
            .transpose()?;

        for i in 0..n {
            let text: Vec<String> = if text_list.is_valid(i) {
                let values = text_list.value(i);
                let arr = values.as_string::<i32>();
                (0..arr.len())
                    .filter(|&j| arr.is_valid(j))
                    .map(|j| arr.value(j).to_string())
                    .collect()
            } else {
                Vec::new()
            };

            let answer_start: Vec<i32> = match &start_list {
                Some(list) if list.is_valid(i) => {
                    let values = list.value(i);
                    let arr = values.as_primitive::<Int32Type>();
                    (0..arr.len())
                        .filter(|&j| arr.is_valid(j))
                        .map(|j| arr.value(j))
                        .collect()
                }
                _ => Vec::new(),
            };

            rows.push(QaExample {
                id: id_col.value(i).to_string(),
                title: title_col
                    .as_ref()
                    .filter(|c| c.is_valid(i))
                    .map(|c| c.value(i).to_string())
                    .unwrap_or_default(),
                context: context_col.value(i).to_string(),
                question: question_col.value(i).to_string(),
                answers: Answers { answer_start, text },
                document_id: document_col
                    .as_ref()
                    .filter(|c| c.is_valid(i))
                    .map(|c| c.value(i)),
            });
        }
    }

    Ok(rows)
}

/// Render the first `n` examples as a table for the run report.
pub fn preview(examples: &[QaExample], n: usize) -> Result<String> {
    let head = &examples[..n.min(examples.len())];
    let column = |f: fn(&QaExample) -> String| -> ArrayRef {
        Arc::new(StringArray::from(head.iter().map(f).collect::<Vec<_>>()))
    };

    let batch = RecordBatch::try_from_iter(vec![
        ("id", column(|e| e.id.clone())),
        ("title", column(|e| e.title.clone())),
        ("question", column(|e| e.question.clone())),
        ("context", column(|e| truncate(&e.context, 60))),
        ("answers", column(|e| e.answers.text.join(" | "))),
    ])
    .context("build preview batch")?;

    let table = arrow::util::pretty::pretty_format_batches(&[batch]).context("format preview")?;
    Ok(table.to_string())
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    text: String,
}

/// De-duplicated passage texts of the Wikipedia corpus.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    contexts: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl Corpus {
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut contexts = Vec::new();
        let mut lookup = HashMap::new();
        for text in texts {
            let text = text.into();
            if lookup.contains_key(&text) {
                continue;
            }
            lookup.insert(text.clone(), contexts.len());
            contexts.push(text);
        }
        Self { contexts, lookup }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.contexts.get(index).map(String::as_str)
    }

    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    pub fn index_of(&self, text: &str) -> Option<usize> {
        self.lookup.get(text).copied()
    }
}

pub fn context_file(data_path: &Path, context_path: &str) -> PathBuf {
    data_path.join(context_path)
}

/// Read `data_path/context_path`, a JSON object of documents keyed by id, and
/// keep each distinct `text` in file order.
pub fn load_contexts(data_path: &Path, context_path: &str) -> Result<Corpus> {
    let path = context_file(data_path, context_path);
    let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
    let docs: serde_json::Map<String, serde_json::Value> =
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse wikipedia documents {}", path.display()))?;

    let total = docs.len();
    let mut texts = Vec::with_capacity(total);
    for (key, value) in docs {
        let doc: RawDocument = serde_json::from_value(value)
            .with_context(|| format!("document {key}: missing 'text'"))?;
        texts.push(doc.text);
    }

    let corpus = Corpus::from_texts(texts);
    if corpus.is_empty() {
        return Err(RetrievalError::EmptyCorpus.into());
    }
    info!(
        documents = total,
        passages = corpus.len(),
        "loaded passage corpus"
    );
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{
        Int32Array, Int64Builder, LargeStringArray, ListBuilder, StringBuilder, StructArray,
    };
    use parquet::arrow::ArrowWriter;
    use std::io::Write;

    #[test]
    fn corpus_dedups_in_first_seen_order() {
        let corpus = Corpus::from_texts(["b", "a", "b", "c", "a"]);
        assert_eq!(corpus.contexts(), &["b", "a", "c"]);
        assert_eq!(corpus.index_of("c"), Some(2));
        assert_eq!(corpus.index_of("z"), None);
    }

    #[test]
    fn load_contexts_keeps_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = File::create(dir.path().join("wiki.json")).unwrap();
        write!(
            f,
            r#"{{"10": {{"text": "ten", "title": "T"}}, "2": {{"text": "two"}}, "3": {{"text": "ten"}}}}"#
        )
        .unwrap();

        let corpus = load_contexts(dir.path(), "wiki.json").unwrap();
        assert_eq!(corpus.contexts(), &["ten", "two"]);
    }

    #[test]
    fn load_contexts_rejects_empty_corpus() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wiki.json"), "{}").unwrap();
        let err = load_contexts(dir.path(), "wiki.json").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RetrievalError>(),
            Some(RetrievalError::EmptyCorpus)
        ));
    }

    #[test]
    fn load_dataset_reads_jsonl_splits() {
        let dir = tempfile::tempdir().unwrap();
        let line = |id: &str| {
            format!(
                r#"{{"id":"{id}","title":"t","context":"c {id}","question":"q {id}","answers":{{"answer_start":[0],"text":["c"]}},"document_id":7}}"#
            )
        };
        std::fs::write(
            dir.path().join("train.jsonl"),
            format!("{}\n\n{}\n", line("a"), line("b")),
        )
        .unwrap();
        std::fs::write(dir.path().join("validation.jsonl"), line("c")).unwrap();

        let ds = load_dataset(dir.path()).unwrap();
        assert_eq!(ds.train.len(), 2);
        assert_eq!(ds.validation[0].id, "c");
        assert_eq!(ds.validation[0].document_id, Some(7));

        let all = concatenate(&[&ds.train, &ds.validation]);
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_split_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dataset(dir.path()).unwrap_err();
        assert!(err.to_string().contains("train"));
    }

    #[test]
    fn preview_renders_table() {
        let ex = QaExample {
            id: "q1".into(),
            title: "Seoul".into(),
            context: "Seoul is the capital of Korea.".into(),
            question: "What is the capital of Korea?".into(),
            answers: Answers {
                answer_start: vec![0],
                text: vec!["Seoul".into()],
            },
            document_id: None,
        };
        let table = preview(&[ex], 2).unwrap();
        assert!(table.contains("q1"));
        assert!(table.contains("question"));
    }

    fn write_parquet(path: &Path, columns: Vec<(&str, ArrayRef)>) {
        let batch = RecordBatch::try_from_iter(columns).unwrap();
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    fn answers_column(start: ArrayRef, text: ArrayRef) -> ArrayRef {
        Arc::new(StructArray::from(vec![
            (
                Arc::new(Field::new("answer_start", start.data_type().clone(), true)),
                start,
            ),
            (
                Arc::new(Field::new("text", text.data_type().clone(), true)),
                text,
            ),
        ]))
    }

    #[test]
    fn parquet_with_wide_types_is_normalized() {
        let mut starts = ListBuilder::new(Int64Builder::new());
        starts.values().append_value(0);
        starts.append(true);
        starts.values().append_value(5);
        starts.values().append_value(9);
        starts.append(true);
        let mut texts = ListBuilder::new(StringBuilder::new());
        texts.values().append_value("Seoul");
        texts.append(true);
        texts.values().append_value("Paris");
        texts.append(true);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.parquet");
        write_parquet(
            &path,
            vec![
                ("id", Arc::new(StringArray::from(vec!["q0", "q1"])) as ArrayRef),
                ("title", Arc::new(LargeStringArray::from(vec!["Seoul", "Paris"]))),
                (
                    "context",
                    Arc::new(LargeStringArray::from(vec![
                        "Seoul is in Korea",
                        "Paris is in France",
                    ])),
                ),
                (
                    "question",
                    Arc::new(StringArray::from(vec!["where is seoul", "where is paris"])),
                ),
                (
                    "answers",
                    answers_column(Arc::new(starts.finish()), Arc::new(texts.finish())),
                ),
                ("document_id", Arc::new(Int32Array::from(vec![Some(7), None]))),
            ],
        );

        let rows = read_squad_parquet(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].answers.answer_start, vec![0]);
        assert_eq!(rows[0].answers.text, vec!["Seoul".to_string()]);
        assert_eq!(rows[0].document_id, Some(7));
        assert_eq!(rows[1].answers.answer_start, vec![5, 9]);
        assert_eq!(rows[1].context, "Paris is in France");
        assert_eq!(rows[1].title, "Paris");
        assert_eq!(rows[1].document_id, None);
    }

    #[test]
    fn parquet_with_malformed_answers_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validation.parquet");
        write_parquet(
            &path,
            vec![
                ("id", Arc::new(StringArray::from(vec!["q0"])) as ArrayRef),
                ("context", Arc::new(StringArray::from(vec!["Seoul is in Korea"]))),
                ("question", Arc::new(StringArray::from(vec!["where is seoul"]))),
                ("answers", Arc::new(StringArray::from(vec!["Seoul"]))),
            ],
        );

        let err = read_squad_parquet(&path).unwrap_err();
        assert!(format!("{err:#}").contains("column 'answers' has unexpected type"));

        write_parquet(
            &path,
            vec![("context", Arc::new(StringArray::from(vec!["x"])) as ArrayRef)],
        );
        let err = read_squad_parquet(&path).unwrap_err();
        assert!(format!("{err:#}").contains("missing column 'id'"));
    }
}
