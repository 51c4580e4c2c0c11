use assert_cmd::Command;
use predicates::prelude::*;
use retriever_core::load_results_jsonl;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

const PASSAGES: [(&str, &str); 6] = [
    ("Seoul", "seoul is the capital city of south korea"),
    ("Paris", "paris is the capital of france on the seine"),
    ("Nile", "the nile river flows north through egypt"),
    ("Everest", "mount everest is the highest mountain on earth"),
    ("Rust", "rust is a systems programming language focused on safety"),
    ("Tea", "green tea is brewed from leaves of camellia sinensis"),
];

const QUESTIONS: [(&str, usize); 6] = [
    ("what is the capital of south korea", 0),
    ("which river flows through egypt", 2),
    ("what is the highest mountain", 3),
    ("which programming language focuses on safety", 4),
    ("what is the capital of france", 1),
    ("what is green tea brewed from", 5),
];

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("retriever");
    Command::new(path)
}

fn example_line(i: usize) -> String {
    let (question, passage) = QUESTIONS[i];
    let (title, context) = PASSAGES[passage];
    json!({
        "id": format!("q{i}"),
        "title": title,
        "context": context,
        "question": question,
        "answers": {"answer_start": [0], "text": [title.to_lowercase()]},
        "document_id": passage,
    })
    .to_string()
}

/// Lays out `dataset/`, `data/` and `model/` under `root`.
fn write_fixture(root: &Path) {
    let dataset = root.join("dataset");
    let data = root.join("data");
    let model = root.join("model");
    for dir in [&dataset, &data, &model] {
        fs::create_dir_all(dir).unwrap();
    }

    let train: Vec<String> = (0..4).map(example_line).collect();
    let validation: Vec<String> = (4..6).map(example_line).collect();
    fs::write(dataset.join("train.jsonl"), train.join("\n")).unwrap();
    fs::write(dataset.join("validation.jsonl"), validation.join("\n")).unwrap();

    let docs: serde_json::Map<String, Value> = PASSAGES
        .iter()
        .enumerate()
        .map(|(i, (title, text))| (i.to_string(), json!({"title": title, "text": text})))
        .collect();
    fs::write(
        data.join("wikipedia_documents.json"),
        Value::Object(docs).to_string(),
    )
    .unwrap();

    fs::write(
        model.join("config.json"),
        json!({
            "vocab_size": 64,
            "hidden_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 32,
            "max_position_embeddings": 32
        })
        .to_string(),
    )
    .unwrap();
}

fn pipeline(root: &Path, mode: &str) -> Command {
    let mut cmd = bin();
    cmd.env("RUST_LOG", "warn")
        .arg("--dataset-name")
        .arg(root.join("dataset"))
        .arg("--model-name-or-path")
        .arg(root.join("model"))
        .arg("--data-path")
        .arg(root.join("data"))
        .args([
            "--mode",
            mode,
            "--sparse-method",
            "bm25",
            "--topk",
            "2",
            "--epochs",
            "1",
        ]);
    cmd
}

#[test]
fn train_then_eval_reuses_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let data = dir.path().join("data");

    pipeline(dir.path(), "train")
        .assert()
        .success()
        .stdout(predicate::str::contains("query dataset"))
        .stdout(predicate::str::contains("dataset size: 2"))
        .stdout(predicate::str::contains(
            "[bulk query by exhaustive search] done in",
        ))
        .stdout(predicate::str::contains(
            "correct retrieval result by exhaustive search",
        ))
        .stdout(predicate::str::contains("MRR = "));

    for artifact in [
        "bm25.bin",
        "dense/p_encoder.safetensors",
        "dense/q_encoder.safetensors",
        "dense_embedding.safetensors",
        "hybrid_logistic.bin",
    ] {
        assert!(data.join(artifact).exists(), "missing {artifact}");
    }
    let model_before = fs::read_to_string(data.join("hybrid_logistic.bin")).unwrap();

    let results = dir.path().join("results.jsonl");
    pipeline(dir.path(), "eval")
        .arg("--include-train")
        .arg("--results-output")
        .arg(&results)
        .assert()
        .success()
        .stdout(predicate::str::contains("dataset size: 6"))
        .stdout(predicate::str::contains("MRR = "));

    assert_eq!(
        fs::read_to_string(data.join("hybrid_logistic.bin")).unwrap(),
        model_before
    );

    let saved = load_results_jsonl(&results).unwrap();
    assert_eq!(saved.len(), 6);
    assert_eq!(saved[0].id, "q0");
    assert_eq!(saved[0].original_context.as_deref(), Some(PASSAGES[0].1));
    assert!(saved.iter().all(|r| r.retrieved.len() == 2));
    assert!(saved
        .iter()
        .all(|r| r.rank.map_or(true, |rank| (1..=2).contains(&rank))));
}

#[test]
fn eval_without_trained_encoders_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());

    pipeline(dir.path(), "eval")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("--mode train"));
}

#[test]
fn missing_dataset_split_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    fs::remove_file(dir.path().join("dataset").join("validation.jsonl")).unwrap();

    pipeline(dir.path(), "train")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("validation"));
}

#[test]
fn rejects_unknown_sparse_method() {
    bin()
        .args(["--sparse-method", "splade"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("splade"));
}

#[test]
fn rejects_zero_topk_before_loading_anything() {
    bin()
        .args(["--topk", "0", "--dataset-name", "/nonexistent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--topk must be greater than 0"));
}
