//! Integration tests for traj-rs
//!
//! Note: Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use candle_core::{DType, Device, Tensor};
use std::io::Write;
use tempfile::NamedTempFile;
use traj_rs::{
    convert_npy_to_mat, limit_chunks, read_variables, split_into_chunks, ExtractorConfig,
    MatClass, TextCorpus, TrajError, TrajectoryExtractor, Verbosity, DEFAULT_CORPUS_PATH,
};

/// Test corpus loading collapses newlines
#[test]
fn test_corpus_loading() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "When I wrote the following pages,\nor rather the bulk of them").unwrap();

    let corpus = TextCorpus::load(file.path()).unwrap();
    assert!(!corpus.text().contains('\n'));
    assert_eq!(
        corpus.text(),
        "When I wrote the following pages, or rather the bulk of them"
    );
}

/// 1000 tokens in chunks of 50, limited to 5
#[test]
fn test_chunking_example() {
    let tokens: Vec<u32> = (0..1000).collect();
    let chunks = split_into_chunks(&tokens, 50);
    assert_eq!(chunks.len(), 20);
    assert!(chunks.iter().all(|c| c.len() == 50));

    let limited = limit_chunks(chunks, Some(5));
    assert_eq!(limited.len(), 5);
    assert_eq!(limited[0][0], 0);
    assert_eq!(limited[4][49], 249);
}

/// Test extractor config defaults
#[test]
fn test_extractor_config_defaults() {
    let config = ExtractorConfig::default();
    assert_eq!(config.verbosity, Verbosity::Minimal);
    assert!(!config.save_partial);
    assert!(config.max_trajectories.is_none());
    assert_eq!(config.corpus_path.to_str(), Some(DEFAULT_CORPUS_PATH));
}

/// Unknown models fail before the corpus is looked at
#[test]
fn test_unknown_model_before_io() {
    let config = ExtractorConfig {
        model: "openai-community/gpt2".to_string(),
        corpus_path: "/definitely/not/here.txt".into(),
        ..Default::default()
    };
    match TrajectoryExtractor::new(config) {
        Err(TrajError::UnknownModel(name)) => assert_eq!(name, "openai-community/gpt2"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("unknown model accepted"),
    }
}

/// Converting a saved trajectory tensor keeps shape and name
#[test]
fn test_trajectory_npy_to_mat() {
    let dir = tempfile::tempdir().unwrap();
    let npy = dir.path().join("final_embeddings_Llama-3.2-1B_chunk50.npy");
    Tensor::zeros((8, 17, 3), DType::F32, &Device::Cpu)
        .unwrap()
        .write_npy(&npy)
        .unwrap();

    let mat = convert_npy_to_mat(&npy, Some(&dir.path().join("mat"))).unwrap();
    assert_eq!(
        mat.file_name().unwrap(),
        "final_embeddings_Llama-3.2-1B_chunk50.mat"
    );

    let variables = read_variables(&mat).unwrap();
    assert_eq!(variables.len(), 1);
    assert_eq!(variables[0].name, "final_embeddings_Llama-3.2-1B_chunk50");
    assert_eq!(variables[0].dims, vec![8, 17, 3]);
}

/// Fortran-ordered uint16 input, as numpy writes for `np.asfortranarray`
#[test]
fn test_fortran_uint16_npy_to_mat() {
    let dir = tempfile::tempdir().unwrap();
    let npy = dir.path().join("counts.npy");

    let mut header =
        "{'descr': '<u2', 'fortran_order': True, 'shape': (2, 2), }".to_string();
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');
    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    for v in [1u16, 3, 2, 4] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    std::fs::write(&npy, bytes).unwrap();

    let mat = convert_npy_to_mat(&npy, Some(dir.path())).unwrap();
    let variables = read_variables(&mat).unwrap();
    assert_eq!(variables[0].name, "counts");
    assert_eq!(variables[0].class(), Some(MatClass::UInt16));
    assert_eq!(variables[0].dims, vec![2, 2]);

    // Column-major payload is the file's data unchanged
    let written = std::fs::read(&mat).unwrap();
    let tail: Vec<u16> = written[written.len() - 8..]
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(tail, vec![1, 3, 2, 4]);
}

/// Model download test: model loading
#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    use traj_rs::TrajModel;

    let model = TrajModel::from_pretrained_with_device("meta-llama/Llama-3.2-1B", true).unwrap();
    assert_eq!(model.n_layers(), 16);
    assert_eq!(model.d_model(), 2048);
}

/// Model download test: end-to-end extraction on a short corpus
#[test]
#[ignore = "requires model download"]
fn test_extraction_end_to_end() {
    use traj_rs::{Reporter, TrajModel};

    let dir = tempfile::tempdir().unwrap();
    let corpus_path = dir.path().join("walden.txt");
    std::fs::write(
        &corpus_path,
        "I went to the woods because I wished to live deliberately,\n\
         to front only the essential facts of life.",
    )
    .unwrap();

    let config = ExtractorConfig {
        chunksize: 4,
        model: "meta-llama/Llama-3.2-1B".to_string(),
        verbosity: Verbosity::Silent,
        max_trajectories: Some(3),
        corpus_path,
        output_dir: dir.path().to_path_buf(),
        force_cpu: true,
        ..Default::default()
    };
    let extractor = TrajectoryExtractor::new(config).unwrap();
    let model = TrajModel::from_pretrained_with_device("meta-llama/Llama-3.2-1B", true).unwrap();

    let (mut out, mut progress) = (Vec::new(), Vec::new());
    let mut reporter = Reporter::new(Verbosity::Silent, &mut out, &mut progress);
    let run = extractor.run(&model, &mut reporter).unwrap();

    assert_eq!(run.shape, vec![2048, 17, 3]);
    let saved = Tensor::read_npy(&run.final_path).unwrap();
    assert_eq!(saved.dims(), &[2048, 17, 3]);
}
