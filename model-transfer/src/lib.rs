//! 把模型目录转移到新目录，同时把位置嵌入扩展到新的最大长度。
//!
//! 转移分三步：原样复制无关文件，修改两个 JSON 配置中的长度，替换权重中的位置嵌入。
//! 任何一步失败都会立即返回，目标目录中已经写入的内容保持原样。

mod config;
mod error;
mod passthrough;
mod weights;

use error::io_error;
use hierarchical_position::HpAlpha;
use log::{info, warn};
use std::{fs, path::PathBuf, time::Instant};

pub use config::{
    patch_model_config, patch_tokenizer_config, MAX_POSITION_EMBEDDINGS, MODEL_MAX_LENGTH,
};
pub use error::TransferError;
pub use passthrough::copy_passthrough;
pub use weights::{locate, patch_weights, PatchReport, PositionKey, POSITION_EMBEDDING_PATTERN};

/// 模型配置文件。
pub const MODEL_CONFIG: &str = "config.json";
/// 分词器配置文件，可以不存在。
pub const TOKENIZER_CONFIG: &str = "tokenizer_config.json";
/// 权重文件。
pub const WEIGHT_FILE: &str = "model.safetensors";
/// 需要修改而不是复制的文件。
pub const MANAGED_FILES: [&str; 3] = [MODEL_CONFIG, TOKENIZER_CONFIG, WEIGHT_FILE];

/// 一次模型目录转移的全部参数。
#[derive(Clone, Debug)]
pub struct Transfer {
    pub input: PathBuf,
    pub output: PathBuf,
    pub new_len: usize,
    pub alpha: HpAlpha,
    pub position_key: PositionKey,
}

impl Transfer {
    pub fn run(&self) -> Result<PatchReport, TransferError> {
        let Self {
            input,
            output,
            new_len,
            alpha,
            position_key,
        } = self;
        let new_len = *new_len;

        if !input.is_dir() {
            return Err(TransferError::SourceNotFound(input.clone()));
        }
        fs::create_dir_all(output).map_err(io_error(output))?;
        // 权重文件在写出新文件时仍处于映射状态，不能原地修改
        let canonical_input = fs::canonicalize(input).map_err(io_error(input))?;
        let canonical_output = fs::canonicalize(output).map_err(io_error(output))?;
        if canonical_output == canonical_input {
            return Err(TransferError::SameDirectory(output.clone()));
        }
        // 否则复制时会把目标目录复制进自身
        if canonical_output.starts_with(&canonical_input) {
            return Err(TransferError::NestedOutput {
                input: input.clone(),
                output: output.clone(),
            });
        }

        let time = Instant::now();
        let count = copy_passthrough(input, output)?;
        info!("copy {count} passthrough entries ... {:?}", time.elapsed());

        let original = patch_model_config(input, output, new_len)?;
        info!("{MAX_POSITION_EMBEDDINGS}: {original} -> {new_len}");

        if patch_tokenizer_config(input, output, new_len)? {
            info!("{MODEL_MAX_LENGTH}: -> {new_len}");
        }

        let report = patch_weights(input, output, position_key, new_len, *alpha)?;
        if report.original[0] != original {
            warn!(
                "{MAX_POSITION_EMBEDDINGS} is {original} but \"{}\" has {} rows",
                report.name, report.original[0],
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod test_dir {
    use crate::{MODEL_CONFIG, WEIGHT_FILE};
    use common::safe_tensors::{save, Dtype, SafeTensor};
    use std::{collections::HashMap, fs, path::Path};

    pub const POSITION: &str = "bert.embeddings.position_embeddings.weight";

    pub fn values(len: usize, seed: usize) -> Vec<u8> {
        (0..len)
            .flat_map(|k| (((k * 31 + seed) % 1009) as f32 / 1009. - 0.5).to_le_bytes())
            .collect()
    }

    /// 生成一个 BERT 形式的模型目录，位置嵌入为 `rows x cols`。
    pub fn create(dir: &Path, rows: usize, cols: usize) {
        fs::write(
            dir.join(MODEL_CONFIG),
            format!(
                r#"{{"architectures": ["BertModel"], "max_position_embeddings": {rows}, "hidden_size": {cols}, "model_type": "bert"}}"#
            ),
        )
        .unwrap();
        fs::write(dir.join("vocab.txt"), "[PAD]\n[UNK]\n[CLS]\n[SEP]\n").unwrap();
        fs::create_dir_all(dir.join("1_Pooling")).unwrap();
        fs::write(dir.join("1_Pooling/config.json"), r#"{"pooling_mode_mean_tokens": true}"#)
            .unwrap();

        let word = values(10 * cols, 1);
        let position = values(rows * cols, 2);
        let bias = values(cols, 3);
        let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
        save(
            [
                (
                    "bert.embeddings.word_embeddings.weight",
                    SafeTensor {
                        dtype: Dtype::F32,
                        shape: &[10, cols],
                        data: &word,
                    },
                ),
                (
                    POSITION,
                    SafeTensor {
                        dtype: Dtype::F32,
                        shape: &[rows, cols],
                        data: &position,
                    },
                ),
                (
                    "bert.pooler.dense.bias",
                    SafeTensor {
                        dtype: Dtype::F32,
                        shape: &[cols],
                        data: &bias,
                    },
                ),
            ],
            Some(&metadata),
            dir.join(WEIGHT_FILE),
        )
        .unwrap();
    }
}

#[cfg(test)]
fn transfer(input: &std::path::Path, output: &std::path::Path, new_len: usize) -> Transfer {
    Transfer {
        input: input.into(),
        output: output.into(),
        new_len,
        alpha: HpAlpha::default(),
        position_key: PositionKey::default(),
    }
}

#[test]
fn test_transfer() {
    use common::safe_tensors::SafeTensors;
    use serde_json::Value;

    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let dst = root.path().join("extended/bert-1024");
    test_dir::create(src.path(), 512, 768);

    let report = transfer(src.path(), &dst, 1024).run().unwrap();
    assert_eq!(report.name, test_dir::POSITION);
    assert_eq!(report.extended, [1024, 768]);

    let config: Value =
        serde_json::from_slice(&fs::read(dst.join(MODEL_CONFIG)).unwrap()).unwrap();
    assert_eq!(config[MAX_POSITION_EMBEDDINGS], 1024);
    assert_eq!(config["hidden_size"], 768);
    assert_eq!(config["model_type"], "bert");

    let before = SafeTensors::single_file(src.path().join(WEIGHT_FILE)).unwrap();
    let after = SafeTensors::single_file(dst.join(WEIGHT_FILE)).unwrap();
    assert_eq!(after.metadata(), before.metadata());
    let (a, b) = (
        before.get(test_dir::POSITION).unwrap(),
        after.get(test_dir::POSITION).unwrap(),
    );
    assert_eq!(b.shape, [1024, 768]);
    assert_eq!(a.data[..768 * 4], b.data[..768 * 4]);
    for name in ["bert.embeddings.word_embeddings.weight", "bert.pooler.dense.bias"] {
        assert_eq!(before.get(name).unwrap().data, after.get(name).unwrap().data);
    }

    for file in ["vocab.txt", "1_Pooling/config.json"] {
        assert_eq!(
            fs::read(src.path().join(file)).unwrap(),
            fs::read(dst.join(file)).unwrap()
        );
    }
    assert!(!dst.join(TOKENIZER_CONFIG).exists());
}

#[test]
fn test_transfer_tokenizer_config() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    test_dir::create(src.path(), 16, 8);
    fs::write(
        src.path().join(TOKENIZER_CONFIG),
        r#"{"model_max_length": 16, "tokenizer_class": "BertTokenizer", "name": "中文模型"}"#,
    )
    .unwrap();

    transfer(src.path(), dst.path(), 100).run().unwrap();

    let text = fs::read_to_string(dst.path().join(TOKENIZER_CONFIG)).unwrap();
    assert!(text.contains("\"中文模型\""));
    let config: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(config[MODEL_MAX_LENGTH], 100);
    assert_eq!(config["tokenizer_class"], "BertTokenizer");
}

#[test]
fn test_transfer_exact_key() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    test_dir::create(src.path(), 8, 4);

    let mut args = transfer(src.path(), dst.path(), 64);
    args.position_key = PositionKey::Exact(test_dir::POSITION.into());
    args.alpha = HpAlpha::new(0.2).unwrap();
    assert_eq!(args.run().unwrap().extended, [64, 4]);

    args.position_key = PositionKey::Exact("embeddings.position_embeddings.weight".into());
    assert!(matches!(
        args.run(),
        Err(TransferError::PositionEmbeddingNotFound(_))
    ));
}

#[test]
fn test_transfer_invalid_input() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    let missing = src.path().join("missing");
    assert!(matches!(
        transfer(&missing, dst.path(), 16).run(),
        Err(TransferError::SourceNotFound(_))
    ));

    test_dir::create(src.path(), 4, 2);
    assert!(matches!(
        transfer(src.path(), src.path(), 16).run(),
        Err(TransferError::SameDirectory(_))
    ));
    assert!(matches!(
        transfer(src.path(), &src.path().join("."), 16).run(),
        Err(TransferError::SameDirectory(_))
    ));

    let nested = src.path().join("extended");
    assert!(matches!(
        transfer(src.path(), &nested, 64).run(),
        Err(TransferError::NestedOutput { .. })
    ));
    assert!(!nested.join("extended").exists());
    assert!(!nested.join("vocab.txt").exists());

    // 输入在输出之内不会自我复制
    let outer = tempfile::tempdir().unwrap();
    let inner = outer.path().join("bert");
    fs::create_dir(&inner).unwrap();
    test_dir::create(&inner, 4, 2);
    let report = transfer(&inner, outer.path(), 16).run().unwrap();
    assert_eq!(report.extended, [16, 2]);
    assert!(outer.path().join("vocab.txt").is_file());

    assert!(matches!(
        transfer(src.path(), dst.path(), 17).run(),
        Err(TransferError::Extend(
            hierarchical_position::ExtendError::OutOfRange { new_len: 17, max: 16 }
        ))
    ));
}

#[test]
fn test_transfer_missing_artifacts() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    test_dir::create(src.path(), 4, 2);

    fs::remove_file(src.path().join(WEIGHT_FILE)).unwrap();
    assert!(matches!(
        transfer(src.path(), dst.path(), 16).run(),
        Err(TransferError::MissingArtifact(path)) if path.ends_with(WEIGHT_FILE)
    ));

    fs::remove_file(src.path().join(MODEL_CONFIG)).unwrap();
    let dst = dst.path().join("partial");
    assert!(matches!(
        transfer(src.path(), &dst, 16).run(),
        Err(TransferError::MissingArtifact(path)) if path.ends_with(MODEL_CONFIG)
    ));
    // 失败前复制的文件保留在目标目录中
    assert!(dst.join("vocab.txt").is_file());
    assert!(!dst.join(MODEL_CONFIG).exists());
}

#[test]
fn test_transfer_real_model() {
    let Some(model) = common::test_model::find() else {
        return;
    };
    let dst = tempfile::tempdir().unwrap();
    let config: serde_json::Value =
        serde_json::from_slice(&fs::read(model.join(MODEL_CONFIG)).unwrap()).unwrap();
    let Some(len) = config[MAX_POSITION_EMBEDDINGS].as_u64() else {
        return;
    };
    match transfer(&model, dst.path(), len as usize * 2).run() {
        Ok(report) => println!("{report:?}"),
        Err(TransferError::PositionEmbeddingNotFound(key)) => {
            println!("{model:?} has no position embedding {key}")
        }
        Err(e) => panic!("{e}"),
    }
}
