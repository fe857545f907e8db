use crate::{error::io_error, TransferError, MODEL_CONFIG, TOKENIZER_CONFIG};
use log::debug;
use serde::Serialize;
use serde_json::{ser::PrettyFormatter, Map, Serializer, Value};
use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind::NotFound, Write},
    path::Path,
};

/// 模型配置中的最大位置数。
pub const MAX_POSITION_EMBEDDINGS: &str = "max_position_embeddings";
/// 分词器配置中的最大长度。
pub const MODEL_MAX_LENGTH: &str = "model_max_length";

/// 把 `src/config.json` 的最大位置数改为 `new_len` 后写入 `dst`，返回原来的值。
pub fn patch_model_config(src: &Path, dst: &Path, new_len: usize) -> Result<usize, TransferError> {
    let path = src.join(MODEL_CONFIG);
    let mut config = read_object(&path)?;
    let original = config
        .get(MAX_POSITION_EMBEDDINGS)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(TransferError::MissingField {
            path,
            field: MAX_POSITION_EMBEDDINGS,
        })?;
    config.insert(MAX_POSITION_EMBEDDINGS.into(), new_len.into());
    write_object(&dst.join(MODEL_CONFIG), &config)?;
    Ok(original)
}

/// `src/tokenizer_config.json` 存在时把其中的最大长度改为 `new_len` 后写入 `dst`。
///
/// 返回是否存在分词器配置。
pub fn patch_tokenizer_config(
    src: &Path,
    dst: &Path,
    new_len: usize,
) -> Result<bool, TransferError> {
    let path = src.join(TOKENIZER_CONFIG);
    if !path.is_file() {
        debug!("{path:?} not found, skipped");
        return Ok(false);
    }
    let mut config = read_object(&path)?;
    config.insert(MODEL_MAX_LENGTH.into(), new_len.into());
    write_object(&dst.join(TOKENIZER_CONFIG), &config)?;
    Ok(true)
}

fn read_object(path: &Path) -> Result<Map<String, Value>, TransferError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        NotFound => TransferError::MissingArtifact(path.to_path_buf()),
        _ => io_error(path)(e),
    })?;
    let value = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
        TransferError::Json {
            path: path.to_path_buf(),
            source,
        }
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(TransferError::NotAnObject(path.to_path_buf())),
    }
}

/// 以单空格缩进写出，非 ASCII 字符原样保留。
fn write_object(path: &Path, config: &Map<String, Value>) -> Result<(), TransferError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut ser = Serializer::with_formatter(BufWriter::new(file), PrettyFormatter::with_indent(b" "));
    config.serialize(&mut ser).map_err(|source| TransferError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    ser.into_inner().flush().map_err(io_error(path))
}

#[test]
fn test_patch_model_config() {
    use std::fs;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    fs::write(
        src.path().join(MODEL_CONFIG),
        r#"{"architectures": ["BertModel"], "max_position_embeddings": 512, "hidden_size": 768, "label": "中文"}"#,
    )
    .unwrap();

    assert_eq!(patch_model_config(src.path(), dst.path(), 1024).unwrap(), 512);

    let text = fs::read_to_string(dst.path().join(MODEL_CONFIG)).unwrap();
    assert!(text.contains("\"中文\""));
    assert!(text.contains("\n \"hidden_size\": 768"));
    let config: Map<String, Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(
        config.keys().collect::<Vec<_>>(),
        ["architectures", MAX_POSITION_EMBEDDINGS, "hidden_size", "label"]
    );
    assert_eq!(config[MAX_POSITION_EMBEDDINGS], 1024);
    assert_eq!(config["architectures"][0], "BertModel");
}

#[test]
fn test_patch_model_config_errors() {
    use std::fs;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    assert!(matches!(
        patch_model_config(src.path(), dst.path(), 1024),
        Err(TransferError::MissingArtifact(_))
    ));

    fs::write(src.path().join(MODEL_CONFIG), r#"{"hidden_size": 768}"#).unwrap();
    assert!(matches!(
        patch_model_config(src.path(), dst.path(), 1024),
        Err(TransferError::MissingField {
            field: MAX_POSITION_EMBEDDINGS,
            ..
        })
    ));

    fs::write(src.path().join(MODEL_CONFIG), r#"{"max_position_embeddings": -1}"#).unwrap();
    assert!(matches!(
        patch_model_config(src.path(), dst.path(), 1024),
        Err(TransferError::MissingField { .. })
    ));

    fs::write(src.path().join(MODEL_CONFIG), "[512]").unwrap();
    assert!(matches!(
        patch_model_config(src.path(), dst.path(), 1024),
        Err(TransferError::NotAnObject(_))
    ));

    fs::write(src.path().join(MODEL_CONFIG), "{").unwrap();
    assert!(matches!(
        patch_model_config(src.path(), dst.path(), 1024),
        Err(TransferError::Json { .. })
    ));
    assert!(!dst.path().join(MODEL_CONFIG).exists());
}

#[test]
fn test_patch_tokenizer_config() {
    use std::fs;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    assert!(!patch_tokenizer_config(src.path(), dst.path(), 2048).unwrap());
    assert!(!dst.path().join(TOKENIZER_CONFIG).exists());

    fs::write(
        src.path().join(TOKENIZER_CONFIG),
        r#"{"do_lower_case": true, "model_max_length": 512}"#,
    )
    .unwrap();
    assert!(patch_tokenizer_config(src.path(), dst.path(), 2048).unwrap());
    let config: Value =
        serde_json::from_slice(&fs::read(dst.path().join(TOKENIZER_CONFIG)).unwrap()).unwrap();
    assert_eq!(config[MODEL_MAX_LENGTH], 2048);
    assert_eq!(config["do_lower_case"], true);

    // 缺少字段时补上
    fs::write(src.path().join(TOKENIZER_CONFIG), r#"{"do_lower_case": false}"#).unwrap();
    assert!(patch_tokenizer_config(src.path(), dst.path(), 4096).unwrap());
    let config: Value =
        serde_json::from_slice(&fs::read(dst.path().join(TOKENIZER_CONFIG)).unwrap()).unwrap();
    assert_eq!(config[MODEL_MAX_LENGTH], 4096);
}
