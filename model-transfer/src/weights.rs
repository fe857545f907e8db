use crate::{error::io_error, TransferError, WEIGHT_FILE};
use common::{
    safe_tensors::{save, SafeTensor, SafeTensors},
    DataType,
};
use hierarchical_position::{extend, Embedding, HpAlpha};
use log::info;
use std::{fmt, path::Path, time::Instant};

/// 默认用于查找位置嵌入的名字片段。
pub const POSITION_EMBEDDING_PATTERN: &str = "embeddings.position_embeddings.weight";

/// 查找位置嵌入张量的方式。
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PositionKey {
    /// 张量名完全相同。
    Exact(String),
    /// 张量名包含该片段，且只能有一个张量匹配。
    Pattern(String),
}

impl Default for PositionKey {
    #[inline]
    fn default() -> Self {
        Self::Pattern(POSITION_EMBEDDING_PATTERN.into())
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exact(name) => write!(f, "named \"{name}\""),
            Self::Pattern(pattern) => write!(f, "containing \"{pattern}\""),
        }
    }
}

/// 在权重集合中找到位置嵌入张量的名字。
pub fn locate<'a>(safetensors: &'a SafeTensors, key: &PositionKey) -> Result<&'a str, TransferError> {
    let not_found = || TransferError::PositionEmbeddingNotFound(key.clone());
    match key {
        PositionKey::Exact(name) => safetensors
            .names()
            .find(|n| *n == name.as_str())
            .ok_or_else(not_found),
        PositionKey::Pattern(pattern) => {
            let matches = safetensors
                .names()
                .filter(|n| n.contains(pattern.as_str()))
                .collect::<Vec<_>>();
            match *matches.as_slice() {
                [] => Err(not_found()),
                [name] => Ok(name),
                _ => Err(TransferError::AmbiguousPositionEmbedding {
                    pattern: pattern.clone(),
                    matches: matches.iter().map(|n| n.to_string()).collect(),
                }),
            }
        }
    }
}

/// 权重替换的结果。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PatchReport {
    pub name: String,
    pub dt: DataType,
    pub original: [usize; 2],
    pub extended: [usize; 2],
    pub tensors: usize,
}

/// 加载 `src/model.safetensors`，扩展位置嵌入后把全部张量写入 `dst`。
///
/// 其他张量逐字节保留，张量顺序和 `__metadata__` 不变。
pub fn patch_weights(
    src: &Path,
    dst: &Path,
    key: &PositionKey,
    new_len: usize,
    alpha: HpAlpha,
) -> Result<PatchReport, TransferError> {
    let path = src.join(WEIGHT_FILE);
    if !path.is_file() {
        return Err(TransferError::MissingArtifact(path));
    }

    let time = Instant::now();
    let safetensors = SafeTensors::single_file(&path).map_err(|source| TransferError::Load {
        path: path.clone(),
        source,
    })?;
    info!(
        "load {} tensors from {path:?} ... {:?}",
        safetensors.tensors_count(),
        time.elapsed()
    );

    let name = locate(&safetensors, key)?;
    let tensor = safetensors
        .get(name)
        .ok_or_else(|| TransferError::PositionEmbeddingNotFound(key.clone()))?;
    let dt = DataType::from_dtype(tensor.dtype).ok_or_else(|| TransferError::UnsupportedDtype {
        name: name.into(),
        dtype: tensor.dtype,
    })?;
    let &[rows, cols] = tensor.shape else {
        return Err(TransferError::NotAMatrix {
            name: name.into(),
            shape: tensor.shape.to_vec(),
        });
    };
    if new_len < rows {
        info!("position embedding shrinks from {rows} to {new_len}");
    }

    let time = Instant::now();
    let original = Embedding::new(dt, rows, cols, tensor.data.to_vec())?;
    let extended = extend(&original, new_len, alpha)?;
    info!(
        "extend \"{name}\" {rows}x{cols} -> {new_len}x{cols} ({dt}) ... {:?}",
        time.elapsed()
    );

    let time = Instant::now();
    let shape = extended.shape();
    let replacement = SafeTensor {
        dtype: tensor.dtype,
        shape: &shape,
        data: extended.as_bytes(),
    };
    let out = dst.join(WEIGHT_FILE);
    save(
        safetensors
            .iter()
            .map(|(n, t)| if n == name { (n, replacement) } else { (n, t) }),
        safetensors.metadata(),
        &out,
    )
    .map_err(io_error(&out))?;
    info!("save {out:?} ... {:?}", time.elapsed());

    Ok(PatchReport {
        name: name.into(),
        dt,
        original: original.shape(),
        extended: shape,
        tensors: safetensors.tensors_count(),
    })
}

#[cfg(test)]
fn write_weights(dir: &Path, tensors: &[(&str, common::safe_tensors::Dtype, &[usize])]) {
    use common::safe_tensors::Dtype;

    let data = tensors
        .iter()
        .map(|(_, dtype, shape)| {
            let len = shape.iter().product::<usize>();
            let value = |k: usize| ((k * 7 % 13) as f32 - 6.) / 16.;
            match dtype {
                Dtype::F32 => (0..len)
                    .flat_map(|k| value(k).to_le_bytes())
                    .collect::<Vec<u8>>(),
                Dtype::F16 => (0..len)
                    .flat_map(|k| half::f16::from_f32(value(k)).to_le_bytes())
                    .collect(),
                _ => vec![0u8; len * dtype.size()],
            }
        })
        .collect::<Vec<Vec<u8>>>();
    save(
        tensors
            .iter()
            .zip(&data)
            .map(|(&(name, dtype, shape), data)| (name, SafeTensor { dtype, shape, data })),
        None,
        dir.join(WEIGHT_FILE),
    )
    .unwrap();
}

#[test]
fn test_locate() {
    use common::safe_tensors::Dtype::F32;

    let dir = tempfile::tempdir().unwrap();
    write_weights(
        dir.path(),
        &[
            ("bert.embeddings.word_embeddings.weight", F32, &[8, 4]),
            ("bert.embeddings.position_embeddings.weight", F32, &[4, 4]),
            ("bert.encoder.position_embeddings.weight", F32, &[4, 4]),
        ],
    );
    let safetensors = SafeTensors::single_file(dir.path().join(WEIGHT_FILE)).unwrap();

    assert_eq!(
        locate(&safetensors, &PositionKey::default()).unwrap(),
        "bert.embeddings.position_embeddings.weight"
    );
    assert_eq!(
        locate(
            &safetensors,
            &PositionKey::Exact("bert.encoder.position_embeddings.weight".into())
        )
        .unwrap(),
        "bert.encoder.position_embeddings.weight"
    );
    assert!(matches!(
        locate(&safetensors, &PositionKey::Exact("position_embeddings".into())),
        Err(TransferError::PositionEmbeddingNotFound(_))
    ));
    assert!(matches!(
        locate(&safetensors, &PositionKey::Pattern("rotary".into())),
        Err(TransferError::PositionEmbeddingNotFound(_))
    ));
    match locate(&safetensors, &PositionKey::Pattern("position_embeddings".into())) {
        Err(TransferError::AmbiguousPositionEmbedding { matches, .. }) => {
            assert_eq!(matches.len(), 2)
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[test]
fn test_patch_weights() {
    use common::safe_tensors::Dtype::{F16, F32};

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_weights(
        src.path(),
        &[
            ("embeddings.word_embeddings.weight", F32, &[10, 6]),
            ("embeddings.position_embeddings.weight", F16, &[8, 6]),
            ("pooler.dense.bias", F32, &[6]),
        ],
    );

    let report = patch_weights(
        src.path(),
        dst.path(),
        &PositionKey::default(),
        40,
        HpAlpha::default(),
    )
    .unwrap();
    assert_eq!(report.name, "embeddings.position_embeddings.weight");
    assert_eq!(report.dt, DataType::F16);
    assert_eq!(report.original, [8, 6]);
    assert_eq!(report.extended, [40, 6]);
    assert_eq!(report.tensors, 3);

    let before = SafeTensors::single_file(src.path().join(WEIGHT_FILE)).unwrap();
    let after = SafeTensors::single_file(dst.path().join(WEIGHT_FILE)).unwrap();
    assert_eq!(
        before.names().collect::<Vec<_>>(),
        after.names().collect::<Vec<_>>()
    );
    for name in ["embeddings.word_embeddings.weight", "pooler.dense.bias"] {
        let (a, b) = (before.get(name).unwrap(), after.get(name).unwrap());
        assert_eq!((a.dtype, a.shape, a.data), (b.dtype, b.shape, b.data));
    }
    let (a, b) = (
        before.get(&report.name).unwrap(),
        after.get(&report.name).unwrap(),
    );
    assert_eq!(b.dtype, F16);
    assert_eq!(b.shape, [40, 6]);
    assert_eq!(a.data[..12], b.data[..12]);
}

#[test]
fn test_patch_weights_errors() {
    use common::safe_tensors::Dtype::{F32, I64};

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let key = PositionKey::default();
    let alpha = HpAlpha::default();

    assert!(matches!(
        patch_weights(src.path(), dst.path(), &key, 16, alpha),
        Err(TransferError::MissingArtifact(_))
    ));

    write_weights(src.path(), &[("embeddings.word_embeddings.weight", F32, &[4, 2])]);
    assert!(matches!(
        patch_weights(src.path(), dst.path(), &key, 16, alpha),
        Err(TransferError::PositionEmbeddingNotFound(_))
    ));

    write_weights(src.path(), &[("embeddings.position_embeddings.weight", F32, &[2, 2, 2])]);
    assert!(matches!(
        patch_weights(src.path(), dst.path(), &key, 4, alpha),
        Err(TransferError::NotAMatrix { .. })
    ));

    write_weights(src.path(), &[("embeddings.position_embeddings.weight", I64, &[4, 2])]);
    assert!(matches!(
        patch_weights(src.path(), dst.path(), &key, 16, alpha),
        Err(TransferError::UnsupportedDtype { dtype: I64, .. })
    ));

    write_weights(src.path(), &[("embeddings.position_embeddings.weight", F32, &[4, 2])]);
    assert!(matches!(
        patch_weights(src.path(), dst.path(), &key, 17, alpha),
        Err(TransferError::Extend(_))
    ));
    assert!(!dst.path().join(WEIGHT_FILE).exists());
}
