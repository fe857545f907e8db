use crate::PositionKey;
use common::{safe_tensors::Dtype, FileLoadError};
use hierarchical_position::ExtendError;
use std::{fmt, io, path::PathBuf};

/// 转移模型目录时的错误，每种错误都指明出错的文件或张量。
#[derive(Debug)]
pub enum TransferError {
    SourceNotFound(PathBuf),
    SameDirectory(PathBuf),
    NestedOutput {
        input: PathBuf,
        output: PathBuf,
    },
    SymlinkLoop(PathBuf),
    MissingArtifact(PathBuf),
    NotAnObject(PathBuf),
    MissingField {
        path: PathBuf,
        field: &'static str,
    },
    PositionEmbeddingNotFound(PositionKey),
    AmbiguousPositionEmbedding {
        pattern: String,
        matches: Vec<String>,
    },
    NotAMatrix {
        name: String,
        shape: Vec<usize>,
    },
    UnsupportedDtype {
        name: String,
        dtype: Dtype,
    },
    Extend(ExtendError),
    Load {
        path: PathBuf,
        source: FileLoadError,
    },
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use TransferError::*;
        match self {
            SourceNotFound(path) => write!(f, "source model directory {path:?} not found"),
            SameDirectory(path) => {
                write!(f, "output directory {path:?} is the input directory")
            }
            NestedOutput { input, output } => {
                write!(f, "output directory {output:?} lies inside input directory {input:?}")
            }
            SymlinkLoop(path) => write!(f, "{path:?} links back to one of its parent directories"),
            MissingArtifact(path) => write!(f, "required file {path:?} not found"),
            NotAnObject(path) => write!(f, "{path:?} is not a json object"),
            MissingField { path, field } => {
                write!(f, "{path:?} has no unsigned integer field \"{field}\"")
            }
            PositionEmbeddingNotFound(key) => {
                write!(f, "position embedding not found: no tensor {key}")
            }
            AmbiguousPositionEmbedding { pattern, matches } => write!(
                f,
                "position embedding is ambiguous: {} tensors contain \"{pattern}\": {}",
                matches.len(),
                matches.join(", "),
            ),
            NotAMatrix { name, shape } => {
                write!(f, "tensor \"{name}\" has shape {shape:?}, expected 2 dimensions")
            }
            UnsupportedDtype { name, dtype } => write!(
                f,
                "tensor \"{name}\" has dtype {dtype:?}, expected F16, BF16 or F32"
            ),
            Extend(e) => write!(f, "cannot extend position embedding: {e}"),
            Load { path, source } => write!(f, "cannot load {path:?}: {source}"),
            Io { path, source } => write!(f, "io error on {path:?}: {source}"),
            Json { path, source } => write!(f, "invalid json in {path:?}: {source}"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Extend(e) => Some(e),
            Self::Load { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ExtendError> for TransferError {
    #[inline]
    fn from(e: ExtendError) -> Self {
        Self::Extend(e)
    }
}

/// 为 `map_err` 生成带路径的 io 错误。
#[inline]
pub(crate) fn io_error(path: &std::path::Path) -> impl FnOnce(io::Error) -> TransferError + '_ {
    move |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}
