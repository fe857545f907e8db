//! 模型文件读写的公共部分。

#![deny(missing_docs)]

mod between_f64;
mod data_type;

pub mod safe_tensors;
pub mod test_model;

use std::{fmt, io::Error as IoError};

pub use between_f64::BetweenF64;
pub use data_type::DataType;
pub use half::{bf16, f16};

/// 文件加载错误。
#[derive(Debug)]
pub enum FileLoadError {
    /// 文件读写失败，或文件内容不符合格式。
    Io(IoError),
    /// JSON 解析失败。
    Json(serde_json::Error),
}

impl fmt::Display for FileLoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for FileLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
        }
    }
}

/// 按行宽取出第 `line` 行。
#[macro_export]
macro_rules! slice {
    ($blob:expr; $width:expr; [$line:expr]) => {
        $blob[$line * $width..][..$width]
    };
}

#[test]
fn test_slice() {
    let rows = [1u8, 2, 3, 4, 5, 6];
    assert_eq!(slice!(rows; 3; [1]), [4, 5, 6]);
    assert_eq!(slice!(rows; 2; [0]), [1, 2]);
}
