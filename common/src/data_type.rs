use safetensors::Dtype;
use std::fmt;

/// 位置嵌入表支持的元素类型。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum DataType {
    /// IEEE 754 半精度。
    F16,
    /// brain float 16。
    BF16,
    /// IEEE 754 单精度。
    F32,
}

impl DataType {
    /// 单个元素的字节数。
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 2,
            Self::F32 => 4,
        }
    }

    /// 从 safetensors 类型转换，不支持的类型返回 `None`。
    #[inline]
    pub fn from_dtype(dtype: Dtype) -> Option<Self> {
        match dtype {
            Dtype::F16 => Some(Self::F16),
            Dtype::BF16 => Some(Self::BF16),
            Dtype::F32 => Some(Self::F32),
            _ => None,
        }
    }

    /// 转换为 safetensors 类型。
    #[inline]
    pub const fn to_dtype(&self) -> Dtype {
        match self {
            Self::F16 => Dtype::F16,
            Self::BF16 => Dtype::BF16,
            Self::F32 => Dtype::F32,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::F16 => write!(f, "float16"),
            Self::BF16 => write!(f, "bfloat16"),
            Self::F32 => write!(f, "float32"),
        }
    }
}

#[test]
fn test_dtype() {
    for dt in [DataType::F16, DataType::BF16, DataType::F32] {
        assert_eq!(DataType::from_dtype(dt.to_dtype()), Some(dt));
    }
    assert_eq!(DataType::from_dtype(Dtype::I64), None);
    assert_eq!(DataType::from_dtype(Dtype::F64), None);
    assert_eq!(DataType::BF16.to_string(), "bfloat16");
}
