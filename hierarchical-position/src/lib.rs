//! 层次分解的位置编码：把学习得到的位置嵌入表扩展到更长的序列。
//!
//! 新位置 `p` 被看作以原长度 `L` 为基数的两位数：高位 `i = p / L`，
//! 低位 `j = p % L`。先从原表中去掉 0 号位置按 `alpha` 的贡献得到基表，
//! 再按 `alpha` 混合高位和低位对应的基向量。

mod embedding;

use common::{bf16, f16, slice, BetweenF64, DataType};
use std::fmt;

pub use embedding::Embedding;

/// 默认的插值系数。
pub const DEFAULT_HP_ALPHA: f64 = 0.4;

/// 严格位于 `(0, 1)` 内的插值系数。
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct HpAlpha(f64);

impl HpAlpha {
    /// `alpha` 为 1 时基表的分母为 0，为 0 时高位不起作用，都视为配置错误。
    pub fn new(alpha: f64) -> Result<Self, ExtendError> {
        if alpha > 0. && alpha < 1. {
            Ok(Self(alpha))
        } else {
            Err(ExtendError::InvalidAlpha(alpha))
        }
    }

    #[inline]
    pub const fn get(self) -> f64 {
        self.0
    }
}

impl Default for HpAlpha {
    #[inline]
    fn default() -> Self {
        Self(DEFAULT_HP_ALPHA)
    }
}

impl TryFrom<f64> for HpAlpha {
    type Error = ExtendError;
    #[inline]
    fn try_from(alpha: f64) -> Result<Self, Self::Error> {
        Self::new(alpha)
    }
}

/// 扩展位置嵌入表时的错误。
#[derive(Clone, PartialEq, Debug)]
pub enum ExtendError {
    /// 插值系数不在 `(0, 1)` 内。
    InvalidAlpha(f64),
    /// 原表没有任何行。
    EmptyTable,
    /// 目标长度为 0。
    InvalidLength,
    /// 最后一个位置的高位超出原表，即 `new_len > L * L`。
    OutOfRange { new_len: usize, max: usize },
    /// 字节数与 `rows * cols * size` 不符，乘法溢出时 `expected` 为 `None`。
    DataLength {
        expected: Option<usize>,
        actual: usize,
    },
}

impl fmt::Display for ExtendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidAlpha(alpha) => {
                write!(f, "hp_alpha must lie strictly between 0 and 1, got {alpha}")
            }
            Self::EmptyTable => write!(f, "position embedding table is empty"),
            Self::InvalidLength => write!(f, "new position count must be at least 1"),
            Self::OutOfRange { new_len, max } => write!(
                f,
                "new position count {new_len} exceeds {max}, the square of the original length"
            ),
            Self::DataLength {
                expected: Some(expected),
                actual,
            } => write!(f, "table data has {actual} bytes, expected {expected}"),
            Self::DataLength {
                expected: None,
                actual,
            } => write!(f, "table shape overflows, data has {actual} bytes"),
        }
    }
}

impl std::error::Error for ExtendError {}

/// 用层次分解的位置编码把 `original` 扩展到 `new_len` 行。
///
/// 结果与输入的列数和数据类型相同。计算在 `f64` 中进行，每个元素只舍入一次，
/// 因此 0 号行与原表逐位相同。`p < L` 的行是重新组合的结果，不是原表的拷贝。
pub fn extend(
    original: &Embedding,
    new_len: usize,
    alpha: HpAlpha,
) -> Result<Embedding, ExtendError> {
    let rows = original.rows;
    if rows == 0 {
        return Err(ExtendError::EmptyTable);
    }
    if new_len == 0 {
        return Err(ExtendError::InvalidLength);
    }
    let max = rows.saturating_mul(rows);
    if new_len > max {
        return Err(ExtendError::OutOfRange { new_len, max });
    }

    log::debug!(
        "extend position embedding {rows}x{} -> {new_len}x{} ({}, alpha = {})",
        original.cols,
        original.cols,
        original.dt,
        alpha.get(),
    );

    let data = match original.dt {
        DataType::F16 => typed::<f16>(original, new_len, alpha.get()),
        DataType::BF16 => typed::<bf16>(original, new_len, alpha.get()),
        DataType::F32 => typed::<f32>(original, new_len, alpha.get()),
    };
    Embedding::new(original.dt, new_len, original.cols, data)
}

fn typed<T: BetweenF64>(original: &Embedding, new_len: usize, alpha: f64) -> Vec<u8> {
    use rayon::prelude::*;

    let Embedding { rows, cols, .. } = *original;
    let size = T::DATA_TYPE.size();
    if cols == 0 {
        return Vec::new();
    }

    let table = original
        .data
        .chunks_exact(size)
        .map(|b| T::read_le(b).get())
        .collect::<Vec<_>>();
    let first = &slice!(table; cols; [0]);
    let base = table
        .iter()
        .enumerate()
        .map(|(k, x)| (x - first[k % cols] * alpha) / (1. - alpha))
        .collect::<Vec<_>>();

    let mut ans = vec![0u8; new_len * cols * size];
    ans.par_chunks_mut(cols * size)
        .enumerate()
        .for_each(|(p, dst)| {
            let coarse = &slice!(base; cols; [p / rows]);
            let fine = &slice!(base; cols; [p % rows]);
            for ((hi, lo), dst) in coarse.iter().zip(fine).zip(dst.chunks_exact_mut(size)) {
                T::cast(alpha * hi + (1. - alpha) * lo).write_le(dst);
            }
        });
    ans
}

#[cfg(test)]
fn sample_table(rows: usize, cols: usize) -> Vec<f32> {
    (0..rows * cols)
        .map(|k| ((k as f32 * 0.7311).sin() * 0.05) + (k % 7) as f32 * 1e-3)
        .collect()
}

#[test]
fn test_shape() {
    let alpha = HpAlpha::default();
    for (rows, cols, new_len) in [(4, 3, 16), (4, 3, 7), (5, 8, 5), (5, 8, 1), (3, 2, 2)] {
        let table = Embedding::from_values(rows, cols, &sample_table(rows, cols)).unwrap();
        let ans = extend(&table, new_len, alpha).unwrap();
        assert_eq!(ans.shape(), [new_len, cols]);
        assert_eq!(ans.data_type(), DataType::F32);
        assert_eq!(ans.as_bytes().len(), new_len * cols * 4);
    }
}

#[test]
fn test_deterministic() {
    let table = Embedding::from_values(16, 12, &sample_table(16, 12)).unwrap();
    let alpha = HpAlpha::new(0.3).unwrap();
    let a = extend(&table, 200, alpha).unwrap();
    let b = extend(&table, 200, alpha).unwrap();
    assert_eq!(a.as_bytes(), b.as_bytes());
}

#[test]
fn test_first_row_exact() {
    let values = sample_table(8, 16);
    let tables = [
        Embedding::from_values(8, 16, &values).unwrap(),
        Embedding::from_values(8, 16, &values.iter().map(|&x| f16::from_f32(x)).collect::<Vec<_>>())
            .unwrap(),
        Embedding::from_values(8, 16, &values.iter().map(|&x| bf16::from_f32(x)).collect::<Vec<_>>())
            .unwrap(),
    ];
    for table in &tables {
        for alpha in [0.01, 0.1, 0.25, 0.4, 0.5, 0.75, 0.9, 0.99] {
            let ans = extend(table, 64, HpAlpha::new(alpha).unwrap()).unwrap();
            assert_eq!(ans.data_type(), table.data_type());
            assert_eq!(ans.row_bytes(0), table.row_bytes(0), "alpha = {alpha}");
        }
    }
}

#[test]
fn test_first_block() {
    // i = 0 时 alpha * base[0] + (1 - alpha) * base[j] 化简为 original[j]
    let table = Embedding::from_values(10, 6, &sample_table(10, 6)).unwrap();
    let ans = extend(&table, 10, HpAlpha::default()).unwrap();
    for p in 0..10 {
        for (x, y) in ans.row_f64(p).iter().zip(table.row_f64(p)) {
            assert!((x - y).abs() < 1e-6, "row {p}: {x} vs {y}");
        }
    }
}

#[test]
fn test_closed_form() {
    let (rows, cols) = (4, 3);
    let table = Embedding::from_values(rows, cols, &sample_table(rows, cols)).unwrap();
    let alpha = 0.4;
    let ans = extend(&table, rows * rows, HpAlpha::new(alpha).unwrap()).unwrap();

    let base = |k: usize| {
        table
            .row_f64(k)
            .iter()
            .zip(table.row_f64(0))
            .map(|(x, x0)| (x - x0 * alpha) / (1. - alpha))
            .collect::<Vec<_>>()
    };
    for p in [5, 6, 11, 15] {
        let (i, j) = (p / rows, p % rows);
        let expected = base(i)
            .iter()
            .zip(base(j))
            .map(|(hi, lo)| alpha * hi + (1. - alpha) * lo)
            .collect::<Vec<_>>();
        for (x, y) in ans.row_f64(p).iter().zip(expected) {
            assert!((x - y).abs() < 1e-6, "row {p}: {x} vs {y}");
        }
    }
    // 对角位置 p = i * (L + 1) 上高低位相同，结果就是基表
    let diagonal = ans.row_f64(2 * rows + 2);
    for (x, y) in diagonal.iter().zip(base(2)) {
        assert!((x - y).abs() < 1e-6);
    }
}

#[test]
fn test_zero_cols() {
    let table = Embedding::new(DataType::F16, 3, 0, vec![]).unwrap();
    let ans = extend(&table, 9, HpAlpha::default()).unwrap();
    assert_eq!(ans.shape(), [9, 0]);
    assert!(ans.as_bytes().is_empty());
}

#[test]
fn test_invalid_alpha() {
    for alpha in [1., 0., -0.5, 1.5, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            HpAlpha::new(alpha),
            Err(ExtendError::InvalidAlpha(_))
        ));
    }
    assert_eq!(HpAlpha::try_from(0.4).unwrap().get(), 0.4);
    assert_eq!(HpAlpha::default().get(), DEFAULT_HP_ALPHA);
}

#[test]
fn test_out_of_range() {
    let table = Embedding::from_values(4, 2, &sample_table(4, 2)).unwrap();
    let alpha = HpAlpha::default();
    assert!(extend(&table, 16, alpha).is_ok());
    assert_eq!(
        extend(&table, 17, alpha),
        Err(ExtendError::OutOfRange {
            new_len: 17,
            max: 16
        })
    );
    assert_eq!(extend(&table, 0, alpha), Err(ExtendError::InvalidLength));

    let empty = Embedding::new(DataType::F32, 0, 2, vec![]).unwrap();
    assert_eq!(extend(&empty, 1, alpha), Err(ExtendError::EmptyTable));
}
