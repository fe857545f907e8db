use crate::ExtendError;
use common::{bf16, f16, slice, BetweenF64, DataType};

/// 行优先存储的位置嵌入表，行号即位置号。
#[derive(Clone, PartialEq, Debug)]
pub struct Embedding {
    pub(crate) dt: DataType,
    pub(crate) rows: usize,
    pub(crate) cols: usize,
    pub(crate) data: Vec<u8>,
}

impl Embedding {
    /// 用小端字节构造 `rows x cols` 的表，字节数必须与形状一致。
    pub fn new(dt: DataType, rows: usize, cols: usize, data: Vec<u8>) -> Result<Self, ExtendError> {
        let expected = rows
            .checked_mul(cols)
            .and_then(|n| n.checked_mul(dt.size()));
        if expected != Some(data.len()) {
            return Err(ExtendError::DataLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            dt,
            rows,
            cols,
            data,
        })
    }

    /// 从按行优先排列的数值构造表。
    pub fn from_values<T: BetweenF64>(
        rows: usize,
        cols: usize,
        values: &[T],
    ) -> Result<Self, ExtendError> {
        let size = T::DATA_TYPE.size();
        let mut data = vec![0u8; values.len() * size];
        for (x, dst) in values.iter().zip(data.chunks_exact_mut(size)) {
            x.write_le(dst);
        }
        Self::new(T::DATA_TYPE, rows, cols, data)
    }

    /// 元素类型。
    #[inline]
    pub fn data_type(&self) -> DataType {
        self.dt
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `[rows, cols]`。
    #[inline]
    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    /// 全部小端字节。
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// 一行的原始字节。
    #[inline]
    pub fn row_bytes(&self, row: usize) -> &[u8] {
        &slice!(self.data; self.cols * self.dt.size(); [row])
    }

    /// 把一行转换为 `f64`。
    pub fn row_f64(&self, row: usize) -> Vec<f64> {
        fn widen<T: BetweenF64>(bytes: &[u8]) -> Vec<f64> {
            bytes
                .chunks_exact(T::DATA_TYPE.size())
                .map(|b| T::read_le(b).get())
                .collect()
        }
        let bytes = self.row_bytes(row);
        match self.dt {
            DataType::F16 => widen::<f16>(bytes),
            DataType::BF16 => widen::<bf16>(bytes),
            DataType::F32 => widen::<f32>(bytes),
        }
    }
}

#[test]
fn test_new() {
    let table = Embedding::new(DataType::F16, 2, 3, vec![0; 12]).unwrap();
    assert_eq!(table.shape(), [2, 3]);
    assert_eq!(table.row_bytes(1).len(), 6);

    assert_eq!(
        Embedding::new(DataType::F32, 2, 3, vec![0; 12]),
        Err(ExtendError::DataLength {
            expected: Some(24),
            actual: 12,
        })
    );
    assert!(matches!(
        Embedding::new(DataType::F32, usize::MAX, 2, vec![]),
        Err(ExtendError::DataLength { expected: None, .. })
    ));
}

#[test]
fn test_rows() {
    let table = Embedding::from_values(2, 2, &[1.0f32, 2.0, -0.5, 4.25]).unwrap();
    assert_eq!(table.data_type(), DataType::F32);
    assert_eq!(table.row_f64(0), [1.0, 2.0]);
    assert_eq!(table.row_f64(1), [-0.5, 4.25]);
    assert_eq!(table.row_bytes(1), [(-0.5f32).to_le_bytes(), 4.25f32.to_le_bytes()].concat());
}
