use crate::DataType;
use half::{bf16, f16};

/// 可以和 f64 双向转换、按小端序存储的元素类型；
pub trait BetweenF64: Copy + Send + Sync {
    /// 对应的数据类型；
    const DATA_TYPE: DataType;
    /// 将 f64 转换为 Self，按最近偶数舍入；
    fn cast(f: f64) -> Self;
    /// 将 Self 转换为 f64，无损；
    fn get(&self) -> f64;
    /// 从小端序字节读取；
    fn read_le(bytes: &[u8]) -> Self;
    /// 以小端序写入字节；
    fn write_le(&self, bytes: &mut [u8]);
}

macro_rules! impl_between_f64 {
    ($ty:ty, $dt:expr; $from:expr, $to:expr) => {
        impl BetweenF64 for $ty {
            const DATA_TYPE: DataType = $dt;

            #[inline]
            fn cast(f: f64) -> Self {
                #[allow(clippy::redundant_closure_call)]
                ($from)(f)
            }

            #[inline]
            fn get(&self) -> f64 {
                #[allow(clippy::redundant_closure_call)]
                ($to)(*self)
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                const N: usize = std::mem::size_of::<$ty>();
                let mut buf = [0u8; N];
                buf.copy_from_slice(&bytes[..N]);
                <$ty>::from_le_bytes(buf)
            }

            #[inline]
            fn write_le(&self, bytes: &mut [u8]) {
                const N: usize = std::mem::size_of::<$ty>();
                bytes[..N].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_between_f64!(f32, DataType::F32; |f: f64| f as f32, |x: f32| x as f64);
impl_between_f64!(f16, DataType::F16; f16::from_f64, f16::to_f64);
impl_between_f64!(bf16, DataType::BF16; bf16::from_f64, bf16::to_f64);

#[test]
fn test_round_trip() {
    fn check<T: BetweenF64 + PartialEq + std::fmt::Debug>(x: T) {
        let mut bytes = vec![0u8; T::DATA_TYPE.size()];
        x.write_le(&mut bytes);
        assert_eq!(T::read_le(&bytes), x);
        assert_eq!(T::cast(x.get()), x);
    }
    check(0.1f32);
    check(-3.5e-7f32);
    check(f16::from_f32(0.333));
    check(bf16::from_f32(-12.75));
}

#[test]
fn test_little_endian() {
    let mut bytes = [0u8; 4];
    1.0f32.write_le(&mut bytes);
    assert_eq!(bytes, [0x00, 0x00, 0x80, 0x3f]);
    assert_eq!(f16::read_le(&[0x00, 0x3c]), f16::ONE);
}
