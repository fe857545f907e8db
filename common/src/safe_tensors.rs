//! safetensors 单文件的加载、访问和保存。

use crate::FileLoadError::{self, Io, Json};
use itertools::Itertools;
use memmap2::Mmap;
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{self, BufWriter, Error as IoError, ErrorKind::InvalidData, Write},
    mem::size_of,
    path::Path,
    slice,
};

pub use safetensors::{tensor::TensorInfo, Dtype};

/// 内存映射的 safetensors 文件。
///
/// 张量按数据在文件中的偏移排序，保存时保持这一顺序。
pub struct SafeTensors {
    tensors: Vec<(String, TensorInfo)>,
    metadata: Option<HashMap<String, String>>,
    data_offset: usize,
    file: Mmap,
}

/// safetensors 文件中的张量，或将要写入文件的张量。
#[derive(Clone, Copy, Debug)]
pub struct SafeTensor<'a> {
    /// 数据类型。
    pub dtype: Dtype,
    /// 形状。
    pub shape: &'a [usize],
    /// 小端序数据。
    pub data: &'a [u8],
}

/// [SafeTensors] 的张量迭代器。
pub struct Iter<'a> {
    obj: &'a SafeTensors,
    iter: slice::Iter<'a, (String, TensorInfo)>,
}

impl SafeTensors {
    /// 加载单个 `.safetensors` 文件。
    ///
    /// 文件在映射后即关闭，映射随 [SafeTensors] 一起释放。
    pub fn single_file(path: impl AsRef<Path>) -> Result<Self, FileLoadError> {
        let file = {
            let file = File::open(path).map_err(Io)?;
            unsafe { Mmap::map(&file) }.map_err(Io)?
        };
        let (header_len, header) = load_header(&file)?;
        let data_offset = size_of::<u64>() + header_len;
        let data_len = file.len() - data_offset;

        for (name, info) in &header.tensors {
            check_info(name, info, data_len)?;
        }

        let tensors = header
            .tensors
            .into_iter()
            .sorted_by(|(a_name, a), (b_name, b)| {
                a.data_offsets
                    .cmp(&b.data_offsets)
                    .then_with(|| a_name.cmp(b_name))
            })
            .collect();

        Ok(Self {
            tensors,
            metadata: header.metadata,
            data_offset,
            file,
        })
    }

    /// 检查张量是否存在。
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.iter().any(|(n, _)| n == name)
    }

    /// 获取张量。
    #[inline]
    pub fn get(&self, name: &str) -> Option<SafeTensor> {
        self.tensors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, info)| self.get_internal(info))
    }

    /// 按文件顺序获取所有张量名。
    #[inline]
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.tensors.iter().map(|(name, _)| &**name)
    }

    /// 获取张量数量。
    #[inline]
    pub fn tensors_count(&self) -> usize {
        self.tensors.len()
    }

    /// 获取文件头中的 `__metadata__`。
    #[inline]
    pub fn metadata(&self) -> Option<&HashMap<String, String>> {
        self.metadata.as_ref()
    }

    /// 按文件顺序获取张量迭代器。
    #[inline]
    pub fn iter(&self) -> Iter {
        Iter {
            obj: self,
            iter: self.tensors.iter(),
        }
    }

    fn get_internal<'a>(&'a self, info: &'a TensorInfo) -> SafeTensor<'a> {
        let (begin, end) = info.data_offsets;
        SafeTensor {
            dtype: info.dtype,
            shape: &info.shape,
            data: &self.file[self.data_offset..][begin..end],
        }
    }
}

impl<'a> IntoIterator for &'a SafeTensors {
    type Item = (&'a str, SafeTensor<'a>);
    type IntoIter = Iter<'a>;
    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, SafeTensor<'a>);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter
            .next()
            .map(|(name, info)| (&**name, self.obj.get_internal(info)))
    }
}

/// 按给定顺序把张量写入 safetensors 文件。
///
/// 文件头用空格补齐到 8 字节对齐。
pub fn save<'a>(
    tensors: impl IntoIterator<Item = (&'a str, SafeTensor<'a>)>,
    metadata: Option<&HashMap<String, String>>,
    path: impl AsRef<Path>,
) -> io::Result<()> {
    let tensors = tensors.into_iter().collect::<Vec<_>>();

    let mut offset = 0usize;
    let header = SafeTensorsHeader {
        tensors: tensors
            .iter()
            .map(|(name, tensor)| {
                let info = TensorInfo {
                    dtype: tensor.dtype,
                    shape: tensor.shape.to_vec(),
                    data_offsets: {
                        let start = offset;
                        offset += tensor.data.len();
                        (start, offset)
                    },
                };
                (name.to_string(), info)
            })
            .collect(),
        metadata: metadata.cloned(),
    };
    debug_assert_eq!(header.tensors.len(), tensors.len());

    let header = {
        let str = serde_json::to_string(&header)?;
        let len = str.len();
        const ALIGN: usize = size_of::<u64>();
        let aligned = (len + ALIGN - 1) & !(ALIGN - 1);

        let mut buffer = Vec::with_capacity(ALIGN + aligned);
        buffer.extend_from_slice(&(aligned as u64).to_le_bytes());
        buffer.extend_from_slice(str.as_bytes());
        buffer.resize(ALIGN + aligned, b' ');
        buffer
    };

    let mut write = BufWriter::new(File::create(path)?);
    write.write_all(&header)?;
    for (_, tensor) in &tensors {
        write.write_all(tensor.data)?;
    }
    write.flush()
}

#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct SafeTensorsHeader {
    #[serde(flatten)]
    tensors: BTreeMap<String, TensorInfo>,
    #[serde(
        rename = "__metadata__",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    metadata: Option<HashMap<String, String>>,
}

fn invalid(msg: String) -> FileLoadError {
    Io(IoError::new(InvalidData, msg))
}

fn load_header(file: &[u8]) -> Result<(usize, SafeTensorsHeader), FileLoadError> {
    const BASE_OFFSET: usize = size_of::<u64>();
    let Some(len) = file.get(..BASE_OFFSET) else {
        return Err(invalid(format!(
            "safetensors file too short: {} bytes",
            file.len()
        )));
    };
    let mut buf = [0u8; BASE_OFFSET];
    buf.copy_from_slice(len);
    let len = u64::from_le_bytes(buf);

    let header = usize::try_from(len)
        .ok()
        .and_then(|len| file[BASE_OFFSET..].get(..len))
        .ok_or_else(|| invalid(format!("safetensors header length {len} exceeds file")))?;
    let header = serde_json::from_slice(header).map_err(Json)?;
    Ok((len as _, header))
}

fn check_info(name: &str, info: &TensorInfo, data_len: usize) -> Result<(), FileLoadError> {
    let (begin, end) = info.data_offsets;
    if begin > end || end > data_len {
        return Err(invalid(format!(
            "tensor \"{name}\" data {begin}..{end} out of {data_len} bytes"
        )));
    }
    let expected = info
        .shape
        .iter()
        .try_fold(info.dtype.size(), |acc, &d| acc.checked_mul(d));
    if expected != Some(end - begin) {
        return Err(invalid(format!(
            "tensor \"{name}\" of shape {:?} and dtype {:?} has {} bytes",
            info.shape,
            info.dtype,
            end - begin,
        )));
    }
    Ok(())
}

#[test]
fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");

    let a = [1u8; 3 * 2 * 4];
    let b = [2u8; 5 * 2];
    let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
    // 写入顺序与名字的字典序相反
    save(
        [
            (
                "z.weight",
                SafeTensor {
                    dtype: Dtype::F32,
                    shape: &[3, 2],
                    data: &a,
                },
            ),
            (
                "a.weight",
                SafeTensor {
                    dtype: Dtype::F16,
                    shape: &[5],
                    data: &b,
                },
            ),
        ],
        Some(&metadata),
        &path,
    )
    .unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    assert_eq!(header_len % 8, 0);

    let safetensors = SafeTensors::single_file(&path).unwrap();
    assert_eq!(safetensors.tensors_count(), 2);
    assert_eq!(
        safetensors.names().collect::<Vec<_>>(),
        ["z.weight", "a.weight"]
    );
    assert_eq!(safetensors.metadata(), Some(&metadata));

    let z = safetensors.get("z.weight").unwrap();
    assert_eq!(z.dtype, Dtype::F32);
    assert_eq!(z.shape, [3, 2]);
    assert_eq!(z.data, a);
    assert!(safetensors.contains("a.weight"));
    assert!(safetensors.get("b.weight").is_none());

    // 与 safetensors 库的解析结果一致
    let reference = safetensors::SafeTensors::deserialize(&bytes).unwrap();
    assert_eq!(reference.tensor("a.weight").unwrap().data(), b);
}

#[test]
fn test_load_reference_file() {
    use safetensors::tensor::TensorView;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    let data = (0..12u8).collect::<Vec<_>>();
    let view = TensorView::new(Dtype::U8, vec![3, 4], &data).unwrap();
    let bytes = safetensors::serialize([("w", view)], &None).unwrap();
    std::fs::write(&path, bytes).unwrap();

    let safetensors = SafeTensors::single_file(&path).unwrap();
    assert!(safetensors.metadata().is_none());
    let (name, w) = safetensors.iter().next().unwrap();
    assert_eq!(name, "w");
    assert_eq!(w.shape, [3, 4]);
    assert_eq!(w.data, data);
}

#[test]
fn test_invalid_file() {
    let dir = tempfile::tempdir().unwrap();

    let short = dir.path().join("short.safetensors");
    std::fs::write(&short, [1, 2, 3]).unwrap();
    match SafeTensors::single_file(&short) {
        Err(Io(e)) => assert_eq!(e.kind(), InvalidData),
        _ => panic!("short file must be rejected"),
    }

    let overflow = dir.path().join("overflow.safetensors");
    let mut bytes = 1024u64.to_le_bytes().to_vec();
    bytes.extend_from_slice(b"{}");
    std::fs::write(&overflow, bytes).unwrap();
    assert!(matches!(SafeTensors::single_file(&overflow), Err(Io(_))));

    let missing = dir.path().join("missing.safetensors");
    match SafeTensors::single_file(missing) {
        Err(Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
        _ => panic!("missing file must be an io error"),
    }
}
