use crate::{error::io_error, TransferError, MANAGED_FILES};
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// 把 `src` 中除受管文件以外的所有条目原样复制到 `dst`，返回复制的顶层条目数。
///
/// 文件逐字节复制，目录递归复制并保持结构。符号链接按其目标复制，
/// 指回上级目录的链接视为错误。`dst` 必须已经存在。
pub fn copy_passthrough(src: &Path, dst: &Path) -> Result<usize, TransferError> {
    let mut parents = vec![fs::canonicalize(src).map_err(io_error(src))?];
    let mut count = 0;
    for entry in fs::read_dir(src).map_err(io_error(src))? {
        let entry = entry.map_err(io_error(src))?;
        let name = entry.file_name();
        if MANAGED_FILES.iter().any(|managed| name == *managed) {
            continue;
        }
        copy_entry(&entry.path(), &dst.join(&name), &mut parents)?;
        count += 1;
    }
    Ok(count)
}

/// `parents` 是从 `src` 到 `from` 的上级目录的规范路径。
fn copy_entry(from: &Path, to: &Path, parents: &mut Vec<PathBuf>) -> Result<(), TransferError> {
    let link = fs::symlink_metadata(from)
        .map_err(io_error(from))?
        .file_type()
        .is_symlink();
    if from.is_dir() {
        let canonical = fs::canonicalize(from).map_err(io_error(from))?;
        if parents.contains(&canonical) {
            return Err(TransferError::SymlinkLoop(from.to_path_buf()));
        }
        if link {
            debug!("follow directory link {from:?} -> {canonical:?}");
        }
        fs::create_dir_all(to).map_err(io_error(to))?;
        let entries = fs::read_dir(from)
            .map_err(io_error(from))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error(from))?;
        parents.push(canonical);
        for entry in entries {
            copy_entry(&entry.path(), &to.join(entry.file_name()), parents)?;
        }
        parents.pop();
    } else {
        let len = fs::copy(from, to).map_err(io_error(from))?;
        debug!("copy {from:?} -> {to:?} ({len} bytes)");
    }
    Ok(())
}

#[test]
fn test_copy_passthrough() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (s, d) = (src.path(), dst.path());

    fs::write(s.join("vocab.txt"), "[PAD]\n[UNK]\n").unwrap();
    fs::write(s.join("special_tokens_map.json"), b"{\"unk_token\":\"[UNK]\"}").unwrap();
    fs::create_dir_all(s.join("1_Pooling/nested")).unwrap();
    fs::write(s.join("1_Pooling/config.json"), "{\"pooling\":true}").unwrap();
    fs::write(s.join("1_Pooling/nested/blob.bin"), [0u8, 255, 7]).unwrap();
    fs::create_dir(s.join("empty")).unwrap();
    for managed in MANAGED_FILES {
        fs::write(s.join(managed), "managed").unwrap();
    }

    assert_eq!(copy_passthrough(s, d).unwrap(), 4);

    for file in [
        "vocab.txt",
        "special_tokens_map.json",
        "1_Pooling/config.json",
        "1_Pooling/nested/blob.bin",
    ] {
        assert_eq!(fs::read(s.join(file)).unwrap(), fs::read(d.join(file)).unwrap());
    }
    assert!(d.join("empty").is_dir());
    for managed in MANAGED_FILES {
        assert!(!d.join(managed).exists(), "{managed} must not be copied");
    }
}

#[test]
fn test_copy_missing_source() {
    let dst = tempfile::tempdir().unwrap();
    let src = dst.path().join("missing");
    assert!(matches!(
        copy_passthrough(&src, dst.path()),
        Err(TransferError::Io { .. })
    ));
}

#[cfg(unix)]
#[test]
fn test_copy_symlinks() {
    use std::os::unix::fs::symlink;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let blobs = tempfile::tempdir().unwrap();
    let (s, d) = (src.path(), dst.path());

    fs::write(blobs.path().join("vocab"), "[PAD]\n").unwrap();
    fs::create_dir(blobs.path().join("pooling")).unwrap();
    fs::write(blobs.path().join("pooling/config.json"), "{}").unwrap();
    symlink(blobs.path().join("vocab"), s.join("vocab.txt")).unwrap();
    symlink(blobs.path().join("pooling"), s.join("1_Pooling")).unwrap();

    assert_eq!(copy_passthrough(s, d).unwrap(), 2);
    assert_eq!(fs::read(d.join("vocab.txt")).unwrap(), b"[PAD]\n");
    assert!(!fs::symlink_metadata(d.join("vocab.txt")).unwrap().file_type().is_symlink());
    assert_eq!(fs::read(d.join("1_Pooling/config.json")).unwrap(), b"{}");

    fs::create_dir(s.join("nested")).unwrap();
    symlink(s, s.join("nested/parent")).unwrap();
    let dst = tempfile::tempdir().unwrap();
    assert!(matches!(
        copy_passthrough(s, dst.path()),
        Err(TransferError::SymlinkLoop(path)) if path.ends_with("nested/parent")
    ));
    assert!(!dst.path().join("nested/parent/nested").exists());
}
