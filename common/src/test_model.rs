//! 从环境变量中获得测试模型目录的函数。

use std::{
    env::var_os,
    fs::canonicalize,
    path::{Path, PathBuf},
    process::Command,
    str::from_utf8,
};

/// 从环境变量 `TEST_MODEL` 中获得测试模型目录。
///
/// 相对路径先相对当前目录解析，再相对工作空间根目录解析。
/// 目录中缺少 `config.json` 或 `model.safetensors` 时返回 `None`。
pub fn find() -> Option<PathBuf> {
    let model = var_os("TEST_MODEL")?;
    let path = canonicalize(&model)
        .ok()
        .or_else(|| canonicalize(workspace()?.join(&model)).ok())?;
    is_model_dir(&path).then_some(path)
}

/// 判断目录是否包含单文件模型。
pub fn is_model_dir(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    path.join("config.json").is_file() && path.join("model.safetensors").is_file()
}

fn workspace() -> Option<PathBuf> {
    let output = Command::new(env!("CARGO"))
        .arg("locate-project")
        .arg("--workspace")
        .arg("--message-format=plain")
        .output()
        .ok()?
        .stdout;
    Path::new(from_utf8(&output).ok()?.trim())
        .parent()
        .map(Path::to_path_buf)
}

#[test]
fn test_find() {
    println!("{:?}", find());
}

#[test]
fn test_is_model_dir() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!is_model_dir(dir.path()));
    std::fs::write(dir.path().join("config.json"), "{}").unwrap();
    assert!(!is_model_dir(dir.path()));
    std::fs::write(dir.path().join("model.safetensors"), []).unwrap();
    assert!(is_model_dir(dir.path()));
}
