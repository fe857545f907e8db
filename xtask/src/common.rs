use log::LevelFilter;
use simple_logger::SimpleLogger;

pub(crate) fn logger_init(log_level: &Option<String>) {
    if let Err(e) = SimpleLogger::new()
        .with_level(level(log_level.as_deref()))
        .init()
    {
        eprintln!("logger already initialized: {e}");
    }
}

/// 未指定或无法识别的级别按 `Warn` 处理。
fn level(log: Option<&str>) -> LevelFilter {
    log.and_then(|log| match log.to_lowercase().as_str() {
        "off" | "none" => Some(LevelFilter::Off),
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "error" => Some(LevelFilter::Error),
        _ => None,
    })
    .unwrap_or(LevelFilter::Warn)
}

#[test]
fn test_level() {
    assert_eq!(level(None), LevelFilter::Warn);
    assert_eq!(level(Some("INFO")), LevelFilter::Info);
    assert_eq!(level(Some("none")), LevelFilter::Off);
    assert_eq!(level(Some("verbose")), LevelFilter::Warn);
}
