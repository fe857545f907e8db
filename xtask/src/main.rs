mod common;
mod extend;

use clap::Parser;

fn main() {
    let cli = Cli::parse();
    common::logger_init(&cli.log);
    if let Err(e) = cli.extend.invoke() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Extend the position embedding of a model, initialized by hierarchical decomposition.
#[derive(Parser)]
#[clap(name = "extend-position")]
#[clap(version, long_about = None)]
struct Cli {
    #[clap(flatten)]
    extend: extend::ExtendArgs,
    /// Log level, may be "off", "trace", "debug", "info" or "error".
    #[clap(long)]
    log: Option<String>,
}

#[test]
fn test_cli() {
    use clap::CommandFactory;

    Cli::command().debug_assert();

    let cli = Cli::try_parse_from([
        "extend-position",
        "--input",
        "bert-base",
        "--output",
        "bert-base-1024",
        "--new_pos",
        "1024",
    ])
    .unwrap();
    assert_eq!(cli.extend.hp_alpha, 0.4);
    assert_eq!(cli.extend.new_pos, 1024);
    assert_eq!(cli.extend.pos_key, None);
    assert_eq!(cli.log, None);

    let cli = Cli::try_parse_from([
        "extend-position",
        "--input=a",
        "--output=b",
        "--new_pos=4096",
        "--hp_alpha=0.25",
        "--pos_key=bert.embeddings.position_embeddings.weight",
        "--log=info",
    ])
    .unwrap();
    assert_eq!(cli.extend.hp_alpha, 0.25);
    assert_eq!(cli.log.as_deref(), Some("info"));

    for args in [
        &["extend-position", "--input=a", "--output=b"][..],
        &["extend-position", "--input=a", "--new_pos=8"],
        &["extend-position", "--input=a", "--output=b", "--new-pos=8"],
        &["extend-position", "--input=a", "--output=b", "--new_pos=-8"],
        &["extend-position", "--input=a", "--output=b", "--new_pos=8", "--hp_alpha=x"],
    ] {
        assert!(Cli::try_parse_from(args).is_err(), "{args:?}");
    }
}
