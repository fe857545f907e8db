use clap::Args;
use hierarchical_position::{HpAlpha, DEFAULT_HP_ALPHA};
use log::info;
use model_transfer::{PositionKey, Transfer, TransferError};
use std::{path::PathBuf, time::Instant};

#[derive(Args)]
pub(crate) struct ExtendArgs {
    /// Original model directory.
    #[clap(long)]
    pub input: String,
    /// Target model directory.
    #[clap(long)]
    pub output: String,
    /// New max position embeddings.
    #[clap(long = "new_pos")]
    pub new_pos: usize,
    /// Interpolation coefficient, strictly between 0 and 1.
    #[clap(long = "hp_alpha", default_value_t = DEFAULT_HP_ALPHA, allow_negative_numbers = true)]
    pub hp_alpha: f64,
    /// Exact name of the position embedding tensor; searched by name pattern if absent.
    #[clap(long = "pos_key")]
    pub pos_key: Option<String>,
}

impl ExtendArgs {
    pub fn invoke(self) -> Result<(), TransferError> {
        let transfer = Transfer {
            input: PathBuf::from(self.input),
            output: PathBuf::from(self.output),
            new_len: self.new_pos,
            alpha: HpAlpha::new(self.hp_alpha)?,
            position_key: self
                .pos_key
                .map_or_else(PositionKey::default, PositionKey::Exact),
        };

        let time = Instant::now();
        let report = transfer.run()?;
        info!(
            "extend {:?} -> {:?}: \"{}\" {:?} -> {:?} ... {:?}",
            transfer.input,
            transfer.output,
            report.name,
            report.original,
            report.extended,
            time.elapsed(),
        );
        Ok(())
    }
}

#[test]
fn test_invalid_alpha() {
    use hierarchical_position::ExtendError;
    use model_transfer::TransferError::Extend;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out");
    for hp_alpha in [1., 0., -0.4, 2.] {
        let args = ExtendArgs {
            input: dir.path().to_string_lossy().into(),
            output: output.to_string_lossy().into(),
            new_pos: 16,
            hp_alpha,
            pos_key: None,
        };
        assert!(matches!(
            args.invoke(),
            Err(Extend(ExtendError::InvalidAlpha(_)))
        ));
    }
    // 参数检查先于任何文件操作
    assert!(!output.exists());
}

#[test]
fn test_missing_input() {
    let dir = tempfile::tempdir().unwrap();
    let args = ExtendArgs {
        input: dir.path().join("missing").to_string_lossy().into(),
        output: dir.path().join("out").to_string_lossy().into(),
        new_pos: 16,
        hp_alpha: DEFAULT_HP_ALPHA,
        pos_key: None,
    };
    assert!(matches!(
        args.invoke(),
        Err(TransferError::SourceNotFound(_))
    ));
}
