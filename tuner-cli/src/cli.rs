use clap::Parser;
use tuner_core::{DropPolicy, EstimatorKind, TunerConfig};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Chromatic tuner for the terminal")]
pub struct Args {
    /// Path to a JSON config file
    #[arg(long)]
    pub config: Option<String>,

    /// Pitch estimator: spectral or bitstream (overrides config)
    #[arg(long)]
    pub estimator: Option<EstimatorKind>,

    /// What to do with windows that arrive while detection is busy:
    /// drop-newest or drop-oldest (overrides config)
    #[arg(long)]
    pub drop_policy: Option<DropPolicy>,

    /// Capture device id or name; defaults to the system default
    #[arg(long)]
    pub device: Option<String>,

    /// List capture devices and exit
    #[arg(long, default_value_t = false)]
    pub list_devices: bool,

    /// Tune a synthesized tone of this frequency instead of a device
    #[arg(long, value_name = "HZ")]
    pub tone: Option<f32>,

    /// Length of the synthesized tone
    #[arg(long, default_value_t = 5.0, value_name = "SECONDS")]
    pub seconds: f32,

    /// Print one JSON object per reading
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl Args {
    /// Builds the effective configuration: file (if any), then flags.
    pub fn tuner_config(&self) -> TunerConfig {
        let mut config = match &self.config {
            Some(path) => TunerConfig::load_or_default(path),
            None => TunerConfig::default(),
        };
        if let Some(estimator) = self.estimator {
            config.estimator = estimator;
        }
        if let Some(policy) = self.drop_policy {
            config.pipeline.drop_policy = policy;
        }
        config
    }
}
