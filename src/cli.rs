use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "weather-fusion",
    version,
    about = "Collects weather readings from local and remote sources and fuses them"
)]
pub struct Args {
    /// Config file path. Overrides WEATHER_FUSION_CONFIG_PATH.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print the resolved configuration as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}
