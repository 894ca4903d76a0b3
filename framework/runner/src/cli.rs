use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(about, long_about = None)]
pub struct SweepCli {
    /// Path to a TOML file describing the sweep. Every setting has a default, so this is optional.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Only benchmark these queries, as a comma separated list of catalog names.
    ///
    /// Overrides the allow-list in the config file. Unknown names are reported and skipped.
    #[clap(long, value_delimiter = ',')]
    pub queries: Vec<String>,

    /// Store variants to sweep, for example `--variants neo4j,memgraph`.
    #[clap(long, value_delimiter = ',')]
    pub variants: Vec<String>,

    /// Directory the metrics CSV files and the run ledger are written to.
    #[clap(long)]
    pub output_dir: Option<PathBuf>,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,
}
