mod benchmark;
mod bootstrap;
mod cli;
mod config;
mod executor;
mod init;
mod monitor;
mod progress;
mod provision;
mod run;
mod self_monitor;
mod shell;
mod shutdown;
mod tool_path;
mod watcher;

pub mod prelude {
    pub use crate::benchmark::{BenchmarkRunner, BenchmarkTally};
    pub use crate::bootstrap::{
        BoltConnector, Bootstrapper, ContainerRuntime, ContainerSpec, DockerCli, StoreConnector,
    };
    pub use crate::cli::SweepCli;
    pub use crate::config::{
        BenchmarkConfig, CommandConfig, ExperimentsConfig, IngestionConfig, MonitorConfig,
        PathsConfig, PipelineConfig, ProvisioningConfig, SweepConfig, VariantConfig,
    };
    pub use crate::executor::Executor;
    pub use crate::init::init;
    pub use crate::monitor::{normalized_cpu, MonitorTarget, ResourceMonitor};
    pub use crate::progress::{progress_channel, ProgressEvent, ProgressSender, ScaleProgress};
    pub use crate::provision::{ClusterTool, KwokTool, Provisioner};
    pub use crate::run::{run, Sweep, SweepCollaborators, SweepReport};
    pub use crate::watcher::{
        IngestionDriver, IngestionWatcher, LaunchSpec, ProcessIngestion, ProducerProcess,
        RunningProcess, StableBlockDetector,
    };
}
