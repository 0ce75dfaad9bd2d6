pub mod cache;
pub mod cloud;
pub mod config;
pub mod di;
pub mod errors;
pub mod events;
pub mod framework;
pub mod manifest;
pub mod paths;
pub mod sam;
pub mod toolchain;

pub use cache::FingerprintCache;
pub use cloud::{AwsCliClient, CloudClient, MockCloudClient, StackResource};
pub use config::{CliOverrides, EnvOverrides, SamConfig};
pub use di::Container;
pub use errors::{Result, SamError};
pub use events::{Emitter, ListenerId};
pub use framework::{Framework, RunMode};
pub use sam::{
    CompiledDirectory, DirectoryKind, FunctionEntity, LayerEntity, ReloadPhase,
    TemplateReconciler,
};
pub use toolchain::{InstallMode, MockToolchain, ProcessToolchain, Toolchain};
