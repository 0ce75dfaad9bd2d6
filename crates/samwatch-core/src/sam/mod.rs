//! Serverless application model: the entities a template is reconciled into

pub mod compiled_directory;
pub mod function;
pub mod layer;
pub mod parameters;
pub mod postprocess;
pub mod resource;
pub mod template;

pub use compiled_directory::{BuildOutcome, CompiledDirectory, DirectoryKind};
pub use function::FunctionEntity;
pub use layer::{classify_dependencies, LayerEntity, LocalDependency};
pub use parameters::ParameterOverlay;
pub use resource::{FunctionDecl, LayerDecl, NestedStackDecl, Resource};
pub use template::{ReloadPhase, TemplateReconciler};
