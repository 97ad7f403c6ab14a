//! Configuration: deployment targets and engine settings.
//!
//! Configuration is resolved once at startup into a [`ResolvedConfig`] and
//! passed explicitly; nothing here is global.

mod resolver;
mod settings;

pub use resolver::{
    ConfigDocument, ConfigResolver, ConfigSource, EnvironmentSection, JsonFileSource,
    JsonStrSource, OrganizationSection, ResolvedConfig, TOOLS_ENVIRONMENT,
};
pub use settings::{ConcurrencyPolicy, EngineConfig, ResumePolicy};
