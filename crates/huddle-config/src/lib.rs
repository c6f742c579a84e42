pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AgentConfig, AppConfig, HttpToolConfig, LlmProviderConfig, LogConfig, PlatformRoute,
    PromptConfig, StoreBackend, StoreConfig,
};
