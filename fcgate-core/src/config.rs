mod defaults;
mod load;
mod types;
mod validate;

pub use defaults::DEFAULT_SPLIT_PATH_REGEX;
pub use load::{load_config, load_config_with_sources, load_configs, load_configs_with_sources};
pub use types::*;
