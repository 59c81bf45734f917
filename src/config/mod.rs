/// Configuration loading: TOML file plus environment overrides

pub mod settings;

pub use settings::*;
