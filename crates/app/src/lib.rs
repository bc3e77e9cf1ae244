pub mod command;
pub mod error;
pub mod render;
pub mod runner;
pub mod settings;

pub use error::{AppError, AppResult};
pub use runner::Runner;
pub use settings::{AppSettings, SettingsError, SettingsStore};
