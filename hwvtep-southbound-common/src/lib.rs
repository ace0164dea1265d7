//! Shared runtime plumbing for the hwvtep southbound crates: the process
//! logger and the settings loader.
mod logger;
mod settings;

pub use config::FileFormat;
pub use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
pub use logger::Logger;
pub use settings::{General, Inner, Settings, ENV_PREFIX};

/// Build and install the process logger described by `settings`.
///
/// The returned logger must be kept alive for file output to keep flushing.
pub fn init_logger(settings: &Settings) -> SouthboundResult<Logger> {
    let mut logger = Logger::new(Some(settings.general.level()?));
    logger.initialize(&settings.general.log_dir, &settings.general.log_file)?;
    Ok(logger)
}
