use crate::config::LoggingConfig;
use std::path::PathBuf;

/// Target used for lines produced by job processes.
pub const JOB_OUTPUT_TARGET: &str = "job_output";

fn parse_level(level: &str) -> log::LevelFilter {
    level.parse().unwrap_or(log::LevelFilter::Info)
}

pub fn setup_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_file = std::env::var("JOBGATE_LOG")
        .map(PathBuf::from)
        .ok()
        .or_else(|| config.output.clone())
        .unwrap_or_else(|| PathBuf::from(common::DEFAULT_LOG_FILE));
    let jobs_log_file = config
        .jobs_output
        .clone()
        .unwrap_or_else(|| PathBuf::from(common::DEFAULT_JOBS_LOG_FILE));

    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(&config.level));

    // Main log: everything except job output
    let main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != JOB_OUTPUT_TARGET)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_file)?);

    // Jobs log: only job output
    let jobs_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() == JOB_OUTPUT_TARGET)
        .chain(fern::log_file(&jobs_log_file)?);

    base_config
        .chain(main_log)
        .chain(jobs_log)
        .apply()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_with_info_fallback() {
        assert_eq!(parse_level("debug"), log::LevelFilter::Debug);
        assert_eq!(parse_level("WARN"), log::LevelFilter::Warn);
        assert_eq!(parse_level("loud"), log::LevelFilter::Info);
    }
}
