//! Logging setup. Uses `log4rs` for a rolling file appender, matching the
//! pattern/retention conventions of other embedded-engine crates.

use log::LevelFilter;
use std::path::Path;

/// Initializes logging from `log4rs.yaml` in the working directory, if present.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default())?;
    Ok(())
}

/// Initializes a rolling file logger at `{base_dir}/{db_name}_logs/{db_name}.log`.
///
/// # Errors
/// Returns an error if the log directory cannot be created or the appender
/// fails to build.
pub fn init_for_db_in(base_dir: &Path, db_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use log4rs::append::rolling_file::RollingFileAppender;
    use log4rs::append::rolling_file::policy::compound::{
        CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
    };
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use std::fs;

    let mut dir = base_dir.to_path_buf();
    dir.push(format!("{db_name}_logs"));
    fs::create_dir_all(&dir)?;

    let logfile = dir.join(format!("{db_name}.log"));
    let roller =
        FixedWindowRoller::builder().build(&format!("{}", dir.join(format!("{db_name}.{{}}.log")).display()), 7)?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(roller));
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}")))
        .build(logfile, Box::new(policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}
