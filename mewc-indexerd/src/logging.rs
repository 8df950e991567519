//! Logging setup: colored level output to stdout, plain output to a rotating
//! file, mirroring florestad's `setup_logger`.

use std::fmt::Arguments;
use std::path::Path;

use fern::colors::Color;
use fern::colors::ColoredLevelConfig;
use fern::FormatCallback;
use log::Record;

pub fn setup_logger(data_dir: &Path, log_to_file: bool, log_to_stdout: bool, debug: bool) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::BrightBlack);

    let formatter = |use_colors: bool| {
        move |out: FormatCallback, message: &Arguments, record: &Record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                match use_colors {
                    true => colors.color(record.level()).to_string(),
                    false => record.level().to_string(),
                },
                record.target(),
                message
            ))
        }
    };

    let level = if debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };

    let mut dispatchers = fern::Dispatch::new();

    if log_to_stdout {
        dispatchers = dispatchers.chain(
            fern::Dispatch::new()
                .format(formatter(true))
                .level(level)
                .chain(std::io::stdout()),
        );
    }

    if log_to_file {
        std::fs::create_dir_all(data_dir)?;
        dispatchers = dispatchers.chain(
            fern::Dispatch::new()
                .format(formatter(false))
                .level(log::LevelFilter::Info)
                .chain(fern::log_file(data_dir.join("output.log"))?),
        );
    }

    dispatchers.apply()?;
    Ok(())
}
