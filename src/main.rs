use chrono::Local;
use featrank::{cinfo, param, run};
use flexi_logger::{Duplicate, FileSpec, Logger, WriteMode};
use log::{error, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// "YYYY-MM-DD HH:MM:SS [LEVEL] message"
fn custom_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    write!(
        w,
        "{} [{}] {}",
        now.now().format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.args()
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    let param_file = std::env::args().nth(1).unwrap_or_else(|| "param.yaml".to_string());
    let param = param::get(param_file.clone())
        .map_err(|e| format!("Cannot load parameters from {}: {}", param_file, e))?;

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let _logger = if !param.general.log_base.is_empty() {
        Logger::try_with_str(&param.general.log_level)?
            .log_to_file(
                FileSpec::default()
                    .basename(&param.general.log_base)
                    .suffix(&param.general.log_suffix)
                    .discriminant(&timestamp),
            )
            .duplicate_to_stderr(Duplicate::All)
            .write_mode(WriteMode::BufferAndFlush)
            .format_for_files(custom_format)
            .format_for_stderr(custom_format)
            .start()?
    } else {
        Logger::try_with_str(&param.general.log_level)?
            .format(custom_format)
            .start()?
    };

    // SIGINT/SIGTERM stop the null estimation at the next round boundary
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        for signal in signals.forever() {
            warn!("Signal {} received: stopping after the current round...", signal);
            flag.store(false, Ordering::Relaxed);
        }
    });

    let exp = match run(&param, running) {
        Ok(exp) => exp,
        Err(e) => {
            error!("{}", e);
            return Err(e);
        }
    };

    cinfo!(param.general.display_colorful, "{}", exp.display_results());

    if !param.general.save_exp.is_empty() {
        exp.save_auto(&param.general.save_exp)?;
        cinfo!(
            param.general.display_colorful,
            "Experiment saved to {}",
            param.general.save_exp
        );
    }
    Ok(())
}
