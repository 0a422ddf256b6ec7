use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use ninebot_bms_lib::client::BmuClient;
use ninebot_bms_lib::connection::TcpConnector;
use ninebot_bms_lib::retry::{Backoff, Immediate, Limited, Retry, RetryPolicy, Transient};
use ninebot_bms_lib::telemetry::Poller;
use std::{ops::Deref, panic, time::Duration};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

/// Gives up after `retries` attempts, waiting `backoff` (doubled each time) in between.
#[derive(Debug)]
struct LimitedBackoff {
    limit: Limited,
    backoff: Backoff,
}

impl RetryPolicy for LimitedBackoff {
    fn next(&mut self, attempt: u32, reason: Transient) -> Retry {
        match self.limit.next(attempt, reason) {
            Retry::GiveUp => Retry::GiveUp,
            _ => self.backoff.next(attempt, reason),
        }
    }
}

fn retry_policy(retries: Option<u32>, backoff: Option<Duration>) -> Box<dyn RetryPolicy> {
    let backoff = backoff.map(|initial| Backoff {
        initial,
        max: MAX_BACKOFF,
    });
    match (retries, backoff) {
        (None, None) => Box::new(Immediate),
        (Some(max_attempts), None) => Box::new(Limited { max_attempts }),
        (None, Some(backoff)) => Box::new(backoff),
        (Some(max_attempts), Some(backoff)) => Box::new(LimitedBackoff {
            limit: Limited { max_attempts },
            backoff,
        }),
    }
}

macro_rules! print_value {
    ($label:expr, $value:expr) => {
        println!(
            "{}: {:?}",
            $label,
            $value.with_context(|| format!("Cannot get {}", $label))?
        )
    };
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let connector = TcpConnector::new(&args.address).with_connect_timeout(args.timeout);
    let mut bmu = BmuClient::with_connector(connector, retry_policy(args.retries, args.backoff));
    bmu.set_timeout(args.timeout);
    bmu.set_cells(args.cells);

    match args.command {
        CliCommands::Status => print_value!("Status", bmu.get_status()),
        CliCommands::Serial => print_value!("Serial number", bmu.get_serial_number()),
        CliCommands::Capacity => {
            print_value!("Remaining capacity %", bmu.get_remaining_capacity_percent());
            print_value!("Remaining capacity mAh", bmu.get_remaining_capacity());
            print_value!("Actual capacity mAh", bmu.get_actual_capacity());
            print_value!("Factory capacity mAh", bmu.get_factory_capacity());
        }
        CliCommands::Current => print_value!("Current A", bmu.get_current()),
        CliCommands::Voltage => print_value!("Voltage V", bmu.get_voltage()),
        CliCommands::Temperature => print_value!("Temperatures °C", bmu.get_temperatures()),
        CliCommands::CellVoltages => print_value!("Cell voltages mV", bmu.get_cell_voltages()),
        CliCommands::ReadRegister { address, length } => {
            let payload = bmu
                .read_register(address, length)
                .with_context(|| format!("Cannot read register {address:#04X}"))?;
            println!("Register {address:#04X}: {payload:02X?}");
        }
        CliCommands::All => print_value!("Snapshot", bmu.read_snapshot()),
        CliCommands::Daemon { output, interval } => {
            daemon::run(Poller::new(bmu), output, interval)?
        }
    }

    Ok(())
}
