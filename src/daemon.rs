use anyhow::{Context, Result};
use log::info;
use ninebot_bms_lib::connection::Connect;
use ninebot_bms_lib::retry::RetryPolicy;
use ninebot_bms_lib::telemetry::{Poller, TelemetryRecord, TelemetrySink};
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use crate::{commandline, mqtt};

/// Prints one status line per cycle.
pub struct ConsoleSink;

pub fn status_line(device_id: &str, record: &TelemetryRecord) -> String {
    let temperatures = record
        .temperatures
        .iter()
        .map(|t| format!("{t}°"))
        .collect::<Vec<_>>()
        .join("/");
    let ttl = match record.time_to_empty {
        Some(seconds) if seconds.is_finite() => {
            humantime::format_duration(Duration::from_secs(seconds as u64)).to_string()
        }
        _ => "-".to_string(),
    };
    format!(
        "[{}] [{}% / {}mAh] status: {:#b}; {:.2} A, {:.2} V, {:.2} W; {}; ttl {}",
        device_id,
        record.remaining_capacity_percent,
        record.remaining_capacity,
        record.status,
        record.current,
        record.voltage,
        record.power,
        temperatures,
        ttl,
    )
}

impl TelemetrySink for ConsoleSink {
    type Error = Infallible;

    fn publish(&mut self, device_id: &str, record: &TelemetryRecord) -> Result<(), Infallible> {
        println!("{}", status_line(device_id, record));
        Ok(())
    }
}

fn run_with<C, P, S>(mut poller: Poller<C, P>, mut sink: S, interval: Duration) -> Result<()>
where
    C: Connect,
    P: RetryPolicy,
    S: TelemetrySink,
    S::Error: fmt::Display,
{
    loop {
        poller
            .poll_into(&mut sink)
            .with_context(|| "Cannot read telemetry from BMU")?;
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }
}

pub fn run<C: Connect, P: RetryPolicy>(
    poller: Poller<C, P>,
    output: commandline::DaemonOutput,
    interval: Duration,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");

    match output {
        commandline::DaemonOutput::Console => run_with(poller, ConsoleSink, interval),
        commandline::DaemonOutput::Mqtt { config_file } => {
            let config = mqtt::MqttConfig::load(&config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let publisher = mqtt::MqttPublisher::new(config)
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully.");
            run_with(poller, publisher, interval)
        }
    }
}
