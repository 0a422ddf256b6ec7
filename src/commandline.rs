use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the BMU status word
    Status,
    /// Show the battery serial number
    Serial,
    /// Show remaining (percent and mAh), actual and factory capacity
    Capacity,
    /// Show the battery current in A (negative while charging)
    Current,
    /// Show the battery voltage in V
    Voltage,
    /// Show the temperature of each sensor zone in °C
    Temperature,
    /// Show individual cell voltages in mV
    CellVoltages,
    /// Read raw bytes from a register
    ReadRegister {
        /// Register address (e.g. 0x31 or 49)
        #[arg(value_parser = maybe_hex::<u8>)]
        address: u8,
        /// Number of bytes to read
        #[arg(value_parser = maybe_hex::<u8>, default_value = "2")]
        length: u8,
    },
    /// Show all available BMU information
    All,
    /// Run in daemon mode, polling the BMU and publishing telemetry
    Daemon {
        /// Output destination for telemetry
        #[command(subcommand)]
        output: DaemonOutput,
        /// Pause between polling cycles (e.g., "0s", "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "0s")]
        interval: Duration,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read telemetry and print a status line per cycle to the standard output.
    Console,
    /// Continuously read telemetry and publish it as JSON to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

const fn about_text() -> &'static str {
    "ninebot scooter bmu command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Address of the BMU bridge as host:port
    #[arg(short, long, default_value = "192.168.88.82:1234")]
    pub address: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Deadline for one request attempt (e.g., "500ms", "2s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "2s")]
    pub timeout: Duration,

    /// Number of cells in the battery pack
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u8).range(1..=127))]
    pub cells: u8,

    /// Give up a request after this many failed attempts (default: retry forever)
    #[arg(long)]
    pub retries: Option<u32>,

    /// Wait between attempts, doubling up to 30s (e.g., "100ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub backoff: Option<Duration>,
}
