use anyhow::{bail, Context, Result};
use ninebot_bms_lib::telemetry::{TelemetryRecord, TelemetrySink};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;

/// Publishes queued while the broker is unreachable; later ones are dropped.
const REQUEST_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    /// `{id}` is replaced with the device serial number
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_interval",
        with = "humantime_serde"
    )]
    reconnect_interval: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "ninebot/{id}".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("ninebot-bms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        config.qos()?;
        Ok(config)
    }

    pub fn qos(&self) -> Result<QoS> {
        Ok(match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            qos => bail!("Invalid MQTT QoS {qos}, expected 0, 1 or 2"),
        })
    }

    pub fn topic_for(&self, device_id: &str) -> String {
        self.topic.replace("{id}", device_id)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
    qos: QoS,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos()?;
        log::info!(
            "Attempting to connect to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut connection) = Client::new(config.options(), REQUEST_QUEUE_CAPACITY);
        let reconnect_interval = config.reconnect_interval;

        // The event loop has to be driven for publishes to go out
        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected to MQTT broker.")
                        }
                        Ok(event) => log::trace!("MQTT event: {event:?}"),
                        Err(err) => {
                            log::warn!(
                                "MQTT connection error: {err}, retrying in {reconnect_interval:?}"
                            );
                            std::thread::sleep(reconnect_interval);
                        }
                    }
                }
            })
            .with_context(|| "Cannot start MQTT event loop")?;

        Ok(Self {
            client,
            config,
            qos,
        })
    }

    /// Queues a message without waiting. Fails when the queue is full.
    pub fn send(&mut self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}",
            topic,
            self.qos
        );

        self.client
            .try_publish(topic, self.qos, false, payload.as_bytes())
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }
}

impl TelemetrySink for MqttPublisher {
    type Error = anyhow::Error;

    fn publish(&mut self, device_id: &str, record: &TelemetryRecord) -> Result<()> {
        let json_payload =
            serde_json::to_string(record).with_context(|| "Failed to serialize telemetry")?;
        let topic = self.config.topic_for(device_id);
        self.send(&topic, &json_payload)
    }
}
