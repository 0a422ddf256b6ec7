use crate::client::BmuClient;
use crate::connection::Connect;
use crate::estimator::{Estimate, Estimator};
use crate::protocol::Snapshot;
use crate::retry::RetryPolicy;
use crate::Result;
use chrono::{DateTime, Utc};
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

/// Everything published for one polling cycle.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    pub remaining_capacity_percent: i16,
    pub remaining_capacity: i16,
    pub actual_capacity: i16,
    pub factory_capacity: i16,
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
    pub cell_voltages: Vec<i16>,
    pub temperatures: Vec<i32>,
    #[cfg_attr(
        feature = "protocol_serde",
        serde(skip_serializing_if = "Option::is_none")
    )]
    pub drain_rate: Option<f64>,
    #[cfg_attr(
        feature = "protocol_serde",
        serde(rename = "ttl", skip_serializing_if = "Option::is_none")
    )]
    pub time_to_empty: Option<f64>,
    pub moving_avg_size: usize,
}

impl TelemetryRecord {
    pub fn new(snapshot: &Snapshot, estimate: &Estimate, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            status: snapshot.status,
            remaining_capacity_percent: snapshot.remaining_capacity_percent,
            remaining_capacity: snapshot.remaining_capacity,
            actual_capacity: snapshot.actual_capacity,
            factory_capacity: snapshot.factory_capacity,
            current: snapshot.current,
            voltage: snapshot.voltage,
            power: snapshot.power(),
            cell_voltages: snapshot.cell_voltages.clone(),
            temperatures: snapshot.temperatures.clone(),
            drain_rate: estimate.drain_rate,
            time_to_empty: estimate.time_to_empty,
            moving_avg_size: estimate.window_len,
        }
    }
}

/// Receives one complete record per polling cycle, keyed by device id.
pub trait TelemetrySink {
    type Error;

    fn publish(&mut self, device_id: &str, record: &TelemetryRecord)
        -> std::result::Result<(), Self::Error>;
}

/// Runs polling cycles: one snapshot read, one estimator update, one record.
#[derive(Debug)]
pub struct Poller<C: Connect, P: RetryPolicy> {
    client: BmuClient<C, P>,
    estimator: Estimator,
}

impl<C: Connect, P: RetryPolicy> Poller<C, P> {
    pub fn new(client: BmuClient<C, P>) -> Self {
        Self {
            client,
            estimator: Estimator::new(),
        }
    }

    /// Reads all registers and updates the estimate. Fails without touching
    /// the estimator if any register read fails.
    pub fn poll(&mut self) -> Result<(Snapshot, TelemetryRecord)> {
        let snapshot = self.client.read_snapshot()?;
        let timestamp = Utc::now();
        let estimate = self
            .estimator
            .observe(snapshot.remaining_capacity as i64, timestamp);
        let record = TelemetryRecord::new(&snapshot, &estimate, timestamp);
        Ok((snapshot, record))
    }

    /// Polls once and hands the record to `sink`. Sink failures are logged,
    /// not returned.
    pub fn poll_into<S>(&mut self, sink: &mut S) -> Result<TelemetryRecord>
    where
        S: TelemetrySink,
        S::Error: fmt::Display,
    {
        let (snapshot, record) = self.poll()?;
        if let Err(err) = sink.publish(&snapshot.serial_number, &record) {
            log::error!("Failed to publish telemetry of {}: {err}", snapshot.serial_number);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::*;
    use crate::protocol::Response;
    use crate::retry::Immediate;
    use chrono::TimeZone;

    fn snapshot() -> Snapshot {
        Snapshot {
            status: 0x0001,
            serial_number: "3NBAS1234567".to_string(),
            remaining_capacity_percent: 85,
            remaining_capacity: 10000,
            actual_capacity: 11136,
            factory_capacity: 12000,
            current: 2.5,
            voltage: 40.0,
            temperatures: vec![25, 26],
            cell_voltages: vec![3600, 3599],
        }
    }

    #[test]
    fn test_record_from_snapshot() {
        let timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let estimate = Estimate {
            drain_rate: Some(0.5),
            time_to_empty: Some(20000.0),
            window_len: 12,
        };
        let record = TelemetryRecord::new(&snapshot(), &estimate, timestamp);
        assert_eq!(record.power, 100.0);
        assert_eq!(record.remaining_capacity, 10000);
        assert_eq!(record.time_to_empty, Some(20000.0));
        assert_eq!(record.moving_avg_size, 12);
        assert_eq!(record.cell_voltages, vec![3600, 3599]);
    }

    #[cfg(feature = "protocol_serde")]
    #[test]
    fn test_record_json_omits_missing_estimate() {
        let timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let estimate = Estimate {
            drain_rate: None,
            time_to_empty: None,
            window_len: 0,
        };
        let record = TelemetryRecord::new(&snapshot(), &estimate, timestamp);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["remaining_capacity"], 10000);
        assert_eq!(json["power"], 100.0);
        assert_eq!(json["temperatures"], serde_json::json!([25, 26]));
        assert!(json.get("drain_rate").is_none());
        assert!(json.get("ttl").is_none());
    }

    struct VecSink(Vec<(String, TelemetryRecord)>);

    impl TelemetrySink for VecSink {
        type Error = String;

        fn publish(
            &mut self,
            device_id: &str,
            record: &TelemetryRecord,
        ) -> std::result::Result<(), Self::Error> {
            self.0.push((device_id.to_string(), record.clone()));
            Ok(())
        }
    }

    fn reply(parameter: u8, payload: &[u8]) -> Vec<u8> {
        Response {
            command: 0x01,
            parameter,
            payload: payload.to_vec(),
        }
        .encode()
    }

    fn cycle_replies(remaining_capacity: i16) -> Vec<u8> {
        [
            reply(0x30, &[0x00, 0x00]),
            reply(0x10, b"3NBAS1234567\0\0"),
            reply(0x32, &[0x55, 0x00]),
            reply(0x31, &remaining_capacity.to_le_bytes()),
            reply(0x19, &[0x80, 0x2b]),
            reply(0x18, &[0xe0, 0x2e]),
            reply(0x33, &[0xfa, 0x00]),
            reply(0x34, &[0xa0, 0x0f]),
            reply(0x35, &[0x2d, 0x2e]),
            reply(0x40, &[0x10, 0x0e]),
        ]
        .concat()
    }

    #[test]
    fn test_poller_publishes_complete_records() {
        let replies = [cycle_replies(10000), cycle_replies(9900)].concat();
        let connector = MockConnector::new(vec![Session::reading(vec![Step::Bytes(replies)])]);
        let mut client = BmuClient::with_connector(connector, Immediate);
        client.set_cells(1);
        let mut poller = Poller::new(client);
        let mut sink = VecSink(Vec::new());

        let first = poller.poll_into(&mut sink).unwrap();
        assert_eq!(first.moving_avg_size, 0);
        assert_eq!(first.drain_rate, None);
        let second = poller.poll_into(&mut sink).unwrap();
        assert_eq!(second.remaining_capacity, 9900);
        assert_eq!(second.moving_avg_size, 1);

        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[0].0, "3NBAS1234567");
        assert!((sink.0[1].1.power - 100.0).abs() < 1e-9);

        // the stream is exhausted, so the next cycle fails before publishing
        assert!(poller.poll_into(&mut sink).is_err());
        assert_eq!(sink.0.len(), 2);
    }
}
