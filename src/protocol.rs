use crate::Error;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

const MAGIC: [u8; 2] = [0x5a, 0xa5];
const PROTOCOL_BYTES: [u8; 2] = [0x20, 0x22];

/// Header (magic, length, protocol bytes, command, parameter) plus checksum.
pub const FRAME_OVERHEAD: usize = 9;
/// Offset of the payload length byte.
pub const LENGTH_INDEX: usize = 2;
const PAYLOAD_INDEX: usize = 7;

// Raw temperatures are sent with an offset of 20 to keep them positive
const TEMPERATURE_OFFSET: i32 = 20;

/// Address of the first cell voltage register.
pub const CELL_VOLTAGES_ADDRESS: u8 = 0x40;
/// Most cells one request can cover; the reply length is a single byte.
pub const MAX_CELLS: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ReadRegister = 0x01,
}

/// Registers with a fixed address and reply size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    SerialNumber = 0x10,
    FactoryCapacity = 0x18,
    ActualCapacity = 0x19,
    Status = 0x30,
    RemainingCapacity = 0x31,
    RemainingCapacityPercent = 0x32,
    Current = 0x33,
    Voltage = 0x34,
    Temperature = 0x35,
}

impl Register {
    pub fn address(self) -> u8 {
        self as u8
    }

    /// Number of bytes the BMU returns for this register.
    pub fn reply_len(self) -> u8 {
        match self {
            Register::SerialNumber => 0x0e,
            _ => 0x02,
        }
    }

    pub fn request(self) -> Vec<u8> {
        encode_request(self.address(), self.reply_len())
    }
}

/// Computes the frame checksum over `part`, which must span from the length
/// byte through the end of the payload.
pub fn checksum(part: &[u8]) -> [u8; 2] {
    let mut sum: u16 = 0xffff;
    for b in part {
        sum = sum.wrapping_sub(*b as u16);
    }
    sum.to_le_bytes()
}

fn encode_frame(command: Command, parameter: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(
        payload.len() <= u8::MAX as usize,
        "payload of {} bytes does not fit the length byte",
        payload.len()
    );
    let mut tx_buffer = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    tx_buffer.extend_from_slice(&MAGIC);
    tx_buffer.push(payload.len() as u8);
    tx_buffer.extend_from_slice(&PROTOCOL_BYTES);
    tx_buffer.push(command as u8);
    tx_buffer.push(parameter);
    tx_buffer.extend_from_slice(payload);
    let ck = checksum(&tx_buffer[LENGTH_INDEX..]);
    tx_buffer.extend_from_slice(&ck);
    tx_buffer
}

/// Builds a read-register request. The single payload byte tells the BMU how
/// many bytes to return.
pub fn encode_request(register: u8, requested_len: u8) -> Vec<u8> {
    encode_frame(Command::ReadRegister, register, &[requested_len])
}

/// Request for the voltages of `n_cells` cells, two bytes each. Counts above
/// [`MAX_CELLS`] are capped.
pub fn cell_voltages_request(n_cells: u8) -> Vec<u8> {
    encode_request(CELL_VOLTAGES_ADDRESS, n_cells.min(MAX_CELLS) * 2)
}

/// Which frame check failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short - length={0}")]
    TooShort(usize),
    #[error("wrong magic bytes {0:02X?}")]
    BadMagic([u8; 2]),
    #[error("wrong payload length byte - declared={declared} actual={actual}")]
    LengthMismatch { declared: u8, actual: usize },
    #[error("wrong checksum - calculated={calculated:02X?} received={received:02X?}")]
    Checksum {
        calculated: [u8; 2],
        received: [u8; 2],
    },
}

impl DecodeError {
    /// A checksum mismatch is a corrupted transfer; anything else means the
    /// stream is out of sync with the protocol.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecodeError::Checksum { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: u8,
    pub parameter: u8,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn decode(rx_buffer: &[u8]) -> std::result::Result<Self, DecodeError> {
        let len = rx_buffer.len();
        if len < FRAME_OVERHEAD {
            return Err(DecodeError::TooShort(len));
        }
        if rx_buffer[..2] != MAGIC {
            return Err(DecodeError::BadMagic([rx_buffer[0], rx_buffer[1]]));
        }
        let declared = rx_buffer[LENGTH_INDEX];
        if declared as usize != len - FRAME_OVERHEAD {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: len - FRAME_OVERHEAD,
            });
        }
        let calculated = checksum(&rx_buffer[LENGTH_INDEX..len - 2]);
        let received = [rx_buffer[len - 2], rx_buffer[len - 1]];
        if calculated != received {
            log::warn!(
                "Invalid checksum - calculated={calculated:02X?} received={received:02X?} buffer={rx_buffer:02X?}"
            );
            return Err(DecodeError::Checksum {
                calculated,
                received,
            });
        }
        Ok(Self {
            command: rx_buffer[5],
            parameter: rx_buffer[6],
            payload: rx_buffer[PAYLOAD_INDEX..len - 2].to_vec(),
        })
    }

    /// Encodes a response frame, as the BMU would send it. The payload must
    /// not exceed 255 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut tx_buffer = encode_frame(Command::ReadRegister, self.parameter, &self.payload);
        tx_buffer[5] = self.command;
        let len = tx_buffer.len();
        let ck = checksum(&tx_buffer[LENGTH_INDEX..len - 2]);
        tx_buffer[len - 2..].copy_from_slice(&ck);
        tx_buffer
    }
}

fn validate_len(register: u8, payload: &[u8], expected: usize) -> std::result::Result<(), Error> {
    if payload.len() != expected {
        log::warn!(
            "Invalid payload size - register={register:#04X} expected={expected} received={}",
            payload.len()
        );
        return Err(Error::PayloadSize {
            register,
            expected,
            received: payload.len(),
        });
    }
    Ok(())
}

/// Little-endian signed 16 bit register value.
pub fn decode_i16(register: u8, payload: &[u8]) -> std::result::Result<i16, Error> {
    validate_len(register, payload, 2)?;
    Ok(i16::from_le_bytes([payload[0], payload[1]]))
}

/// Current and voltage: the raw value is in units of 10 mA / 10 mV.
pub fn decode_scaled(register: u8, payload: &[u8]) -> std::result::Result<f64, Error> {
    Ok(decode_i16(register, payload)? as f64 * 10.0 / 1000.0)
}

/// One temperature in °C per zone byte.
pub fn decode_temperatures(payload: &[u8]) -> Vec<i32> {
    payload
        .iter()
        .map(|b| *b as i32 - TEMPERATURE_OFFSET)
        .collect()
}

pub fn decode_serial_number(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

/// Cell voltages in mV, one little-endian pair per cell. Counts above
/// [`MAX_CELLS`] are capped, matching [`cell_voltages_request`].
pub fn decode_cell_voltages(payload: &[u8], n_cells: u8) -> std::result::Result<Vec<i16>, Error> {
    validate_len(CELL_VOLTAGES_ADDRESS, payload, n_cells.min(MAX_CELLS) as usize * 2)?;
    let result = payload
        .chunks_exact(2)
        .enumerate()
        .map(|(n_cell, pair)| {
            let millivolts = i16::from_le_bytes([pair[0], pair[1]]);
            log::trace!("Cell #{} mV={}", n_cell + 1, millivolts);
            millivolts
        })
        .collect();
    Ok(result)
}

/// One polling cycle worth of register values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Snapshot {
    pub status: u16,
    pub serial_number: String,
    pub remaining_capacity_percent: i16,
    /// mAh
    pub remaining_capacity: i16,
    /// mAh
    pub actual_capacity: i16,
    /// mAh
    pub factory_capacity: i16,
    /// A, negative while charging
    pub current: f64,
    /// V
    pub voltage: f64,
    /// °C per zone
    pub temperatures: Vec<i32>,
    /// mV per cell
    pub cell_voltages: Vec<i16>,
}

impl Snapshot {
    /// W
    pub fn power(&self) -> f64 {
        self.current * self.voltage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_frame() -> Vec<u8> {
        Response {
            command: 0x01,
            parameter: 0x31,
            payload: vec![0x10, 0x27],
        }
        .encode()
    }

    #[test]
    fn test_encode_status_request() {
        assert_eq!(
            Register::Status.request(),
            vec![0x5a, 0xa5, 0x01, 0x20, 0x22, 0x01, 0x30, 0x02, 0x89, 0xff]
        );
    }

    #[test]
    fn test_encode_serial_number_request() {
        let req = Register::SerialNumber.request();
        assert_eq!(&req[..8], &[0x5a, 0xa5, 0x01, 0x20, 0x22, 0x01, 0x10, 0x0e]);
        // 0xffff - (0x01 + 0x20 + 0x22 + 0x01 + 0x10 + 0x0e)
        assert_eq!(&req[8..], &[0x9d, 0xff]);
    }

    #[test]
    fn test_cell_voltages_request() {
        let req = cell_voltages_request(10);
        assert_eq!(req[6], CELL_VOLTAGES_ADDRESS);
        assert_eq!(req[7], 20);
    }

    #[test]
    fn test_cell_count_is_capped() {
        let req = cell_voltages_request(200);
        assert_eq!(req[7], 254);
        let cells = decode_cell_voltages(&[0u8; 254], 200).unwrap();
        assert_eq!(cells.len(), MAX_CELLS as usize);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit the length byte")]
    fn test_encode_oversized_payload() {
        Response {
            command: 0x01,
            parameter: 0x10,
            payload: vec![0; 256],
        }
        .encode();
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[]), [0xff, 0xff]);
        // 300 * 0xff = 0x12b0c, larger than 0xffff
        let part = vec![0xff; 300];
        let expected = 0xffffu32.wrapping_sub(300 * 0xff) as u16;
        assert_eq!(checksum(&part), expected.to_le_bytes());
    }

    #[test]
    fn test_decode_response() {
        let response = Response::decode(&valid_frame()).unwrap();
        assert_eq!(response.command, 0x01);
        assert_eq!(response.parameter, 0x31);
        assert_eq!(response.payload, vec![0x10, 0x27]);
    }

    #[test]
    fn test_decode_empty_payload() {
        let frame = Response {
            command: 0x01,
            parameter: 0x30,
            payload: vec![],
        }
        .encode();
        assert_eq!(frame.len(), FRAME_OVERHEAD);
        assert!(Response::decode(&frame).unwrap().payload.is_empty());
    }

    #[test]
    fn test_decode_max_payload() {
        let payload: Vec<u8> = (0..=254).collect();
        let frame = Response {
            command: 0x01,
            parameter: 0x10,
            payload: payload.clone(),
        }
        .encode();
        let response = Response::decode(&frame).unwrap();
        assert_eq!(response.parameter, 0x10);
        assert_eq!(response.payload, payload);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            Response::decode(&[0x5a, 0xa5, 0x00]),
            Err(DecodeError::TooShort(3))
        );
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut frame = valid_frame();
        frame[0] = 0x55;
        let err = Response::decode(&frame).unwrap_err();
        assert_eq!(err, DecodeError::BadMagic([0x55, 0xa5]));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_length_mismatch_with_valid_checksum() {
        let mut frame = valid_frame();
        frame[LENGTH_INDEX] = 0x03;
        let len = frame.len();
        let ck = checksum(&frame[LENGTH_INDEX..len - 2]);
        frame[len - 2..].copy_from_slice(&ck);
        let err = Response::decode(&frame).unwrap_err();
        assert_eq!(
            err,
            DecodeError::LengthMismatch {
                declared: 3,
                actual: 2
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_single_bit_flip_is_checksum_error() {
        let frame = valid_frame();
        // the length byte is covered by the length check, flip everything else
        for index in (LENGTH_INDEX + 1)..frame.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                let err = Response::decode(&corrupted).unwrap_err();
                assert!(
                    err.is_retryable(),
                    "byte {index} bit {bit} gave {err:?}"
                );
            }
        }
    }

    #[test]
    fn test_decode_values() {
        assert_eq!(decode_i16(0x31, &[0x10, 0x27]).unwrap(), 10000);
        assert_eq!(decode_i16(0x33, &[0xff, 0xff]).unwrap(), -1);
        assert!((decode_scaled(0x34, &[0x1c, 0x0f]).unwrap() - 38.68).abs() < 1e-9);
        assert!((decode_scaled(0x33, &[0x9c, 0xff]).unwrap() + 1.0).abs() < 1e-9);
        assert_eq!(decode_temperatures(&[0x2d, 0x14]), vec![25, 0]);
        assert_eq!(decode_serial_number(b"3NBAS1234567\0\0"), "3NBAS1234567");
    }

    #[test]
    fn test_decode_wrong_payload_size() {
        assert!(matches!(
            decode_i16(0x31, &[0x10]),
            Err(Error::PayloadSize {
                register: 0x31,
                expected: 2,
                received: 1
            })
        ));
    }

    #[test]
    fn test_decode_cell_voltages() {
        let cells = decode_cell_voltages(&[0x10, 0x0e, 0x0f, 0x0e], 2).unwrap();
        assert_eq!(cells, vec![3600, 3599]);
        assert!(decode_cell_voltages(&[0x10, 0x0e], 2).is_err());
    }
}
