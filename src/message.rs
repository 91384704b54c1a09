// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Typed decoding of GT06 payloads
//!
//! Every inbound frame is classified by protocol number into a handler
//! bucket and decoded into a [`Message`]. Decoders are missing-field-safe:
//! trailing optional blocks (LBS, status, language) are parsed only when
//! the payload is long enough to carry them.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::codec::Frame;
use crate::constant::{
    self, battery_percent, gsm_dbm, COORDINATE_SCALE, COURSE_MASK, FLAG_EXTERNAL_POWER,
    FLAG_GPS_FIXED, FLAG_IGNITION, FLAG_LATITUDE_NORTH, FLAG_LONGITUDE_WEST,
};
use crate::error::{Error, Result};

/// Canonical 15-digit device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Imei(String);

impl Imei {
    /// Decodes 8 packed BCD bytes. `0xF` nibbles are padding; a leading `0`
    /// is stripped when the decoded string is 16 digits.
    pub fn from_bcd(bytes: &[u8]) -> Result<Imei> {
        let mut digits = String::with_capacity(bytes.len() * 2);
        for &byte in bytes {
            for nibble in [byte >> 4, byte & 0x0F] {
                match nibble {
                    0x0F => continue,
                    0..=9 => digits.push((b'0' + nibble) as char),
                    other => {
                        return Err(Error::decode(format!(
                            "invalid BCD nibble {:#x} in IMEI",
                            other
                        )))
                    }
                }
            }
        }
        if digits.len() == 16 && digits.starts_with('0') {
            digits.remove(0);
        }
        Imei::parse(&digits)
    }

    pub fn parse(s: &str) -> Result<Imei> {
        if s.len() != 15 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::decode(format!("invalid IMEI {:?}", s)));
        }
        Ok(Imei(s.to_string()))
    }

    /// Packs back to the 8-byte wire form with the leading-zero pad digit.
    pub fn to_bcd(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        let padded: Vec<u8> = std::iter::once(b'0').chain(self.0.bytes()).collect();
        for (i, pair) in padded.chunks(2).enumerate() {
            out[i] = ((pair[0] - b'0') << 4) | (pair[1] - b'0');
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device family negotiated from the login device-type word. Resolves the
/// protocol numbers that mean different things on different hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Unknown,
    Wifi,
    Rfid,
    FourG,
    FourGStatus,
}

impl DeviceFamily {
    pub fn from_variant_tag(tag: &str) -> DeviceFamily {
        match tag {
            t if t.contains("RFID") => DeviceFamily::Rfid,
            t if t.contains("WIFI") => DeviceFamily::Wifi,
            t if t.contains("4G-STATUS") => DeviceFamily::FourGStatus,
            t if t.contains("4G") => DeviceFamily::FourG,
            _ => DeviceFamily::Unknown,
        }
    }
}

/// Handler bucket for one protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Login,
    Location,
    Status,
    Heartbeat,
    LbsCell,
    Wifi,
    CommandResponse,
    AddressRequest,
    AddressResponse,
    Alarm,
    Info,
    Unknown,
}

/// Protocol number to handler bucket. `0x17` and `0xA2` are overloaded
/// across device families; when the family is unknown the interpretation
/// with the longer expected payload wins.
pub fn classify(protocol: u8, family: DeviceFamily) -> MessageKind {
    match protocol {
        constant::MSG_LOGIN => MessageKind::Login,
        constant::MSG_GPS_LBS
        | constant::MSG_GPS_LBS_UTC
        | constant::MSG_GPS_PHONE
        | constant::MSG_GPS_EXTENDED_2
        | constant::MSG_GPS_4G => MessageKind::Location,
        constant::MSG_GPS_EXTENDED => match family {
            DeviceFamily::FourGStatus => MessageKind::Status,
            _ => MessageKind::Location,
        },
        constant::MSG_STATUS => MessageKind::Status,
        constant::MSG_HEARTBEAT => MessageKind::Heartbeat,
        constant::MSG_STRING_INFO | constant::MSG_COMMAND_RESPONSE | constant::MSG_TIME_REQUEST => {
            MessageKind::CommandResponse
        }
        constant::MSG_ALARM
        | constant::MSG_ALARM_UTC
        | constant::MSG_ALARM_UTC_2
        | constant::MSG_LBS_STATUS
        | constant::MSG_LBS_ALARM => MessageKind::Alarm,
        constant::MSG_LBS_EXTEND | constant::MSG_LBS_MULTIPLE | constant::MSG_LBS_ADDRESS => {
            MessageKind::LbsCell
        }
        constant::MSG_WIFI_OR_RFID => match family {
            DeviceFamily::Rfid => MessageKind::Info,
            _ => MessageKind::Wifi,
        },
        constant::MSG_WIFI => MessageKind::Wifi,
        constant::MSG_WIFI_4G => match family {
            DeviceFamily::FourGStatus => MessageKind::Status,
            _ => MessageKind::Wifi,
        },
        constant::MSG_ADDRESS_REQUEST => MessageKind::AddressRequest,
        constant::MSG_ADDRESS_RESPONSE => MessageKind::AddressResponse,
        constant::MSG_INFO_TRANSFER => MessageKind::Info,
        _ => MessageKind::Unknown,
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Login(Login),
    Location(Location),
    Status(Status),
    Heartbeat(Status),
    LbsCell(CellTower),
    Wifi(WifiScan),
    CommandResponse(StringInfo),
    AddressRequest(AddressRequest),
    AddressResponse(StringInfo),
    Alarm(Alarm),
    Info(Info),
    Unknown { protocol: u8, payload: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct Login {
    pub imei: Imei,
    pub device_type: Option<u16>,
    pub timezone: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub timestamp: DateTime<Utc>,
    pub satellites: u8,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: u8,
    /// degrees, 0-360
    pub course: u16,
    pub gps_valid: bool,
    pub ignition: Option<bool>,
    pub external_power: Option<bool>,
    /// meters, estimated when the wire format carries none
    pub accuracy: f64,
    pub cell: Option<CellTower>,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub terminal_info: u8,
    pub ignition: bool,
    pub charging: bool,
    pub gps_tracking: bool,
    pub oil_cut: bool,
    pub voltage_level: u8,
    pub battery_percent: u8,
    pub gsm_level: u8,
    pub gsm_dbm: i16,
    pub alarm: AlarmKind,
    pub language: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct CellTower {
    pub timestamp: Option<DateTime<Utc>>,
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u32,
    pub rssi: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct WifiScan {
    pub timestamp: Option<DateTime<Utc>>,
    pub access_points: Vec<WifiAccessPoint>,
    pub cell: Option<CellTower>,
}

#[derive(Debug, Clone)]
pub struct WifiAccessPoint {
    pub mac: [u8; 6],
    pub rssi: u8,
}

#[derive(Debug, Clone)]
pub struct StringInfo {
    pub server_flag: Option<u32>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct AddressRequest {
    pub location: Option<Location>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Alarm {
    pub location: Option<Location>,
    pub status: Option<Status>,
    pub kind: AlarmKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    Normal,
    Sos,
    PowerCut,
    Vibration,
    FenceIn,
    FenceOut,
    Speeding,
    Displacement,
    LowBattery,
    Other(u8),
}

impl AlarmKind {
    pub fn from_code(code: u8) -> AlarmKind {
        match code {
            0x00 => AlarmKind::Normal,
            0x01 => AlarmKind::Sos,
            0x02 => AlarmKind::PowerCut,
            0x03 => AlarmKind::Vibration,
            0x04 => AlarmKind::FenceIn,
            0x05 => AlarmKind::FenceOut,
            0x06 => AlarmKind::Speeding,
            0x09 => AlarmKind::Displacement,
            0x0E => AlarmKind::LowBattery,
            other => AlarmKind::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Info {
    pub sub_type: u8,
    pub content: InfoContent,
}

#[derive(Debug, Clone)]
pub enum InfoContent {
    /// External supply voltage in volts.
    ExternalVoltage(f64),
    StatusText(String),
    Iccid(String),
    Raw(Vec<u8>),
}

/// Decodes one validated frame into a typed message.
pub fn decode(frame: &Frame, family: DeviceFamily) -> Result<Message> {
    let payload = &frame.payload[..];
    match classify(frame.protocol, family) {
        MessageKind::Login => decode_login(payload).map(Message::Login),
        MessageKind::Location => decode_location(payload, frame.protocol).map(Message::Location),
        MessageKind::Status => decode_status(payload).map(Message::Status),
        MessageKind::Heartbeat => decode_status(payload).map(Message::Heartbeat),
        MessageKind::LbsCell => decode_lbs(payload).map(Message::LbsCell),
        MessageKind::Wifi => decode_wifi(payload).map(Message::Wifi),
        MessageKind::CommandResponse => {
            decode_string_info(payload, frame.protocol).map(Message::CommandResponse)
        }
        MessageKind::AddressRequest => {
            decode_address_request(payload, frame.protocol).map(Message::AddressRequest)
        }
        MessageKind::AddressResponse => {
            decode_string_info(payload, frame.protocol).map(Message::AddressResponse)
        }
        MessageKind::Alarm => decode_alarm(payload, frame.protocol).map(Message::Alarm),
        MessageKind::Info => decode_info(payload).map(Message::Info),
        MessageKind::Unknown => Ok(Message::Unknown {
            protocol: frame.protocol,
            payload: payload.to_vec(),
        }),
    }
}

fn decode_login(payload: &[u8]) -> Result<Login> {
    if payload.len() < 8 {
        return Err(Error::decode(format!(
            "login payload {} bytes, need 8",
            payload.len()
        )));
    }
    let imei = Imei::from_bcd(&payload[..8])?;
    let device_type = if payload.len() >= 10 {
        Some(BigEndian::read_u16(&payload[8..10]))
    } else {
        None
    };
    let timezone = if payload.len() >= 12 {
        Some(BigEndian::read_u16(&payload[10..12]))
    } else {
        None
    };
    Ok(Login {
        imei,
        device_type,
        timezone,
    })
}

/// `YY MM DD HH MM SS`, century split at 50.
fn decode_datetime(raw: &[u8]) -> Result<DateTime<Utc>> {
    let year = if raw[0] < 50 {
        2000 + raw[0] as i32
    } else {
        1900 + raw[0] as i32
    };
    Utc.with_ymd_and_hms(
        year,
        raw[1] as u32,
        raw[2] as u32,
        raw[3] as u32,
        raw[4] as u32,
        raw[5] as u32,
    )
    .single()
    .ok_or_else(|| Error::decode(format!("invalid datetime {:02x?}", raw)))
}

/// Protocols whose course-status word carries ignition and external power.
fn carries_power_bits(protocol: u8) -> bool {
    matches!(
        protocol,
        constant::MSG_GPS_EXTENDED | constant::MSG_GPS_EXTENDED_2 | constant::MSG_GPS_4G
    )
}

/// The fixed 18-byte GPS block shared by the location and alarm families.
fn decode_gps_block(payload: &[u8], protocol: u8) -> Result<Location> {
    if payload.len() < 18 {
        return Err(Error::decode(format!(
            "gps block {} bytes, need 18",
            payload.len()
        )));
    }
    let timestamp = decode_datetime(&payload[..6])?;
    let satellites = payload[6] & 0x0F;
    let lat_raw = BigEndian::read_u32(&payload[7..11]);
    let lon_raw = BigEndian::read_u32(&payload[11..15]);
    let speed = payload[15];
    let course_status = BigEndian::read_u16(&payload[16..18]);

    let mut latitude = lat_raw as f64 / COORDINATE_SCALE;
    if course_status & FLAG_LATITUDE_NORTH == 0 {
        latitude = -latitude;
    }
    let mut longitude = lon_raw as f64 / COORDINATE_SCALE;
    if course_status & FLAG_LONGITUDE_WEST != 0 {
        longitude = -longitude;
    }

    // 0,0 means the receiver has no fix yet regardless of the fixed bit
    let gps_valid = course_status & FLAG_GPS_FIXED != 0 && (latitude != 0.0 || longitude != 0.0);

    let accuracy = if satellites > 0 {
        (15.0 - satellites as f64).max(3.0)
    } else {
        50.0
    };

    let (ignition, external_power) = if carries_power_bits(protocol) {
        (
            Some(course_status & FLAG_IGNITION != 0),
            Some(course_status & FLAG_EXTERNAL_POWER != 0),
        )
    } else {
        (None, None)
    };

    Ok(Location {
        timestamp,
        satellites,
        latitude,
        longitude,
        speed,
        course: course_status & COURSE_MASK,
        gps_valid,
        ignition,
        external_power,
        accuracy,
        cell: None,
    })
}

fn decode_location(payload: &[u8], protocol: u8) -> Result<Location> {
    let mut location = decode_gps_block(payload, protocol)?;
    let rest = &payload[18..];
    if rest.len() >= 8 {
        location.cell = decode_cell(&rest[..8]).ok();
    }
    Ok(location)
}

/// `MCC(2) MNC(1) LAC(2) CID(3)`
fn decode_cell(bytes: &[u8]) -> Result<CellTower> {
    if bytes.len() < 8 {
        return Err(Error::decode(format!(
            "cell block {} bytes, need 8",
            bytes.len()
        )));
    }
    Ok(CellTower {
        timestamp: None,
        mcc: BigEndian::read_u16(&bytes[..2]),
        mnc: bytes[2],
        lac: BigEndian::read_u16(&bytes[3..5]),
        cell_id: BigEndian::read_u24(&bytes[5..8]),
        rssi: None,
    })
}

fn decode_status(payload: &[u8]) -> Result<Status> {
    if payload.len() < 3 {
        return Err(Error::decode(format!(
            "status payload {} bytes, need 3",
            payload.len()
        )));
    }
    let terminal_info = payload[0];
    let voltage_level = payload[1];
    let gsm_level = payload[2];
    let alarm = payload
        .get(3)
        .copied()
        .map(AlarmKind::from_code)
        .unwrap_or(AlarmKind::Normal);
    Ok(Status {
        terminal_info,
        ignition: terminal_info & constant::TERMINAL_IGNITION != 0,
        charging: terminal_info & constant::TERMINAL_CHARGING != 0,
        gps_tracking: terminal_info & constant::TERMINAL_GPS_TRACKING != 0,
        oil_cut: terminal_info & constant::TERMINAL_OIL_CUT != 0,
        voltage_level,
        battery_percent: battery_percent(voltage_level),
        gsm_level,
        gsm_dbm: gsm_dbm(gsm_level),
        alarm,
        language: payload.get(4).copied(),
    })
}

fn decode_lbs(payload: &[u8]) -> Result<CellTower> {
    if payload.len() >= 14 {
        let timestamp = decode_datetime(&payload[..6]).ok();
        let mut cell = decode_cell(&payload[6..14])?;
        cell.timestamp = timestamp;
        cell.rssi = payload.get(14).copied();
        return Ok(cell);
    }
    decode_cell(payload)
}

fn decode_wifi(payload: &[u8]) -> Result<WifiScan> {
    if payload.len() < 7 {
        return Err(Error::decode(format!(
            "wifi payload {} bytes, need 7",
            payload.len()
        )));
    }
    let timestamp = decode_datetime(&payload[..6]).ok();
    let count = payload[6] as usize;
    let mut access_points = Vec::with_capacity(count);
    let mut at = 7;
    for _ in 0..count {
        if payload.len() < at + 7 {
            break;
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&payload[at..at + 6]);
        access_points.push(WifiAccessPoint {
            mac,
            rssi: payload[at + 6],
        });
        at += 7;
    }
    let cell = if payload.len() >= at + 8 {
        decode_cell(&payload[at..at + 8]).ok()
    } else {
        None
    };
    Ok(WifiScan {
        timestamp,
        access_points,
        cell,
    })
}

fn ascii_content(bytes: &[u8]) -> String {
    // trackers pad with NUL and occasionally trail a language word
    let trimmed: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| b.is_ascii() && *b != 0)
        .collect();
    String::from_utf8_lossy(&trimmed).trim().to_string()
}

fn decode_string_info(payload: &[u8], protocol: u8) -> Result<StringInfo> {
    let (server_flag, mut content_bytes) = match protocol {
        constant::MSG_STRING_INFO => {
            // length(1) | server_flag(4) | ascii | language(2)
            if payload.len() < 5 {
                return Err(Error::decode("string info too short".to_string()));
            }
            (
                Some(BigEndian::read_u32(&payload[1..5])),
                &payload[5..],
            )
        }
        constant::MSG_COMMAND_RESPONSE => {
            // server_flag(4) | ascii | language(2)
            if payload.len() < 4 {
                return Err(Error::decode("command response too short".to_string()));
            }
            (Some(BigEndian::read_u32(&payload[..4])), &payload[4..])
        }
        _ => (None, payload),
    };
    // strip a trailing language word when present
    if content_bytes.len() >= 2 {
        let tail = &content_bytes[content_bytes.len() - 2..];
        if tail == [0x00, 0x01] || tail == [0x00, 0x02] {
            content_bytes = &content_bytes[..content_bytes.len() - 2];
        }
    }
    Ok(StringInfo {
        server_flag,
        content: ascii_content(content_bytes),
    })
}

fn decode_address_request(payload: &[u8], protocol: u8) -> Result<AddressRequest> {
    let location = decode_gps_block(payload, protocol).ok();
    let phone = if payload.len() > 18 {
        let digits = ascii_content(&payload[18..]);
        if digits.is_empty() {
            None
        } else {
            Some(digits)
        }
    } else {
        None
    };
    Ok(AddressRequest { location, phone })
}

fn decode_alarm(payload: &[u8], protocol: u8) -> Result<Alarm> {
    let gps_first = matches!(
        protocol,
        constant::MSG_ALARM | constant::MSG_ALARM_UTC | constant::MSG_ALARM_UTC_2
    );

    let (location, mut cell, status_at) = if gps_first {
        let location = decode_gps_block(payload, protocol).ok();
        // length-prefixed LBS block follows the GPS block
        let cell = if payload.len() >= 27 {
            decode_cell(&payload[19..27]).ok()
        } else {
            None
        };
        (location, cell, 27)
    } else {
        let cell = if payload.len() >= 8 {
            decode_cell(&payload[..8]).ok()
        } else {
            None
        };
        (None, cell, 8)
    };

    let status = if payload.len() >= status_at + 5 {
        decode_status(&payload[status_at..]).ok()
    } else {
        None
    };
    let kind = status.as_ref().map(|s| s.alarm).unwrap_or(AlarmKind::Normal);

    let location = location.map(|mut l| {
        l.cell = cell.take();
        l
    });

    Ok(Alarm {
        location,
        status,
        kind,
    })
}

fn decode_info(payload: &[u8]) -> Result<Info> {
    if payload.is_empty() {
        return Err(Error::decode("empty info transfer".to_string()));
    }
    let sub_type = payload[0];
    let body = &payload[1..];
    let content = match sub_type {
        constant::INFO_EXTERNAL_VOLTAGE if body.len() >= 2 => {
            InfoContent::ExternalVoltage(BigEndian::read_u16(&body[..2]) as f64 / 100.0)
        }
        constant::INFO_TERMINAL_STATUS => InfoContent::StatusText(ascii_content(body)),
        constant::INFO_ICCID if body.len() >= 10 => {
            let mut digits = String::with_capacity(20);
            for &byte in &body[..10] {
                for nibble in [byte >> 4, byte & 0x0F] {
                    if nibble <= 9 {
                        digits.push((b'0' + nibble) as char);
                    }
                }
            }
            InfoContent::Iccid(digits)
        }
        _ => InfoContent::Raw(body.to_vec()),
    };
    Ok(Info { sub_type, content })
}
