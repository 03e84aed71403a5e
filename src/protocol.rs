use arrayvec::ArrayString;
use core::fmt;
use core::str::FromStr;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::subsystems::Joint;

pub const MAX_COMMAND_SIZE: usize = 64;
pub const MAX_POSE_NAME: usize = 16;

/// Legacy advertising PDUs carry at most 31 bytes of AD structures.
pub const MAX_ADV_DATA: usize = 31;
pub const MAX_DEVICE_NAME: usize = MAX_ADV_DATA - 2;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
// LE General Discoverable | BR/EDR not supported
const AD_FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// Raw text of one write to the command characteristic.
pub type CommandToken = ArrayString<MAX_COMMAND_SIZE>;
pub type PoseName = ArrayString<MAX_POSE_NAME>;
pub type AdvData = Vec<u8, MAX_ADV_DATA>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    Forward,
    Reverse,
    Left,
    Right,
    Stop,
}

impl Directive {
    /// Matches an upper-cased movement keyword, including the Portuguese aliases.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "FORWARD" | "FRENTE" => Some(Self::Forward),
            "REVERSE" | "TRAS" => Some(Self::Reverse),
            "LEFT" | "ESQUERDA" => Some(Self::Left),
            "RIGHT" | "DIREITA" => Some(Self::Right),
            "STOP" | "PARAR" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Drive(Directive),
    Joint { joint: Joint, angle: i32 },
    Pose(PoseName),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("command exceeds {} bytes", MAX_COMMAND_SIZE)]
    TooLong,
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("unknown joint `{0}`")]
    UnknownJoint(String),
    #[error("invalid angle `{0}`")]
    InvalidAngle(String),
    #[error("invalid pose name `{0}`")]
    InvalidPose(String),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CommandError::Empty);
        }

        let mut token = CommandToken::new();
        for ch in trimmed.chars() {
            token
                .try_push(ch.to_ascii_uppercase())
                .map_err(|_| CommandError::TooLong)?;
        }

        if let Some(directive) = Directive::from_keyword(&token) {
            return Ok(Self::Drive(directive));
        }

        if let Some((id, value)) = token.split_once(':') {
            let joint = parse_joint_id(id.trim())
                .ok_or_else(|| CommandError::UnknownJoint(id.to_string()))?;
            let angle = value
                .trim()
                .parse::<i32>()
                .map_err(|_| CommandError::InvalidAngle(value.to_string()))?;
            return Ok(Self::Joint { joint, angle });
        }

        if let Some(name) = token.strip_prefix("POSE_") {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(CommandError::InvalidPose(name.to_string()));
            }
            let name = PoseName::from(name).map_err(|_| CommandError::InvalidPose(name.to_string()))?;
            return Ok(Self::Pose(name));
        }

        Err(CommandError::Unknown(token.to_string()))
    }
}

/// Accepts `JOINT_<NAME>` and the legacy `SERVO_<LETTER>` identifiers.
fn parse_joint_id(id: &str) -> Option<Joint> {
    if let Some(name) = id.strip_prefix("JOINT_") {
        return Joint::from_name(name);
    }
    match id.strip_prefix("SERVO_")? {
        "A" => Some(Joint::Base),
        "B" => Some(Joint::Elbow),
        "C" => Some(Joint::Wrist),
        "D" => Some(Joint::Gripper),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("command is not valid UTF-8")]
    InvalidUtf8,
    #[error("message exceeds buffer size")]
    MessageTooLarge,
    #[error("invalid 128-bit UUID `{0}`")]
    InvalidUuid(String),
    #[error("device name is {len} bytes, scan response allows {}", MAX_DEVICE_NAME)]
    NameTooLong { len: usize },
}

/// Decodes the bytes of a characteristic write into a queueable token.
///
/// # Errors
///
/// [`ProtocolError::InvalidUtf8`] or [`ProtocolError::MessageTooLarge`]; the
/// write is dropped either way.
pub fn decode_command(bytes: &[u8]) -> Result<CommandToken, ProtocolError> {
    let text = core::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    CommandToken::from(text).map_err(|_| ProtocolError::MessageTooLarge)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid128(u128);

impl Uuid128 {
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Byte order used on air (least significant byte first).
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
}

impl FromStr for Uuid128 {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digits = ArrayString::<32>::new();
        for ch in s.trim().chars().filter(|c| *c != '-') {
            if !ch.is_ascii_hexdigit() || digits.try_push(ch).is_err() {
                return Err(ProtocolError::InvalidUuid(s.to_string()));
            }
        }
        if digits.len() != 32 {
            return Err(ProtocolError::InvalidUuid(s.to_string()));
        }
        u128::from_str_radix(&digits, 16)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidUuid(s.to_string()))
    }
}

impl fmt::Display for Uuid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

/// Advertising data and scan response, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingPayload {
    adv_data: AdvData,
    scan_response: AdvData,
}

impl AdvertisingPayload {
    /// # Errors
    ///
    /// [`ProtocolError::NameTooLong`] when the name does not fit the scan response.
    pub fn build(name: &str, service: Uuid128) -> Result<Self, ProtocolError> {
        let name_bytes = name.as_bytes();
        if name_bytes.len() > MAX_DEVICE_NAME {
            return Err(ProtocolError::NameTooLong {
                len: name_bytes.len(),
            });
        }

        let mut adv_data = AdvData::new();
        let mut scan_response = AdvData::new();

        // flags (3 bytes) + 128-bit service UUID (18 bytes) always fits in 31
        push_record(&mut adv_data, AD_TYPE_FLAGS, &[AD_FLAGS_GENERAL_DISCOVERABLE])?;
        push_record(&mut adv_data, AD_TYPE_UUID128_COMPLETE, &service.to_le_bytes())?;
        push_record(&mut scan_response, AD_TYPE_COMPLETE_LOCAL_NAME, name_bytes)?;

        Ok(Self {
            adv_data,
            scan_response,
        })
    }

    #[must_use]
    pub fn adv_data(&self) -> &[u8] {
        &self.adv_data
    }

    #[must_use]
    pub fn scan_response(&self) -> &[u8] {
        &self.scan_response
    }
}

fn push_record(buffer: &mut AdvData, ad_type: u8, data: &[u8]) -> Result<(), ProtocolError> {
    let length = u8::try_from(data.len() + 1).map_err(|_| ProtocolError::MessageTooLarge)?;
    buffer
        .push(length)
        .and_then(|()| buffer.push(ad_type))
        .map_err(|_| ProtocolError::MessageTooLarge)?;
    buffer
        .extend_from_slice(data)
        .map_err(|()| ProtocolError::MessageTooLarge)
}
