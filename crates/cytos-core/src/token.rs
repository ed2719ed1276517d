//! Tokens and the fixed token-memory contract.
//!
//! A token is a mobile packet of energy plus a fixed-length byte memory.
//! Byte `[0]` is the token's branch number; the constructor's command block
//! occupies bytes `[1]` through `[8]`, followed by the length-prefixed
//! static and mutable function payloads. Byte `[1]` is an in/out field: the
//! construction action on entry, the result code on exit — the code values
//! are chosen so that `DO_NOTHING` leaves the memory bit-identical.

use serde::{Deserialize, Serialize};

/// Byte offset of the branch number in every token memory.
pub const BRANCH_NUMBER: usize = 0;

/// Byte offsets of the constructor command block.
pub mod constr {
    /// Construction action on entry ([`super::ConstructionAction`]).
    pub const IN: usize = 1;
    /// Result code on exit ([`super::ConstructionResult`]); shares the byte
    /// with [`IN`].
    pub const OUT: usize = 1;
    /// Post-construction behavior ([`super::ConstructionOption`]).
    pub const IN_OPTION: usize = 2;
    /// Placement angle, encoded via [`super::encode_angle`].
    pub const INOUT_ANGLE: usize = 3;
    /// Placement distance, encoded via [`super::encode_distance`].
    pub const IN_DIST: usize = 4;
    /// Max connections of the offspring; 0 selects an automatic limit.
    pub const IN_CELL_MAX_CONNECTIONS: usize = 5;
    /// Branch number assigned to the offspring.
    pub const IN_CELL_BRANCH_NO: usize = 6;
    /// Function discriminant of the offspring.
    pub const IN_CELL_FUNCTION: usize = 7;
    /// Start of the length-prefixed static payload, followed by the
    /// length-prefixed mutable payload.
    pub const DATA: usize = 8;
}

/// Byte offsets read and written by the scanner function.
pub mod scanner {
    pub const OUT_ENERGY: usize = 1;
    pub const OUT_CONNECTIONS: usize = 2;
    pub const OUT_MAX_CONNECTIONS: usize = 3;
    pub const OUT_FUNCTION: usize = 4;
    pub const OUT_CLUSTER_SIZE: usize = 5;
}

/// Byte offsets read and written by the sensor function.
pub mod sensor {
    pub const OUT_DETECTED: usize = 1;
    pub const OUT_ANGLE: usize = 2;
    pub const OUT_DISTANCE: usize = 3;
}

/// Byte offsets read and written by the communicator function.
pub mod communicator {
    pub const IN_MESSAGE: usize = 1;
    pub const OUT_RECEIVED: usize = 2;
}

/// Construction action requested through `constr::IN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionAction {
    DoNothing,
    Safe,
    Unsafe,
    Bruteforce,
}

impl ConstructionAction {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Safe,
            2 => Self::Unsafe,
            3 => Self::Bruteforce,
            _ => Self::DoNothing,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::DoNothing => 0,
            Self::Safe => 1,
            Self::Unsafe => 2,
            Self::Bruteforce => 3,
        }
    }
}

/// Result code written to `constr::OUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionResult {
    Success,
    NoEnergy,
    Obstacle,
    Connection,
    Distance,
}

impl ConstructionResult {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::NoEnergy => 1,
            Self::Obstacle => 2,
            Self::Connection => 3,
            Self::Distance => 4,
        }
    }
}

/// Post-construction behavior requested through `constr::IN_OPTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionOption {
    Standard,
    CreateEmptyToken,
    CreateDupToken,
    FinishNoSep,
    FinishWithSep,
    FinishWithSepRed,
    FinishWithTokenSepRed,
}

impl ConstructionOption {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::CreateEmptyToken,
            2 => Self::CreateDupToken,
            3 => Self::FinishNoSep,
            4 => Self::FinishWithSep,
            5 => Self::FinishWithSepRed,
            6 => Self::FinishWithTokenSepRed,
            _ => Self::Standard,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Standard => 0,
            Self::CreateEmptyToken => 1,
            Self::CreateDupToken => 2,
            Self::FinishNoSep => 3,
            Self::FinishWithSep => 4,
            Self::FinishWithSepRed => 5,
            Self::FinishWithTokenSepRed => 6,
        }
    }

    /// The offspring is disconnected and placed at twice the distance.
    #[must_use]
    pub fn separates(self) -> bool {
        matches!(
            self,
            Self::FinishWithSep | Self::FinishWithSepRed | Self::FinishWithTokenSepRed
        )
    }

    /// The offspring starts unblocked.
    #[must_use]
    pub fn finishes(self) -> bool {
        matches!(
            self,
            Self::FinishNoSep
                | Self::FinishWithSep
                | Self::FinishWithSepRed
                | Self::FinishWithTokenSepRed
        )
    }

    /// A token is spawned on the offspring.
    #[must_use]
    pub fn spawns_token(self) -> bool {
        matches!(
            self,
            Self::CreateEmptyToken | Self::CreateDupToken | Self::FinishWithTokenSepRed
        )
    }

    /// The spawned token duplicates the command token's memory.
    #[must_use]
    pub fn duplicates_memory(self) -> bool {
        self == Self::CreateDupToken
    }

    /// The offspring's max-connections is reduced by one.
    #[must_use]
    pub fn reduces_connections(self) -> bool {
        matches!(self, Self::FinishWithSepRed | Self::FinishWithTokenSepRed)
    }
}

/// Encode an angle in degrees as a signed fixed-point byte (128 = 180°).
///
/// Values outside `(-180, 180]` encode to 0.
#[must_use]
pub fn encode_angle(angle: f64) -> u8 {
    if !(angle > -180.0 && angle <= 180.0) {
        return 0;
    }
    let scaled = (angle * 128.0 / 180.0).round() as i16;
    (scaled.clamp(-128, 127) as i8) as u8
}

/// Decode a signed fixed-point byte back to degrees.
#[must_use]
pub fn decode_angle(byte: u8) -> f64 {
    f64::from(byte as i8) * 180.0 / 128.0
}

/// Encode a distance as an unsigned fixed-point byte (16 units per world
/// unit). Values outside the representable range encode to 0.
#[must_use]
pub fn encode_distance(distance: f64) -> u8 {
    if !(0.0..=255.0 / 16.0).contains(&distance) {
        return 0;
    }
    (distance * 16.0).round() as u8
}

/// Decode an unsigned fixed-point byte back to a distance.
#[must_use]
pub fn decode_distance(byte: u8) -> f64 {
    f64::from(byte) / 16.0
}

/// A mobile packet of memory and energy that triggers cell functions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub energy: f64,
    pub memory: Vec<u8>,
}

impl Token {
    /// Token with zeroed memory of the configured length.
    #[must_use]
    pub fn new(energy: f64, memory_size: usize) -> Self {
        Self {
            energy,
            memory: vec![0; memory_size],
        }
    }

    #[must_use]
    pub fn branch_number(&self) -> u8 {
        self.read(BRANCH_NUMBER)
    }

    pub fn set_branch_number(&mut self, branch: u8) {
        self.write(BRANCH_NUMBER, branch);
    }

    /// Read a memory byte; out-of-range reads yield 0.
    #[must_use]
    pub fn read(&self, offset: usize) -> u8 {
        self.memory.get(offset).copied().unwrap_or(0)
    }

    /// Write a memory byte; out-of-range writes are dropped.
    pub fn write(&mut self, offset: usize, value: u8) {
        if let Some(slot) = self.memory.get_mut(offset) {
            *slot = value;
        }
    }

    /// Copy `payload` into memory starting at `offset`, truncating at the
    /// memory boundary.
    pub fn write_slice(&mut self, offset: usize, payload: &[u8]) {
        for (index, byte) in payload.iter().enumerate() {
            self.write(offset + index, *byte);
        }
    }

    /// Read `len` bytes starting at `offset`, zero-padded past the boundary.
    #[must_use]
    pub fn read_slice(&self, offset: usize, len: usize) -> Vec<u8> {
        (offset..offset + len).map(|i| self.read(i)).collect()
    }
}

/// Split the constructor payload region into (static, mutable) byte runs.
#[must_use]
pub fn read_function_payloads(token: &Token) -> (Vec<u8>, Vec<u8>) {
    let static_len = token.read(constr::DATA) as usize;
    let static_data = token.read_slice(constr::DATA + 1, static_len);
    let mutable_offset = constr::DATA + 1 + static_len;
    let mutable_len = token.read(mutable_offset) as usize;
    let mutable_data = token.read_slice(mutable_offset + 1, mutable_len);
    (static_data, mutable_data)
}

/// Write (static, mutable) payload runs into the constructor data region.
pub fn write_function_payloads(token: &mut Token, static_data: &[u8], mutable_data: &[u8]) {
    token.write(constr::DATA, static_data.len() as u8);
    token.write_slice(constr::DATA + 1, static_data);
    let mutable_offset = constr::DATA + 1 + static_data.len();
    token.write(mutable_offset, mutable_data.len() as u8);
    token.write_slice(mutable_offset + 1, mutable_data);
}
