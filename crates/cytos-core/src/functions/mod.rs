//! Programmable cell functions.
//!
//! Every cell carries one function variant; a token whose branch number
//! matches the cell's triggers it. Dispatch is a single `match` in the
//! shard step. The constructor is the involved one; the others follow the
//! same token-in/token-out contract over fixed memory offsets.

use crate::descriptions::{CellFunctionDescription, CellFunctionKind};
use crate::entities::{CellKey, Cluster};
use crate::token::{self, Token};
use crate::SimulationParameters;

pub mod computer;
pub mod constructor;

pub use computer::ComputerState;

/// State shared by communicator cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommunicatorState {
    /// Last byte received from any communicator in range.
    pub received: u8,
}

/// A cell's programmable behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum CellFunction {
    Computer(ComputerState),
    Constructor,
    Scanner,
    Weapon,
    Sensor,
    Communicator(CommunicatorState),
}

impl CellFunction {
    #[must_use]
    pub fn kind(&self) -> CellFunctionKind {
        match self {
            Self::Computer(_) => CellFunctionKind::Computer,
            Self::Constructor => CellFunctionKind::Constructor,
            Self::Scanner => CellFunctionKind::Scanner,
            Self::Weapon => CellFunctionKind::Weapon,
            Self::Sensor => CellFunctionKind::Sensor,
            Self::Communicator(_) => CellFunctionKind::Communicator,
        }
    }

    /// Build a function from its snapshot.
    ///
    /// Computer programs are truncated to the instruction budget and the
    /// cell memory is resized to the configured length; other kinds carry
    /// no payload.
    #[must_use]
    pub fn from_description(desc: &CellFunctionDescription, params: &SimulationParameters) -> Self {
        match desc.kind {
            CellFunctionKind::Computer => {
                let mut program = desc.static_data.clone();
                program.truncate(params.cell_function_computer_max_instructions * 3);
                let mut memory = desc.mutable_data.clone();
                memory.resize(params.cell_function_computer_cell_memory_size, 0);
                Self::Computer(ComputerState { program, memory })
            }
            CellFunctionKind::Constructor => Self::Constructor,
            CellFunctionKind::Scanner => Self::Scanner,
            CellFunctionKind::Weapon => Self::Weapon,
            CellFunctionKind::Sensor => Self::Sensor,
            CellFunctionKind::Communicator => Self::Communicator(CommunicatorState {
                received: desc.mutable_data.first().copied().unwrap_or(0),
            }),
        }
    }

    #[must_use]
    pub fn to_description(&self) -> CellFunctionDescription {
        match self {
            Self::Computer(state) => CellFunctionDescription {
                kind: CellFunctionKind::Computer,
                static_data: state.program.clone(),
                mutable_data: state.memory.clone(),
            },
            Self::Communicator(state) => CellFunctionDescription {
                kind: CellFunctionKind::Communicator,
                static_data: Vec::new(),
                mutable_data: vec![state.received],
            },
            other => CellFunctionDescription::with_kind(other.kind()),
        }
    }
}

/// Scanner: report the host cell's shape into the token memory.
pub fn scan(cluster: &Cluster, host: CellKey, token: &mut Token) {
    let Some(cell) = cluster.cells.get(host) else {
        return;
    };
    token.write(token::scanner::OUT_ENERGY, cell.energy.clamp(0.0, 255.0) as u8);
    token.write(
        token::scanner::OUT_CONNECTIONS,
        cell.connections.len().min(255) as u8,
    );
    token.write(
        token::scanner::OUT_MAX_CONNECTIONS,
        cell.max_connections.min(255) as u8,
    );
    token.write(
        token::scanner::OUT_FUNCTION,
        cell.function.kind().as_byte(),
    );
    token.write(
        token::scanner::OUT_CLUSTER_SIZE,
        cluster.cells.len().min(255) as u8,
    );
}
