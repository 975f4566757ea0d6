//! Sentinel Domain Layer
//!
//! Pure domain logic with zero I/O dependencies.
//! Contains the monitor record, value objects, instrument rules and
//! the arithmetic the protection engine relies on.

#![warn(clippy::all)]

// Public modules
pub mod entities;
pub mod instrument;
pub mod orphan;
pub mod value_objects;

// Re-export commonly used types
pub use entities::{
    calculate_breakeven_price, BreakevenAttempt, BreakevenMethod, EntryLeg, EntryLegStatus,
    MonitorKey, Phase, PhaseChange, PositionMonitor, ProtectionState, ProtectionStatus, SlOrder,
    TpOrder, TpStatus, SCHEMA_VERSION,
};
pub use instrument::{InstrumentRules, TpLadder};
pub use orphan::{Adoption, ObservedKind, ObservedOrder, OrphanPosition};
pub use value_objects::{Account, DomainError, OrderSide, Price, Quantity, Side, Symbol};
