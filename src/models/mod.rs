//! Data models for Rigtrack

pub mod conflict;
pub mod enums;
pub mod equipment;
pub mod job;
pub mod usage;

// Re-export commonly used types
pub use conflict::{AllocationConflict, ConflictKind, Resolution};
pub use enums::{EquipmentStatus, LocationKind, SessionStatus, Severity};
pub use equipment::{EquipmentPatch, EquipmentType, EquipmentUnit, StatusChange};
pub use job::{Job, StorageLocation};
pub use usage::{RedTagEvent, UsageSession, UsageStats};
