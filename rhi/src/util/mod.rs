/// Utility containers
pub mod slot_map;
