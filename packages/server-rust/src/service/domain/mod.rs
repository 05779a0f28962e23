//! Domain services at the bottom of the operation pipeline.

pub mod records;

pub use records::RecordService;
