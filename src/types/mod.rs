//! Core data types shared by the server components

pub mod record;

pub use record::Record;
