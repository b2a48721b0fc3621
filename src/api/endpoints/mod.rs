//! API endpoint handlers.

pub mod predict;
