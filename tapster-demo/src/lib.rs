pub mod error;
pub mod launcher;
pub mod logging;
