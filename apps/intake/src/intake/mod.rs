//! Durable per-provider sync positions.

pub mod cursor;

pub use cursor::IntakeCursor;
