pub mod config;
pub mod model;
pub mod protocol;
pub mod session;
pub mod turn;
pub mod usage;
