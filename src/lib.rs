pub mod app;
pub mod clock;
pub mod config;
pub mod duration;
pub mod prices;
pub mod staleness;
