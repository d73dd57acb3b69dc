pub mod truncgil;

pub use truncgil::{TruncgilConfig, TruncgilSource};
