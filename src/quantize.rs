/// 8-bit "quarter" float encoding with a caller supplied exponent bias.
pub mod quarter;

pub use quarter::{estimate_bias, Quarter};
