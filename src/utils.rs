pub mod formatting;
pub mod logging;
