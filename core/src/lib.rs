//! Shared record model and the extractor interface for silo.

mod extract;
mod models;

pub use extract::{ExtractError, Extractor};
pub use models::*;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }
}
