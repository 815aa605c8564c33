//! # Cadence Common
//!
//! Common types shared by the Cadence audio crates:
//! - ID types (`AudioId`, `SourceId`, `CacheId`)
//! - The audio error taxonomy
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod ids;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::ids::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_id_sequence() {
        let first = AudioId::INVALID.next();
        let second = first.next();
        assert!(first.is_valid());
        assert!(first < second);
        assert_eq!(second.raw(), 2);
    }

    #[test]
    fn test_invalid_audio_id() {
        assert!(!AudioId::INVALID.is_valid());
        assert_eq!(AudioId::default(), AudioId::INVALID);
        assert_eq!(AudioId::INVALID.to_string(), "#invalid");
        assert_eq!(AudioId::from_raw(7).to_string(), "#7");
    }

    #[test]
    fn test_source_id_index() {
        let id = SourceId::new(3);
        assert_eq!(id.index(), 3);
        assert_eq!(id.to_string(), "voice3");
    }
}
