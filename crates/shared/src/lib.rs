pub mod clock;
pub mod domain;
pub mod error;
pub mod lobby;
pub mod millis;
pub mod protocol;
