pub mod bands;
pub mod config;
pub mod platform;
pub mod protocol;
pub mod track;
