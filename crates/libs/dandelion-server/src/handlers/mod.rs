pub mod access;
pub mod appconfig;
