#![allow(
    clippy::len_zero,
    clippy::new_without_default,
    clippy::type_complexity,
    clippy::too_many_arguments
)]

#[macro_use]
mod macros;
pub mod config;
pub mod dbus;
#[cfg(test)]
#[macro_use]
mod it;
mod utils;

pub use {
    config::{ConfigError, ConnectionConfig},
    utils::errorfmt::ErrorFmt,
};
