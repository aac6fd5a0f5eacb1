#![doc = include_str!("../README.md")]

pub mod device_traits;
pub mod error;
pub mod io_traits;
pub mod staging;
pub mod types;
