#![doc = include_str!("../README.md")]

pub mod backend;
pub mod device;
pub mod error;
pub mod geometry;
pub mod registry;
pub mod services;
pub mod types;
