#![cfg_attr(not(test), no_std)]

#![allow(clippy::new_without_default)]

// must stay first so the logging macros are visible to every module below
#[macro_use]
mod fmt;

pub mod config;
pub mod drivers;
pub mod event;
pub mod filter;
pub mod manager;
pub mod power;
pub mod registry;
pub mod tasks;
pub mod time;
