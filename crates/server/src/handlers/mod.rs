//! HTTP request handlers.

pub mod common;
pub mod downloads;
pub mod files;
pub mod health;
pub mod packages;
pub mod recycle;
pub mod shares;
pub mod uploads;
pub mod users;
