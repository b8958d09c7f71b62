pub mod activities;
pub mod activity_log;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod corrections;
pub mod fragments;
pub mod sharing;
pub mod students;
pub mod uploads;

mod common;
