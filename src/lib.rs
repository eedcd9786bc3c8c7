//! Collects YuniKorn scheduler state-change events, counts them in memory and
//! projects scheduler state into PostgreSQL.

pub mod collector;
pub mod config;
pub mod event;
pub mod export;
pub mod model;
pub mod repository;
pub mod yunikorn;
