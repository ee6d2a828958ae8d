pub mod abtest;
pub mod api;
pub mod budget;
pub mod cache;
pub mod config;
pub mod engine;
pub mod models;
pub mod segments;
pub mod selection;
pub mod stats;
pub mod storage;
pub mod targeting;
