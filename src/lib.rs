pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod engine;
pub mod error;
pub mod history_check;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod optimizer;
pub mod optimizer_status;
pub mod param_utils;
pub mod performance;
pub mod price_api_client;
pub mod progress;
pub mod request;
pub mod scheduler;
pub mod scoring;
pub mod strategy;
pub mod task_store;
pub mod walkforward;
pub mod windows;
