// FlowRelay API - library crate shared by the HTTP service and relayctl

pub mod app;
pub mod auth;
pub mod cli;
pub mod clients;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod relay;
pub mod services;
