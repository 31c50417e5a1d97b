//! 补丁波次编排服务库
//! 凭证代理、命令下发、完成轮询、补丁校验、人工审批与波次调度

pub mod cloud;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod retry;
pub mod routes;
pub mod services;
pub mod telemetry;
