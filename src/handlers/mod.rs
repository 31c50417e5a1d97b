//! HTTP 处理器模块

pub mod callback;
pub mod execution;
pub mod health;
pub mod steps;
