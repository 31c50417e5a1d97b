//! 数据模型模块

pub mod analysis;
pub mod approval;
pub mod audit;
pub mod command;
pub mod credentials;
pub mod execution;
pub mod patch;
pub mod steps;
pub mod target;
