//! Truvis 工具集
//!
//! 在各个 crate 和二进制之间共享的工具，目前只有日志初始化。

pub mod init_log;
