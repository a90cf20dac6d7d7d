//! 测试模块根目录
//!
//! 导出所有功能模块的测试

pub mod memory;
pub mod non_blocking;
pub mod two_layer;
