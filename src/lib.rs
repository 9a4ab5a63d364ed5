pub mod config;
pub mod core;
pub mod crypto;
pub mod pow;
pub mod storage;
