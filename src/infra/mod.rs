pub mod db;
pub mod memory;
pub mod queue;
pub mod repository;
pub mod storage;
