pub mod code;
pub mod db;
