pub mod file_service;

pub use file_service::{generate_keys, FileService, KeyPair};
