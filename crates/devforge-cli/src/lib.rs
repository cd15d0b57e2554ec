pub mod cli;
pub mod http_model;
