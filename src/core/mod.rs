//! Core translation engine module

pub mod cache;
pub mod config;
pub mod errors;
pub mod generation;
pub mod hub;
pub mod marian;
pub mod models;
pub mod tokenizer;
pub mod translator;
