pub mod discovery;
pub mod models;
pub mod pattern;
pub mod selector;
pub mod wake;
