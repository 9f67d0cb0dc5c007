pub mod application;
pub mod args;
pub mod terminal;
