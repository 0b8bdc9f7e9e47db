pub mod canvas;
pub mod context;
pub mod errors;
pub mod models;
pub mod providers;
pub mod proxy;
pub mod store;
pub mod vault;
pub mod webhook;
