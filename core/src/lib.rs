pub mod analytics;
pub mod auth;
pub mod campaigns;
pub mod contacts;
pub mod delivery;
pub mod error;
pub mod pagination;
pub mod roles;
pub mod templates;
pub mod webhook;
pub mod window;
