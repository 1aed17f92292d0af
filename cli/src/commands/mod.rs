pub mod admin;
pub mod api;
pub mod auth;
pub mod campaigns;
pub mod contacts;
pub mod conversations;
pub mod health;
pub mod webhook;
