pub mod admin;
pub mod auth;
pub mod campaigns;
pub mod contacts;
pub mod conversations;
pub mod health;
pub mod profiles;
pub mod teams;
pub mod templates;
pub mod webhooks;
