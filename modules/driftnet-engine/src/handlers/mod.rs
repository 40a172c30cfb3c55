pub mod api;
pub mod document;
pub mod feed;
pub mod question;
pub mod web;
