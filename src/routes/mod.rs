pub mod admin;
pub mod bulletins;
pub mod chat;
pub mod comments;
pub mod diary;
pub mod engagement;
pub mod notifications;
pub mod posts;
pub mod users;
