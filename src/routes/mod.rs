//! HTTP route handlers outside the login/refresh/logout flow.
//!
//! `health` and `providers` are public; `users` sits behind the
//! authorization gate.

pub mod health;
pub mod providers;
pub mod users;
