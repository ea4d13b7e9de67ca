//! Search assistant onboarding: the four-step setup wizard and the backend
//! calls behind it.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod onboarding;
