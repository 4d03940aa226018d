//! Watches social-media accounts and relays new posts to chat groups.
//!
//! Pipeline: [`poller::Poller`] → [`source::ContentSource`] →
//! [`queue::QueueBackend`] → [`dispatcher::Dispatcher`] →
//! [`channel::NotificationChannel`], with accounts and groups held by a
//! [`storage::StorageBackend`].

pub mod api;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod poller;
pub mod queue;
pub mod source;
pub mod storage;
