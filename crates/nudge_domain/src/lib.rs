pub mod calculator;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod notifications;
pub mod occurrence;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod task;

pub use crate::engine::NotificationEngine;
pub use crate::error::{DeliveryError, ServiceError, StoreError, ValidationError};
pub use crate::service::{ReminderService, ReminderServiceBuilder, TaskOverview, TaskUpdate};
