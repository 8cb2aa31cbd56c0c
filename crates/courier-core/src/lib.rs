//! Core domain models, errors and persistence for the courier delivery
//! pipeline.
//!
//! Everything that touches PostgreSQL lives under [`storage`]; the delivery
//! crate only sees it through its own storage trait, which keeps worker and
//! scheduler logic testable without a database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptResult, DeliveryAttempt, Message, MessageId, MessageStatus, NewDeliveryAttempt,
    NewMessage, OrgId,
};
pub use time::{Clock, RealClock, TestClock};
