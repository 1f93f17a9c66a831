//! Convenience re-exports for the common surface.
//!
//! ```rust
//! use cloudburst::prelude::*;
//! ```

pub use crate::{
    CleanupOptions, DriverError, Funnel, FunnelError, Instance, InvokeError, LogEvent, Mode,
    Options, ProviderDriver, RateLimitedFunnel, ReturnPayload,
};
